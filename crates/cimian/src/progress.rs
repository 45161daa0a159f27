// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Session-scoped progress model. Every state change fans out to
//! subscribers over bounded queues (events are dropped rather than
//! back-pressuring an installer) and the full snapshot is mirrored
//! atomically to `progress.json` in the session log directory.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        mpsc::{sync_channel, Receiver, SyncSender, TrySendError},
        Mutex,
    },
    time::Instant,
};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{catalog::InstallerKind, util};

/// Queue depth per subscriber.
const SUBSCRIBER_QUEUE: usize = 256;

/// Lifecycle state of a tracked item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Known to the session, not yet started.
    Pending,
    /// Artifact transfer in flight.
    Downloading,
    /// Native installer running.
    Installing,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Finished with a non-fatal caveat.
    Warning,
    /// Nothing to do, or held back.
    Skipped,
    /// Evaluated only; the run was check-only.
    Knowledge,
}

impl ItemStatus {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Warning | Self::Skipped | Self::Knowledge
        )
    }
}

/// Transfer sub-state while an artifact downloads.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct DownloadState {
    /// Total bytes expected, when the server told us.
    pub total_bytes: u64,
    /// Bytes on disk so far.
    pub downloaded_bytes: u64,
    /// 0–100.
    pub percent: u8,
    /// Observed transfer rate.
    pub bytes_per_second: u64,
    /// Estimated seconds remaining, when computable.
    pub eta_seconds: u64,
}

/// Installer sub-state while the native tool runs.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct InstallState {
    /// Current phase name from the per-type phase list.
    pub phase: String,
    /// Index of the current phase.
    pub phase_index: usize,
    /// Number of phases for this installer type.
    pub phase_count: usize,
}

/// One tracked item.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ProgressItem {
    /// Catalog item name.
    pub name: String,
    /// Human-facing name.
    pub display_name: String,
    /// Lifecycle state.
    pub status: ItemStatus,
    /// Waterfall phase label.
    pub phase: String,
    /// Overall 0–100 progress.
    pub progress: u8,
    /// Download sub-state, while downloading.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<DownloadState>,
    /// Install sub-state, while installing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install: Option<InstallState>,
    /// Failure detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Non-fatal caveat, e.g. a pending reboot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// RFC 3339 creation time.
    pub started_at: String,
    /// RFC 3339 time of the last change.
    pub updated_at: String,
}

/// Aggregate counts recomputed whenever an item finishes.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct SessionSummary {
    /// Session id the counts belong to.
    pub session_id: String,
    /// Items known to the session.
    pub total: usize,
    /// Items completed (including those with warnings).
    pub completed: usize,
    /// Items failed.
    pub failed: usize,
    /// Items with warnings.
    pub warnings: usize,
    /// Items skipped or knowledge-only.
    pub skipped: usize,
    /// The item currently in flight, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_item: Option<String>,
}

/// Full state mirrored to `progress.json`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ProgressSnapshot {
    /// Session id.
    pub session_id: String,
    /// RFC 3339 time this snapshot was produced.
    pub generated_at: String,
    /// All tracked items, in registration order.
    pub items: Vec<ProgressItem>,
    /// The aggregate counts.
    pub summary: SessionSummary,
}

/// One broadcast message.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// An item changed state.
    Item(ProgressItem),
    /// The aggregate counts changed.
    Summary(SessionSummary),
}

/// Ordered phase labels per installer type.
pub fn phases_for(kind: InstallerKind) -> &'static [&'static str] {
    match kind {
        InstallerKind::Msi => &[
            "Preparing",
            "Validating",
            "Extracting",
            "Installing",
            "Configuring",
            "Finalizing",
        ],
        InstallerKind::Exe => &[
            "Preparing",
            "Launching",
            "Installing",
            "Configuring",
            "Finalizing",
        ],
        InstallerKind::Nupkg => &[
            "Preparing",
            "Extracting",
            "Dependencies",
            "Installing",
            "Scripts",
            "Finalizing",
        ],
        InstallerKind::Powershell => &["Preparing", "Loading", "Executing", "Finalizing"],
        InstallerKind::Msix => &[
            "Preparing",
            "Validating",
            "Registering",
            "Installing",
            "Finalizing",
        ],
        InstallerKind::ScriptOnly => &["Preparing", "Executing", "Finalizing"],
    }
}

struct TrackerInner {
    items: Vec<ProgressItem>,
    index: HashMap<String, usize>,
    download_started: HashMap<String, Instant>,
}

/// Thread-safe, session-scoped progress model.
pub struct ProgressTracker {
    session_id: String,
    mirror_path: Option<PathBuf>,
    inner: Mutex<TrackerInner>,
    subscribers: Mutex<Vec<SyncSender<ProgressEvent>>>,
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

impl ProgressTracker {
    /// A tracker for `session_id`, mirroring snapshots to `mirror_path`
    /// when given.
    pub fn new(session_id: &str, mirror_path: Option<PathBuf>) -> Self {
        Self {
            session_id: session_id.to_string(),
            mirror_path,
            inner: Mutex::new(TrackerInner {
                items: Vec::new(),
                index: HashMap::new(),
                download_started: HashMap::new(),
            }),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribes to state changes. The queue is bounded; when a subscriber
    /// lags, events for it are dropped rather than stalling the publisher.
    pub fn subscribe(&self) -> Receiver<ProgressEvent> {
        let (tx, rx) = sync_channel(SUBSCRIBER_QUEUE);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Adds an item in `pending` state. Registering a known name is a no-op.
    pub fn register(&self, name: &str, display_name: &str) {
        let mut changed = None;
        {
            let mut inner = self.inner.lock().unwrap();
            let key = name.to_ascii_lowercase();
            if let Some(&slot) = inner.index.get(&key) {
                // a later registration may bring the catalog display name
                if !display_name.is_empty() && inner.items[slot].display_name != display_name {
                    inner.items[slot].display_name = display_name.to_string();
                }
            } else {
                let timestamp = now_rfc3339();
                let item = ProgressItem {
                    name: name.to_string(),
                    display_name: if display_name.is_empty() {
                        name.to_string()
                    } else {
                        display_name.to_string()
                    },
                    status: ItemStatus::Pending,
                    phase: "Pending".into(),
                    progress: 0,
                    download: None,
                    install: None,
                    error: None,
                    warning: None,
                    started_at: timestamp.clone(),
                    updated_at: timestamp,
                };
                let idx = inner.items.len();
                inner.index.insert(key, idx);
                inner.items.push(item.clone());
                changed = Some(item);
            }
        }
        if let Some(item) = changed {
            self.publish(ProgressEvent::Item(item));
            self.mirror();
        }
    }

    fn update<F>(&self, name: &str, mutate: F)
    where
        F: FnOnce(&mut ProgressItem, &mut HashMap<String, Instant>),
    {
        let mut changed = None;
        let mut summary_changed = None;
        {
            let mut inner = self.inner.lock().unwrap();
            let key = name.to_ascii_lowercase();
            let Some(&slot) = inner.index.get(&key) else {
                tracing::debug!("progress update for unregistered item `{name}` ignored");
                return;
            };
            let TrackerInner {
                items,
                download_started,
                ..
            } = &mut *inner;
            let item = &mut items[slot];
            mutate(item, download_started);
            item.updated_at = now_rfc3339();
            changed = Some(item.clone());
            if item.status.is_terminal() {
                summary_changed = Some(Self::summarize(&self.session_id, items));
            }
        }
        if let Some(item) = changed {
            self.publish(ProgressEvent::Item(item));
        }
        if let Some(summary) = summary_changed {
            self.publish(ProgressEvent::Summary(summary));
        }
        self.mirror();
    }

    /// Marks the artifact transfer started.
    pub fn begin_download(&self, name: &str) {
        self.update(name, |item, started| {
            item.status = ItemStatus::Downloading;
            item.phase = "Downloading".into();
            item.download = Some(DownloadState::default());
            started.insert(item.name.to_ascii_lowercase(), Instant::now());
        });
    }

    /// Records transfer progress. Byte counts never move backwards.
    pub fn download_progress(&self, name: &str, downloaded: u64, total: Option<u64>) {
        self.update(name, |item, started| {
            let state = item.download.get_or_insert_with(DownloadState::default);
            if downloaded < state.downloaded_bytes {
                return;
            }
            state.downloaded_bytes = downloaded;
            if let Some(total) = total {
                state.total_bytes = total;
                if total > 0 {
                    state.percent = ((downloaded.saturating_mul(100)) / total).min(100) as u8;
                    item.progress = state.percent;
                }
            }
            if let Some(start) = started.get(&item.name.to_ascii_lowercase()) {
                let elapsed = start.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    state.bytes_per_second = (downloaded as f64 / elapsed) as u64;
                    if state.bytes_per_second > 0 && state.total_bytes >= downloaded {
                        state.eta_seconds =
                            (state.total_bytes - downloaded) / state.bytes_per_second;
                    }
                }
            }
        });
    }

    /// Moves the item into the installing state with the first phase of its
    /// installer type.
    pub fn begin_install(&self, name: &str, kind: InstallerKind) {
        let phases = phases_for(kind);
        self.update(name, |item, _| {
            item.status = ItemStatus::Installing;
            item.download = None;
            item.phase = phases[0].to_string();
            item.progress = 0;
            item.install = Some(InstallState {
                phase: phases[0].to_string(),
                phase_index: 0,
                phase_count: phases.len(),
            });
        });
    }

    /// Advances to the next phase of the current installer type.
    pub fn advance_phase(&self, name: &str, kind: InstallerKind) {
        let phases = phases_for(kind);
        self.update(name, |item, _| {
            let state = item.install.get_or_insert_with(|| InstallState {
                phase: phases[0].to_string(),
                phase_index: 0,
                phase_count: phases.len(),
            });
            if state.phase_index + 1 < phases.len() {
                state.phase_index += 1;
                state.phase = phases[state.phase_index].to_string();
                item.phase = state.phase.clone();
                item.progress =
                    (((state.phase_index + 1) * 100) / phases.len()).min(100) as u8;
            }
        });
    }

    /// Marks the item done. A warning set earlier is preserved and the item
    /// lands in `completed` regardless.
    pub fn complete(&self, name: &str) {
        self.update(name, |item, _| {
            item.status = ItemStatus::Completed;
            item.phase = "Completed".into();
            item.progress = 100;
            item.install = None;
        });
    }

    /// Marks the item failed with a diagnostic.
    pub fn fail(&self, name: &str, error: &str) {
        self.update(name, |item, _| {
            item.status = ItemStatus::Failed;
            item.phase = "Failed".into();
            item.error = Some(error.to_string());
            item.install = None;
        });
    }

    /// Attaches a non-fatal caveat without changing the lifecycle state.
    pub fn set_warning(&self, name: &str, warning: &str) {
        self.update(name, |item, _| {
            item.warning = Some(warning.to_string());
            if item.status.is_terminal() && item.status != ItemStatus::Failed {
                item.status = ItemStatus::Warning;
            }
        });
    }

    /// Marks the item as requiring no work (or held back by blockers).
    pub fn skip(&self, name: &str, reason: &str) {
        self.update(name, |item, _| {
            item.status = ItemStatus::Skipped;
            item.phase = reason.to_string();
            item.install = None;
        });
    }

    /// Marks the item as evaluated only, for check-only runs.
    pub fn knowledge(&self, name: &str, verdict: &str) {
        self.update(name, |item, _| {
            item.status = ItemStatus::Knowledge;
            item.phase = verdict.to_string();
        });
    }

    fn summarize(session_id: &str, items: &[ProgressItem]) -> SessionSummary {
        let mut summary = SessionSummary {
            session_id: session_id.to_string(),
            total: items.len(),
            ..Default::default()
        };
        for item in items {
            match item.status {
                ItemStatus::Completed | ItemStatus::Warning => {
                    summary.completed += 1;
                    if item.status == ItemStatus::Warning || item.warning.is_some() {
                        summary.warnings += 1;
                    }
                }
                ItemStatus::Failed => summary.failed += 1,
                ItemStatus::Skipped | ItemStatus::Knowledge => summary.skipped += 1,
                ItemStatus::Downloading | ItemStatus::Installing => {
                    summary.current_item = Some(item.name.clone());
                }
                ItemStatus::Pending => (),
            }
        }
        summary
    }

    /// The current aggregate counts.
    pub fn summary(&self) -> SessionSummary {
        let inner = self.inner.lock().unwrap();
        Self::summarize(&self.session_id, &inner.items)
    }

    /// A full copy of the session state.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let inner = self.inner.lock().unwrap();
        ProgressSnapshot {
            session_id: self.session_id.clone(),
            generated_at: now_rfc3339(),
            items: inner.items.clone(),
            summary: Self::summarize(&self.session_id, &inner.items),
        }
    }

    fn publish(&self, event: ProgressEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            // a slow consumer loses this event but stays subscribed
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    fn mirror(&self) {
        let Some(path) = &self.mirror_path else {
            return;
        };
        let snapshot = self.snapshot();
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = util::replace_file_atomic(path, &bytes) {
                    tracing::debug!("progress mirror write failed: {e}");
                }
            }
            Err(e) => tracing::debug!("progress snapshot serialization failed: {e}"),
        }
    }
}
