// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Per-run session state: identity, log directory and cancellation.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use time::{format_description::FormatItem, macros::format_description, OffsetDateTime};

use crate::{util, Error};

/// Session ids double as log directory names.
const SESSION_ID_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]-[hour][minute][second]");

const LOG_TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Cooperative cancellation shared across the run.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. In-flight downloads stop at the next chunk;
    /// the orchestrator stops before the next item.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One run of the agent: a timestamped identity, its log directory and the
/// line-oriented human log.
pub struct Session {
    id: String,
    log_dir: PathBuf,
    started: OffsetDateTime,
    verbosity: u8,
    install_log: Mutex<Option<File>>,
    cancel: CancelToken,
}

impl Session {
    /// Creates the session and its log directory under `logs_root`.
    pub fn new(logs_root: &Path, verbosity: u8) -> crate::Result<Self> {
        let started = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let id = started.format(SESSION_ID_FORMAT)?;
        let log_dir = logs_root.join(&id);
        std::fs::create_dir_all(&log_dir)
            .map_err(|e| Error::IoWithPath(log_dir.clone(), e))?;
        let install_log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("install.log"))
            .ok();
        Ok(Self {
            id,
            log_dir,
            started,
            verbosity,
            install_log: Mutex::new(install_log),
            cancel: CancelToken::new(),
        })
    }

    /// Session for tests: logs under a scratch directory, silent verbosity.
    pub fn for_tests(scratch: &Path) -> Self {
        Self::new(scratch, 0).expect("session scratch dir")
    }

    /// The timestamp-derived session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Directory holding this run's logs and progress mirror.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// When the run started.
    pub fn started(&self) -> OffsetDateTime {
        self.started
    }

    /// Requested verbosity, 0–3.
    pub fn verbosity(&self) -> u8 {
        self.verbosity
    }

    /// This run's cancellation token.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Path for a per-backend native log, e.g. `msi_install.log`.
    pub fn native_log_path(&self, file_name: &str) -> PathBuf {
        self.log_dir.join(file_name)
    }

    /// Appends one line to `install.log`, mirrored to tracing.
    pub fn log_line(&self, level: tracing::Level, message: &str) {
        match level {
            tracing::Level::ERROR => tracing::error!("{message}"),
            tracing::Level::WARN => tracing::warn!("{message}"),
            _ => tracing::info!("{message}"),
        }
        let timestamp = OffsetDateTime::now_local()
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
            .format(LOG_TIMESTAMP_FORMAT)
            .unwrap_or_default();
        if let Some(file) = self.install_log.lock().unwrap().as_mut() {
            let _ = writeln!(file, "{timestamp} {level} {message}");
        }
    }

    /// Human-readable location of this session's logs.
    pub fn display_log_dir(&self) -> String {
        util::display_path(&self.log_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_creates_timestamped_log_dir() {
        let scratch = tempfile::tempdir().unwrap();
        let session = Session::new(scratch.path(), 1).unwrap();
        assert!(session.log_dir().is_dir());
        // YYYY-MM-DD-HHMMss
        assert_eq!(session.id().len(), "2025-01-02-030405".len());
        session.log_line(tracing::Level::INFO, "starting run");
        let contents =
            std::fs::read_to_string(session.log_dir().join("install.log")).unwrap();
        assert!(contents.contains("starting run"));
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
