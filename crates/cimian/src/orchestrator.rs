// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Turns the manifest expansion into an ordered execution plan and drives it.
//!
//! The walk is deliberately sequential: native installers serialize on
//! machine-wide locks, and the graph invariants (prerequisites before their
//! dependents, companion updates after the main item, dependent removals
//! before the target) only hold when one item runs at a time. Each node is
//! marked processed *before* recursing into its edges, so cyclic graphs are
//! walked exactly once instead of erroring.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
};

use crate::{
    catalog::{CatalogIndex, Item},
    download::{download_artifact, DownloadReporter, RepoClient},
    installer::{DispatchOutput, DispatchRequest, Dispatcher, Outcome},
    manifest::{ManifestEntry, ManifestExpansion, SelfServiceManifest},
    progress::ProgressTracker,
    session::Session,
    status::{verify_installs_assertions, Action, StatusEvaluator},
    store::InstalledVersionStore,
    util, version, Error,
};

/// Why an item entered the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Listed in a manifest's managed installs.
    ManagedInstall,
    /// Listed in a manifest's managed updates.
    ManagedUpdate,
    /// Listed in a manifest's managed uninstalls.
    ManagedUninstall,
    /// Opted into from the optional list.
    OptionalInstall,
    /// Pulled in as a hard prerequisite.
    Requires,
    /// Pulled in from the legacy flat dependency list.
    Dependency,
    /// Companion update dispatched after its main item.
    UpdateFor,
    /// Removed because it depends on an item being uninstalled.
    DependentRemoval,
    /// Removed because it was a companion update of the target.
    UpdateRemoval,
}

impl Role {
    /// The edge label used in source chains.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ManagedInstall => "managed_installs",
            Self::ManagedUpdate => "managed_updates",
            Self::ManagedUninstall => "managed_uninstalls",
            Self::OptionalInstall => "optional_installs",
            Self::Requires => "requires",
            Self::Dependency => "dependency-chain",
            Self::UpdateFor => "update_for",
            Self::DependentRemoval => "dependent_removal",
            Self::UpdateRemoval => "update_removal",
        }
    }
}

/// Traceability back to the manifest line that caused an item to run.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    /// The originating manifest.
    pub manifest: String,
    /// The role this item entered the plan with.
    pub role: Role,
    /// Edges from the originating list entry down to this item.
    pub chain: Vec<String>,
}

impl SourceRecord {
    /// A record for an item named directly by a manifest list.
    pub fn root(manifest: &str, role: Role) -> Self {
        Self {
            manifest: manifest.to_string(),
            role,
            chain: vec![format!("{}:{}", role.tag(), manifest)],
        }
    }

    /// A record for an item reached through `parent`.
    pub fn derived(&self, role: Role, parent: &str) -> Self {
        let mut chain = self.chain.clone();
        chain.push(format!("{}:{}->{}", role.tag(), self.manifest, parent));
        Self {
            manifest: self.manifest.clone(),
            role,
            chain,
        }
    }

    /// Human-readable provenance for log lines.
    pub fn describe(&self) -> String {
        self.chain.join(" | ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Done,
    Held,
    Failed,
}

/// Overall disposition of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Everything requested succeeded or needed nothing.
    Success,
    /// Some items failed, but not all.
    Warnings,
}

/// What a run did, for the session summary and exit code.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Items installed or updated this run.
    pub installed: Vec<String>,
    /// Items removed this run.
    pub removed: Vec<String>,
    /// Item failures, with their diagnostics.
    pub failed: Vec<(String, String)>,
    /// The aggregate outcome.
    pub outcome: Option<RunOutcome>,
}

/// Everything a run needs, wired up by the caller.
pub struct RunContext<'a> {
    /// Catalog lookups.
    pub index: &'a CatalogIndex,
    /// Installed-version records.
    pub store: &'a dyn InstalledVersionStore,
    /// Installer backends.
    pub dispatcher: &'a dyn Dispatcher,
    /// Repository access for artifact staging.
    pub repo: &'a dyn RepoClient,
    /// Progress fan-out.
    pub tracker: Arc<ProgressTracker>,
    /// The session.
    pub session: &'a Session,
    /// Artifact cache directory.
    pub cache_dir: PathBuf,
    /// Evaluate only; dispatch nothing.
    pub check_only: bool,
    /// The writable self-service manifest, when one exists.
    pub self_service: Option<SelfServiceManifest>,
}

struct TrackerReporter<'a> {
    tracker: &'a ProgressTracker,
    name: &'a str,
}

impl DownloadReporter for TrackerReporter<'_> {
    fn progress(&self, downloaded: u64, total: Option<u64>) {
        self.tracker.download_progress(self.name, downloaded, total);
    }
}

/// One run's walk state. Constructed fresh per run and discarded afterwards,
/// which is what resets the processed sets and the source map.
pub struct Orchestrator<'a> {
    ctx: RunContext<'a>,
    processed_installs: HashSet<String>,
    processed_uninstalls: HashSet<String>,
    succeeded: HashSet<String>,
    failed_items: HashSet<String>,
    sources: HashMap<String, SourceRecord>,
    report: RunReport,
}

impl<'a> Orchestrator<'a> {
    /// A fresh orchestrator over `ctx`.
    pub fn new(ctx: RunContext<'a>) -> Self {
        Self {
            ctx,
            processed_installs: HashSet::new(),
            processed_uninstalls: HashSet::new(),
            succeeded: HashSet::new(),
            failed_items: HashSet::new(),
            sources: HashMap::new(),
            report: RunReport::default(),
        }
    }

    /// The source map built during the walk, keyed by lowercased item name.
    pub fn sources(&self) -> &HashMap<String, SourceRecord> {
        &self.sources
    }

    /// Executes the expansion. Per-item failures are recorded and the run
    /// continues; the only failing outcomes are cancellation, configuration
    /// errors, and the whole requested batch failing.
    pub fn run(mut self, expansion: &ManifestExpansion) -> crate::Result<RunReport> {
        let optional: HashSet<String> = expansion
            .optional_installs
            .iter()
            .map(|e| e.name.to_ascii_lowercase())
            .collect();

        for entry in &expansion.managed_installs {
            let role = if optional.contains(&entry.name.to_ascii_lowercase()) {
                Role::OptionalInstall
            } else {
                Role::ManagedInstall
            };
            self.guarded_install(entry, role)?;
        }
        for entry in &expansion.managed_updates {
            self.guarded_install(entry, Role::ManagedUpdate)?;
        }
        for entry in &expansion.managed_uninstalls {
            if self.ctx.session.cancel_token().is_cancelled() {
                return Err(Error::Cancelled);
            }
            let source = SourceRecord::root(&entry.manifest, Role::ManagedUninstall);
            self.uninstall_item(&entry.name, source)?;
        }

        self.finish(expansion)
    }

    fn guarded_install(&mut self, entry: &ManifestEntry, role: Role) -> crate::Result<()> {
        if self.ctx.session.cancel_token().is_cancelled() {
            return Err(Error::Cancelled);
        }
        let source = SourceRecord::root(&entry.manifest, role);
        self.install_item(&entry.name, source)?;
        Ok(())
    }

    fn finish(mut self, expansion: &ManifestExpansion) -> crate::Result<RunReport> {
        let requested: HashSet<String> = expansion
            .managed_installs
            .iter()
            .chain(&expansion.managed_updates)
            .chain(&expansion.managed_uninstalls)
            .map(|e| e.name.to_ascii_lowercase())
            .collect();
        let mut failed_requested: Vec<String> = Vec::new();
        for (name, _) in &self.report.failed {
            if requested.contains(&name.to_ascii_lowercase())
                && !failed_requested.iter().any(|n| n.eq_ignore_ascii_case(name))
            {
                failed_requested.push(name.clone());
            }
        }

        if !requested.is_empty() && failed_requested.len() == requested.len() {
            return Err(Error::BatchFailed(failed_requested));
        }

        self.report.outcome = Some(if self.report.failed.is_empty() {
            RunOutcome::Success
        } else {
            RunOutcome::Warnings
        });

        let summary = self.ctx.tracker.summary();
        self.ctx.session.log_line(
            tracing::Level::INFO,
            &format!(
                "run finished: {} installed, {} removed, {} failed ({} tracked items)",
                self.report.installed.len(),
                self.report.removed.len(),
                self.report.failed.len(),
                summary.total,
            ),
        );

        Ok(self.report)
    }

    fn record_failure(&mut self, name: &str, source: &SourceRecord, error: &Error) {
        let message = format!("{error} (source: {})", source.describe());
        self.ctx.session.log_line(tracing::Level::ERROR, &message);
        self.ctx.tracker.fail(name, &message);
        self.failed_items.insert(name.to_ascii_lowercase());
        self.report.failed.push((name.to_string(), message));
    }

    /// Installs `name` and everything it pulls in. `Ok(true)` means the item
    /// is usable (installed now, already present, or legitimately skipped);
    /// `Ok(false)` means it failed and the failure has been recorded.
    fn install_item(&mut self, name: &str, source: SourceRecord) -> crate::Result<bool> {
        let key = name.to_ascii_lowercase();
        if self.processed_installs.contains(&key) {
            return Ok(true);
        }
        // Marked before any recursion so requirement cycles terminate.
        self.processed_installs.insert(key.clone());
        self.sources.entry(key.clone()).or_insert_with(|| source.clone());
        self.ctx.tracker.register(name, "");

        let Some(item) = self.ctx.index.find(name) else {
            self.record_failure(
                name,
                &source,
                &Error::ItemNotFound(name.to_string(), source.manifest.clone()),
            );
            return Ok(false);
        };

        self.ctx.tracker.register(&item.name, item.label());

        if !item.supports_architecture(self.ctx.index.host_arch()) {
            tracing::info!(
                "`{}` does not support {}, skipping",
                item.name,
                self.ctx.index.host_arch()
            );
            self.ctx.tracker.skip(&item.name, "Unsupported architecture");
            return Ok(true);
        }

        // Hard prerequisites complete before this item may start.
        for (reference, role) in item
            .requires
            .iter()
            .map(|r| (r, Role::Requires))
            .chain(item.dependencies.iter().map(|r| (r, Role::Dependency)))
        {
            let (dep_name, dep_version) = version::split_name_version(reference);
            // A dependency that already failed this run fails its parent
            // even though it is in the processed set.
            let already_failed = self
                .failed_items
                .contains(&dep_name.to_ascii_lowercase());
            if !already_failed && self.dependency_satisfied(dep_name, dep_version) {
                continue;
            }
            let child_source = source.derived(role, &item.name);
            if already_failed || !self.install_item(dep_name, child_source)? {
                let error = Error::RequiredDependencyFailed {
                    item: item.name.clone(),
                    dependency: dep_name.to_string(),
                };
                self.record_failure(&item.name, &source, &error);
                return Ok(false);
            }
        }

        match self.dispatch_install(&item, &source)? {
            Disposition::Done => {
                self.succeeded.insert(key);
                // Companion updates follow the main item; their failures warn.
                for update_name in self.ctx.index.updates_for(&item.name) {
                    let child_source = source.derived(Role::UpdateFor, &item.name);
                    match self.install_item(&update_name, child_source) {
                        Ok(true) => (),
                        Ok(false) => tracing::warn!(
                            "companion update `{update_name}` of `{}` failed",
                            item.name
                        ),
                        Err(e) => return Err(e),
                    }
                }
                Ok(true)
            }
            // Held back, but not a failure; dependents may proceed.
            Disposition::Held => Ok(true),
            Disposition::Failed => Ok(false),
        }
    }

    fn dependency_satisfied(&self, dep_name: &str, dep_version: Option<&str>) -> bool {
        let key = dep_name.to_ascii_lowercase();
        // Scheduled earlier in this run (or mid-recursion in a cycle).
        if self.processed_installs.contains(&key) {
            return true;
        }
        match self.ctx.store.get(dep_name) {
            Ok(Some(installed)) => match dep_version {
                Some(wanted) => version::compare(&installed, wanted) == std::cmp::Ordering::Equal,
                None => true,
            },
            _ => false,
        }
    }

    /// Runs the actual install of one item, staging its artifact first.
    fn dispatch_install(
        &mut self,
        item: &Item,
        source: &SourceRecord,
    ) -> crate::Result<Disposition> {
        let action = if source.role == Role::ManagedUpdate {
            Action::Update
        } else {
            Action::Install
        };

        let script_only = item.is_script_only();
        if !script_only && !item.on_demand {
            let evaluator = StatusEvaluator::new(self.ctx.store);
            if !evaluator.action_required(item, action) {
                tracing::debug!("`{}` needs no {}", item.name, action.tag());
                self.ctx.tracker.skip(&item.name, "Up to date");
                return Ok(Disposition::Done);
            }
        }

        if self.ctx.check_only {
            self.ctx
                .tracker
                .knowledge(&item.name, &format!("{} required", action.tag()));
            return Ok(Disposition::Done);
        }

        // Stage the artifact when the item has one.
        let mut artifact: Option<PathBuf> = None;
        if let Some(installer) = &item.installer {
            if !installer.location.trim().is_empty() {
                let dest = self
                    .ctx
                    .cache_dir
                    .join(installer.location.replace('\\', "/").trim_start_matches('/'));
                self.ctx.tracker.begin_download(&item.name);
                let reporter = TrackerReporter {
                    tracker: &self.ctx.tracker,
                    name: &item.name,
                };
                if let Err(e) = download_artifact(
                    self.ctx.repo,
                    &installer.location,
                    &dest,
                    &installer.hash,
                    installer.size,
                    &reporter,
                    self.ctx.session.cancel_token(),
                ) {
                    if matches!(e, Error::Cancelled) {
                        return Err(e);
                    }
                    self.record_failure(&item.name, source, &e);
                    return Ok(Disposition::Failed);
                }
                artifact = Some(dest);
            }
        }

        self.ctx.tracker.begin_install(&item.name, item.kind());
        let request = DispatchRequest {
            item,
            action,
            artifact: artifact.as_deref(),
            cache_dir: &self.ctx.cache_dir,
        };
        let output = match self.ctx.dispatcher.dispatch(&request, self.ctx.session) {
            Ok(output) => output,
            Err(e @ Error::Cancelled) => return Err(e),
            Err(e) => {
                self.record_failure(&item.name, source, &e);
                return Ok(Disposition::Failed);
            }
        };

        self.conclude_install(item, output, artifact.as_deref())
    }

    fn conclude_install(
        &mut self,
        item: &Item,
        output: DispatchOutput,
        artifact: Option<&std::path::Path>,
    ) -> crate::Result<Disposition> {
        match output.outcome {
            Outcome::Blocked(apps) => {
                self.ctx
                    .tracker
                    .skip(&item.name, &format!("Blocked by {}", apps.join(", ")));
                return Ok(Disposition::Held);
            }
            Outcome::RebootRequired => {
                self.ctx.tracker.complete(&item.name);
                self.ctx.tracker.set_warning(&item.name, "requires reboot");
            }
            Outcome::Success => {
                self.ctx.tracker.complete(&item.name);
            }
        }

        if item.on_demand {
            // On-demand items run every time they are requested; recording a
            // version would make future runs treat them as installed.
            if let Some(self_service) = &mut self.ctx.self_service {
                self_service.remove_install(&item.name)?;
            }
        } else if !item.version.trim().is_empty() {
            self.ctx.store.set(&item.name, &item.version)?;
        }

        self.report.installed.push(item.name.clone());

        // With its probes verified the cached artifact has served its
        // purpose; the periodic sweep handles everything else.
        if let Some(path) = artifact {
            if !item.installs.is_empty() && verify_installs_assertions(item) {
                tracing::debug!("removing verified artifact {}", util::display_path(path));
                let _ = std::fs::remove_file(path);
            }
        }

        Ok(Disposition::Done)
    }

    /// Uninstalls `name`, removing dependents and companion updates first.
    fn uninstall_item(&mut self, name: &str, source: SourceRecord) -> crate::Result<bool> {
        let key = name.to_ascii_lowercase();
        if self.processed_uninstalls.contains(&key) {
            return Ok(true);
        }
        self.processed_uninstalls.insert(key.clone());
        self.sources.entry(key).or_insert_with(|| source.clone());
        self.ctx.tracker.register(name, "");

        // Installed items that require this one go first.
        for dependent in self.ctx.index.items_requiring(name) {
            let installed = matches!(self.ctx.store.get(&dependent.name), Ok(Some(_)));
            if !installed {
                continue;
            }
            let child_source = source.derived(Role::DependentRemoval, name);
            if !self.uninstall_item(&dependent.name, child_source)? {
                let error = Error::RequiredDependencyFailed {
                    item: name.to_string(),
                    dependency: dependent.name.clone(),
                };
                self.record_failure(name, &source, &error);
                return Ok(false);
            }
        }

        // Companion updates of the target come out too; failures warn.
        for update_name in self.ctx.index.updates_for(name) {
            let installed = matches!(self.ctx.store.get(&update_name), Ok(Some(_)));
            if !installed {
                continue;
            }
            let child_source = source.derived(Role::UpdateRemoval, name);
            match self.uninstall_item(&update_name, child_source) {
                Ok(true) => (),
                Ok(false) => {
                    tracing::warn!("removal of companion update `{update_name}` failed")
                }
                Err(e) => return Err(e),
            }
        }

        // An item that vanished from the catalogs can still be removed
        // through its recorded registry state.
        let item = self
            .ctx
            .index
            .find(name)
            .unwrap_or_else(|| Item::stub_for_uninstall(name));

        self.ctx.tracker.register(&item.name, item.label());

        let evaluator = StatusEvaluator::new(self.ctx.store);
        if !evaluator.action_required(&item, Action::Uninstall) {
            self.ctx.tracker.skip(&item.name, "Not installed");
            return Ok(true);
        }

        if self.ctx.check_only {
            self.ctx.tracker.knowledge(&item.name, "removal required");
            return Ok(true);
        }

        self.ctx.tracker.begin_install(&item.name, item.uninstall_kind());
        let request = DispatchRequest {
            item: &item,
            action: Action::Uninstall,
            artifact: None,
            cache_dir: &self.ctx.cache_dir,
        };
        match self.ctx.dispatcher.dispatch(&request, self.ctx.session) {
            Ok(_) => {
                self.ctx.store.remove(&item.name)?;
                self.ctx.tracker.complete(&item.name);
                self.report.removed.push(item.name.clone());
                Ok(true)
            }
            Err(e @ Error::Cancelled) => Err(e),
            Err(e) => {
                self.record_failure(&item.name, &source, &e);
                Ok(false)
            }
        }
    }
}
