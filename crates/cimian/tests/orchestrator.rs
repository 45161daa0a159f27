// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! End-to-end orchestration scenarios over an in-memory version store, a
//! directory-backed repository and a recording fake dispatcher.

use std::{
    collections::HashMap,
    fs,
    sync::{Arc, Mutex},
};

use cimian::{
    catalog::{CatalogCache, CatalogIndex},
    download::{DirRepo, RepoClient},
    installer::{DispatchOutput, DispatchRequest, Dispatcher, Outcome},
    manifest::{ManifestEntry, ManifestExpansion, SelfServiceManifest},
    orchestrator::{Orchestrator, RunContext, RunOutcome},
    progress::{ItemStatus, ProgressTracker},
    session::Session,
    store::{InstalledVersionStore, MemoryStore},
    Error,
};

#[derive(Clone, Copy)]
enum Plan {
    Reboot,
    Fail(i32),
}

#[derive(Default)]
struct FakeDispatcher {
    calls: Mutex<Vec<String>>,
    plans: HashMap<String, Plan>,
}

impl FakeDispatcher {
    fn plan(mut self, item: &str, plan: Plan) -> Self {
        self.plans.insert(item.to_ascii_lowercase(), plan);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Dispatcher for FakeDispatcher {
    fn dispatch(
        &self,
        request: &DispatchRequest<'_>,
        _session: &Session,
    ) -> cimian::Result<DispatchOutput> {
        self.calls.lock().unwrap().push(format!(
            "{}:{}",
            request.action.tag(),
            request.item.name
        ));
        match self.plans.get(&request.item.name.to_ascii_lowercase()) {
            None => Ok(DispatchOutput {
                outcome: Outcome::Success,
                console: String::new(),
            }),
            Some(Plan::Reboot) => Ok(DispatchOutput {
                outcome: Outcome::RebootRequired,
                console: String::new(),
            }),
            Some(Plan::Fail(code)) => Err(Error::InstallerFailed {
                item: request.item.name.clone(),
                backend: "msi",
                exit_code: *code,
                stderr_tail: String::new(),
            }),
        }
    }
}

struct Harness {
    _scratch: tempfile::TempDir,
    repo: Arc<dyn RepoClient>,
    session: Session,
    tracker: Arc<ProgressTracker>,
    cache_dir: std::path::PathBuf,
    catalogs: Vec<String>,
    host_arch: String,
}

impl Harness {
    fn new(catalog_yaml: &str, artifacts: &[&str]) -> Self {
        let scratch = tempfile::tempdir().unwrap();
        let root = scratch.path();
        fs::create_dir_all(root.join("repo/catalogs")).unwrap();
        fs::write(root.join("repo/catalogs/Production.yaml"), catalog_yaml).unwrap();
        for artifact in artifacts {
            let path = root.join("repo/pkgs").join(artifact);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, b"artifact-bytes").unwrap();
        }
        let repo: Arc<dyn RepoClient> = Arc::new(DirRepo::new(root.join("repo")));
        let session = Session::for_tests(&root.join("logs"));
        let tracker = Arc::new(ProgressTracker::new(session.id(), None));
        Self {
            cache_dir: root.join("cache"),
            repo,
            session,
            tracker,
            catalogs: vec!["Production".into()],
            host_arch: "x64".into(),
            _scratch: scratch,
        }
    }

    fn arch(mut self, arch: &str) -> Self {
        self.host_arch = arch.into();
        self
    }

    fn run(
        &self,
        store: &dyn InstalledVersionStore,
        dispatcher: &FakeDispatcher,
        expansion: &ManifestExpansion,
    ) -> cimian::Result<cimian::orchestrator::RunReport> {
        self.run_with(store, dispatcher, expansion, false, None)
    }

    fn run_with(
        &self,
        store: &dyn InstalledVersionStore,
        dispatcher: &FakeDispatcher,
        expansion: &ManifestExpansion,
        check_only: bool,
        self_service: Option<SelfServiceManifest>,
    ) -> cimian::Result<cimian::orchestrator::RunReport> {
        let cache = Arc::new(CatalogCache::new(self.repo.clone()));
        let index = CatalogIndex::new(cache, self.catalogs.clone(), &self.host_arch);
        let orchestrator = Orchestrator::new(RunContext {
            index: &index,
            store,
            dispatcher,
            repo: self.repo.as_ref(),
            tracker: self.tracker.clone(),
            session: &self.session,
            cache_dir: self.cache_dir.clone(),
            check_only,
            self_service,
        });
        orchestrator.run(expansion)
    }
}

fn entries(names: &[&str]) -> Vec<ManifestEntry> {
    names
        .iter()
        .map(|name| ManifestEntry {
            name: name.to_string(),
            manifest: "TEST-HOST".into(),
        })
        .collect()
}

fn installs(names: &[&str]) -> ManifestExpansion {
    ManifestExpansion {
        managed_installs: entries(names),
        ..Default::default()
    }
}

fn uninstalls(names: &[&str]) -> ManifestExpansion {
    ManifestExpansion {
        managed_uninstalls: entries(names),
        ..Default::default()
    }
}

const DEPENDENCY_CATALOG: &str = r#"
items:
  - name: A
    version: "2.0"
    requires: [B]
    installer: {type: msi, location: a.msi, size: 14}
  - name: B
    version: "1.5"
    installer: {type: msi, location: b.msi, size: 14}
"#;

#[test]
fn linear_dependency_installs_prerequisite_first() {
    let harness = Harness::new(DEPENDENCY_CATALOG, &["a.msi", "b.msi"]);
    let store = MemoryStore::new();
    let dispatcher = FakeDispatcher::default();

    let report = harness.run(&store, &dispatcher, &installs(&["A"])).unwrap();

    assert_eq!(dispatcher.calls(), vec!["install:B", "install:A"]);
    assert_eq!(store.get("A").unwrap().as_deref(), Some("2.0"));
    assert_eq!(store.get("B").unwrap().as_deref(), Some("1.5"));
    assert_eq!(report.outcome, Some(RunOutcome::Success));
}

#[test]
fn satisfied_dependency_is_not_reinstalled() {
    let harness = Harness::new(DEPENDENCY_CATALOG, &["a.msi", "b.msi"]);
    let store = MemoryStore::with_records([("B", "1.5")]);
    let dispatcher = FakeDispatcher::default();

    harness.run(&store, &dispatcher, &installs(&["A"])).unwrap();

    assert_eq!(dispatcher.calls(), vec!["install:A"]);
}

#[test]
fn requirement_cycles_dispatch_each_item_once() {
    let catalog = r#"
items:
  - name: A
    version: "1.0"
    requires: [B]
    installer: {type: msi, location: a.msi}
  - name: B
    version: "1.0"
    requires: [A]
    installer: {type: msi, location: b.msi}
"#;
    let harness = Harness::new(catalog, &["a.msi", "b.msi"]);
    let store = MemoryStore::new();
    let dispatcher = FakeDispatcher::default();

    harness.run(&store, &dispatcher, &installs(&["A"])).unwrap();

    let calls = dispatcher.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.contains(&"install:A".to_string()));
    assert!(calls.contains(&"install:B".to_string()));
}

#[test]
fn companion_updates_follow_the_main_item() {
    let catalog = r#"
items:
  - name: AdobePhotoshop
    version: "26.0"
    installer: {type: msi, location: photoshop.msi}
  - name: AdobeRaw
    version: "17.1"
    update_for: [AdobePhotoshop]
    installer: {type: exe, location: raw.exe}
"#;
    let harness = Harness::new(catalog, &["photoshop.msi", "raw.exe"]);
    let store = MemoryStore::new();
    let dispatcher = FakeDispatcher::default();

    harness
        .run(&store, &dispatcher, &installs(&["AdobePhotoshop"]))
        .unwrap();

    assert_eq!(
        dispatcher.calls(),
        vec!["install:AdobePhotoshop", "install:AdobeRaw"]
    );
    // the companion's install never touches the main item's record
    assert_eq!(store.get("AdobePhotoshop").unwrap().as_deref(), Some("26.0"));
    assert_eq!(store.get("AdobeRaw").unwrap().as_deref(), Some("17.1"));
}

#[test]
fn unsupported_architecture_skips_without_failing() {
    let catalog = r#"
items:
  - name: Foo
    version: "1.0"
    supported_architectures: [arm64]
    installer: {type: msi, location: foo.msi}
"#;
    let harness = Harness::new(catalog, &["foo.msi"]).arch("x64");
    let store = MemoryStore::new();
    let dispatcher = FakeDispatcher::default();

    let report = harness.run(&store, &dispatcher, &installs(&["Foo"])).unwrap();

    // a lone candidate on the wrong architecture comes back from the index
    // as the fallback; the walk then refuses it for this host
    assert!(dispatcher.calls().is_empty());
    assert_eq!(report.outcome, Some(RunOutcome::Success));
    assert!(store.get("Foo").unwrap().is_none());
}

#[test]
fn reboot_exit_completes_with_warning_and_records_version() {
    let catalog = r#"
items:
  - name: SecurityAgent
    version: "5.2"
    installer: {type: msi, location: agent.msi}
"#;
    let harness = Harness::new(catalog, &["agent.msi"]);
    let store = MemoryStore::new();
    let dispatcher = FakeDispatcher::default().plan("SecurityAgent", Plan::Reboot);

    let report = harness
        .run(&store, &dispatcher, &installs(&["SecurityAgent"]))
        .unwrap();

    assert_eq!(report.outcome, Some(RunOutcome::Success));
    assert_eq!(store.get("SecurityAgent").unwrap().as_deref(), Some("5.2"));

    let snapshot = harness.tracker.snapshot();
    let item = snapshot
        .items
        .iter()
        .find(|i| i.name == "SecurityAgent")
        .unwrap();
    assert_eq!(item.status, ItemStatus::Warning);
    assert_eq!(item.warning.as_deref(), Some("requires reboot"));
}

#[test]
fn dependents_are_removed_before_their_prerequisite() {
    let harness = Harness::new(DEPENDENCY_CATALOG, &["a.msi", "b.msi"]);
    let store = MemoryStore::with_records([("A", "2.0"), ("B", "1.5")]);
    let dispatcher = FakeDispatcher::default();

    harness.run(&store, &dispatcher, &uninstalls(&["B"])).unwrap();

    assert_eq!(dispatcher.calls(), vec!["uninstall:A", "uninstall:B"]);
    assert!(store.get("A").unwrap().is_none());
    assert!(store.get("B").unwrap().is_none());
}

#[test]
fn on_demand_items_leave_no_trace() {
    let catalog = r#"
items:
  - name: RunDiagnostics
    version: "1.0"
    on_demand: true
    preinstall_script: |
      Write-Host 'collecting diagnostics'
"#;
    let harness = Harness::new(catalog, &[]);
    let store = MemoryStore::new();
    let dispatcher = FakeDispatcher::default();

    let ss_path = harness.cache_dir.parent().unwrap().join("SelfServeManifest");
    let mut self_service = SelfServiceManifest::load(&ss_path).unwrap();
    self_service.add_install("RunDiagnostics").unwrap();

    harness
        .run_with(
            &store,
            &dispatcher,
            &installs(&["RunDiagnostics"]),
            false,
            Some(self_service),
        )
        .unwrap();

    assert_eq!(dispatcher.calls(), vec!["install:RunDiagnostics"]);
    assert!(store.get("RunDiagnostics").unwrap().is_none());
    let reloaded = SelfServiceManifest::load(&ss_path).unwrap();
    assert!(reloaded.manifest().managed_installs.is_empty());
}

#[test]
fn single_failure_degrades_to_warnings() {
    let catalog = r#"
items:
  - name: Good
    version: "1.0"
    installer: {type: msi, location: good.msi}
  - name: Bad
    version: "1.0"
    installer: {type: msi, location: bad.msi}
"#;
    let harness = Harness::new(catalog, &["good.msi", "bad.msi"]);
    let store = MemoryStore::new();
    let dispatcher = FakeDispatcher::default().plan("Bad", Plan::Fail(1603));

    let report = harness
        .run(&store, &dispatcher, &installs(&["Good", "Bad"]))
        .unwrap();

    assert_eq!(report.outcome, Some(RunOutcome::Warnings));
    assert_eq!(report.failed.len(), 1);
    assert_eq!(store.get("Good").unwrap().as_deref(), Some("1.0"));
    assert!(store.get("Bad").unwrap().is_none());
}

#[test]
fn whole_batch_failure_is_an_error_naming_every_item() {
    let catalog = r#"
items:
  - name: One
    version: "1.0"
    installer: {type: msi, location: one.msi}
  - name: Two
    version: "1.0"
    installer: {type: msi, location: two.msi}
"#;
    let harness = Harness::new(catalog, &["one.msi", "two.msi"]);
    let store = MemoryStore::new();
    let dispatcher = FakeDispatcher::default()
        .plan("One", Plan::Fail(1603))
        .plan("Two", Plan::Fail(1));

    let err = harness
        .run(&store, &dispatcher, &installs(&["One", "Two"]))
        .unwrap_err();

    match err {
        Error::BatchFailed(names) => {
            assert_eq!(names.len(), 2);
            assert!(names.contains(&"One".to_string()));
            assert!(names.contains(&"Two".to_string()));
        }
        other => panic!("expected whole-batch failure, got {other}"),
    }
}

#[test]
fn required_dependency_failure_aborts_only_its_parent() {
    let catalog = r#"
items:
  - name: Parent
    version: "1.0"
    requires: [Broken]
    installer: {type: msi, location: parent.msi}
  - name: Broken
    version: "1.0"
    installer: {type: msi, location: broken.msi}
  - name: Sibling
    version: "1.0"
    installer: {type: msi, location: sibling.msi}
"#;
    let harness = Harness::new(catalog, &["parent.msi", "broken.msi", "sibling.msi"]);
    let store = MemoryStore::new();
    let dispatcher = FakeDispatcher::default().plan("Broken", Plan::Fail(1603));

    let report = harness
        .run(&store, &dispatcher, &installs(&["Parent", "Sibling"]))
        .unwrap();

    assert_eq!(report.outcome, Some(RunOutcome::Warnings));
    assert!(store.get("Parent").unwrap().is_none());
    assert_eq!(store.get("Sibling").unwrap().as_deref(), Some("1.0"));
}

#[test]
fn check_only_evaluates_without_dispatching() {
    let harness = Harness::new(DEPENDENCY_CATALOG, &["a.msi", "b.msi"]);
    let store = MemoryStore::new();
    let dispatcher = FakeDispatcher::default();

    harness
        .run_with(&store, &dispatcher, &installs(&["A"]), true, None)
        .unwrap();

    assert!(dispatcher.calls().is_empty());
    assert!(store.get("A").unwrap().is_none());
    let snapshot = harness.tracker.snapshot();
    assert!(snapshot
        .items
        .iter()
        .any(|i| i.name == "A" && i.status == ItemStatus::Knowledge));
}

#[test]
fn missing_item_is_a_recorded_failure_not_an_abort() {
    let harness = Harness::new(DEPENDENCY_CATALOG, &["a.msi", "b.msi"]);
    let store = MemoryStore::new();
    let dispatcher = FakeDispatcher::default();

    let report = harness
        .run(&store, &dispatcher, &installs(&["A", "NoSuchItem"]))
        .unwrap();

    assert_eq!(report.outcome, Some(RunOutcome::Warnings));
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].1.contains("NoSuchItem"));
    // the healthy item still installed
    assert_eq!(store.get("A").unwrap().as_deref(), Some("2.0"));
}

#[test]
fn vanished_items_still_uninstall_via_recorded_state() {
    let harness = Harness::new("items: []\n", &[]);
    let store = MemoryStore::with_records([("Orphan", "3.0")]);
    let dispatcher = FakeDispatcher::default();

    harness
        .run(&store, &dispatcher, &uninstalls(&["Orphan"]))
        .unwrap();

    assert_eq!(dispatcher.calls(), vec!["uninstall:Orphan"]);
    assert!(store.get("Orphan").unwrap().is_none());
}
