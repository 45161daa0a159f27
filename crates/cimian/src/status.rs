// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Decides whether a catalog item actually needs work on this host by
//! combining, in priority order: its install-check script, its declarative
//! `installs` probes, and the recorded installed version.

use std::path::Path;

use crate::{
    catalog::{InstallAssertion, Item},
    installer::script,
    store::InstalledVersionStore,
    util, version,
};

/// The action being considered for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Install the item.
    Install,
    /// Update an existing installation.
    Update,
    /// Remove the item.
    Uninstall,
}

impl Action {
    /// Short tag used in logs.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Update => "update",
            Self::Uninstall => "uninstall",
        }
    }
}

/// Evaluates installed-ness against the injected version store.
pub struct StatusEvaluator<'a> {
    store: &'a dyn InstalledVersionStore,
}

impl<'a> StatusEvaluator<'a> {
    /// An evaluator over `store`.
    pub fn new(store: &'a dyn InstalledVersionStore) -> Self {
        Self { store }
    }

    /// Whether `action` is actually required for `item`.
    ///
    /// For installs and updates the answer is "is it missing or stale"; for
    /// uninstalls the inverse, "is it present".
    pub fn action_required(&self, item: &Item, action: Action) -> bool {
        match action {
            Action::Install | Action::Update => !self.is_installed(item, action),
            Action::Uninstall => self.is_present_for_removal(item),
        }
    }

    fn is_installed(&self, item: &Item, _action: Action) -> bool {
        if !item.install_check_script.trim().is_empty() {
            return match script::run_script(&item.install_check_script, "install-check") {
                // Exit 0 means "not installed"; any other exit means present.
                Ok(output) => !output.status.success(),
                Err(e) => {
                    tracing::warn!(
                        "install-check script of `{}` failed to run ({e}); assuming action required",
                        item.name
                    );
                    false
                }
            };
        }

        if !item.installs.is_empty() {
            return verify_installs_assertions(item);
        }

        match self.store.get(&item.name) {
            Ok(Some(recorded)) => version::satisfies(&recorded, &item.version),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("installed-version lookup of `{}` failed: {e}", item.name);
                false
            }
        }
    }

    fn is_present_for_removal(&self, item: &Item) -> bool {
        if !item.uninstall_check_script.trim().is_empty() {
            return match script::run_script(&item.uninstall_check_script, "uninstall-check") {
                // Exit 0 means "removal required".
                Ok(output) => output.status.success(),
                Err(e) => {
                    tracing::warn!(
                        "uninstall-check script of `{}` failed to run ({e}); assuming removal required",
                        item.name
                    );
                    true
                }
            };
        }

        if !item.installs.is_empty() {
            return verify_installs_assertions(item);
        }

        matches!(self.store.get(&item.name), Ok(Some(_)))
    }
}

/// True when every `installs` probe of `item` holds. This consults only the
/// declared paths, never the artifact cache, so it is safe to call after the
/// cached artifact has been deleted.
pub fn verify_installs_assertions(item: &Item) -> bool {
    item.installs.iter().all(assertion_holds)
}

fn assertion_holds(assertion: &InstallAssertion) -> bool {
    match assertion.kind.to_ascii_lowercase().as_str() {
        "file" => file_assertion_holds(assertion),
        "directory" => Path::new(&assertion.path).is_dir(),
        "registry" => registry_assertion_holds(assertion),
        other => {
            tracing::warn!("unknown install probe type `{other}` treated as failing");
            false
        }
    }
}

fn file_assertion_holds(assertion: &InstallAssertion) -> bool {
    let path = Path::new(&assertion.path);
    if !path.is_file() {
        return false;
    }

    if let Some(expected) = assertion
        .md5checksum
        .as_deref()
        .filter(|c| !c.trim().is_empty())
    {
        match util::md5_of_file(path) {
            Ok(actual) if actual.eq_ignore_ascii_case(expected.trim()) => (),
            Ok(_) | Err(_) => return false,
        }
    }

    if let Some(wanted) = assertion
        .version
        .as_deref()
        .filter(|v| !v.trim().is_empty())
    {
        match file_product_version(path) {
            Some(actual) => {
                if !version::satisfies(&actual, wanted) {
                    return false;
                }
            }
            // No readable product version cannot satisfy a version floor.
            None => return false,
        }
    }

    true
}

/// Product version from the file's version resource.
fn file_product_version(path: &Path) -> Option<String> {
    #[cfg(windows)]
    {
        use crate::shell::CommandExt;
        let expression = format!(
            "(Get-Item -LiteralPath '{}').VersionInfo.ProductVersion",
            path.display()
        );
        let output = std::process::Command::new("powershell.exe")
            .args(["-NoProfile", "-NonInteractive", "-Command", &expression])
            .output_captured()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
    #[cfg(not(windows))]
    {
        let _ = path;
        None
    }
}

fn registry_assertion_holds(assertion: &InstallAssertion) -> bool {
    #[cfg(windows)]
    {
        let Some((key_path, value_name)) = assertion.path.rsplit_once('\\') else {
            return false;
        };
        let hklm = winreg::RegKey::predef(winreg::enums::HKEY_LOCAL_MACHINE);
        let Ok(key) = hklm.open_subkey(key_path.trim_start_matches(r"HKLM\")) else {
            return false;
        };
        let Ok(found) = key.get_value::<String, _>(value_name) else {
            return false;
        };
        match assertion.version.as_deref().filter(|v| !v.trim().is_empty()) {
            Some(wanted) => version::satisfies(&found, wanted),
            None => true,
        }
    }
    #[cfg(not(windows))]
    {
        let _ = assertion;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn item(name: &str, version: &str) -> Item {
        Item {
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    #[test]
    fn version_record_decides_when_no_probes_exist() {
        let store = MemoryStore::with_records([("Git", "2.46.0")]);
        let evaluator = StatusEvaluator::new(&store);

        assert!(!evaluator.action_required(&item("Git", "2.46.0"), Action::Install));
        assert!(!evaluator.action_required(&item("Git", "2.45.0"), Action::Install));
        assert!(evaluator.action_required(&item("Git", "2.47.0"), Action::Update));
        assert!(evaluator.action_required(&item("SevenZip", "24.08"), Action::Install));
    }

    #[test]
    fn truncated_date_records_still_satisfy() {
        let store = MemoryStore::with_records([("SitePolicy", "25.9.1")]);
        let evaluator = StatusEvaluator::new(&store);
        assert!(!evaluator.action_required(&item("SitePolicy", "2025.09.01"), Action::Install));
    }

    #[test]
    fn uninstall_requires_presence() {
        let store = MemoryStore::with_records([("Git", "2.46.0")]);
        let evaluator = StatusEvaluator::new(&store);
        assert!(evaluator.action_required(&item("Git", "2.46.0"), Action::Uninstall));
        assert!(!evaluator.action_required(&item("SevenZip", "24.08"), Action::Uninstall));
    }

    #[test]
    fn file_assertions_gate_installedness() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("tool.dat");
        std::fs::write(&payload, b"payload").unwrap();
        let digest = util::md5_of_file(&payload).unwrap();

        let store = MemoryStore::new();
        let evaluator = StatusEvaluator::new(&store);

        let mut probed = item("Tool", "1.0");
        probed.installs = vec![InstallAssertion {
            kind: "file".into(),
            path: payload.display().to_string(),
            md5checksum: Some(digest),
            ..Default::default()
        }];
        // all probes hold: installed, nothing to do
        assert!(!evaluator.action_required(&probed, Action::Install));
        assert!(verify_installs_assertions(&probed));

        probed.installs[0].md5checksum = Some("0000".into());
        assert!(evaluator.action_required(&probed, Action::Install));
    }

    #[test]
    fn directory_assertions() {
        let dir = tempfile::tempdir().unwrap();
        let mut probed = item("Tool", "1.0");
        probed.installs = vec![InstallAssertion {
            kind: "directory".into(),
            path: dir.path().display().to_string(),
            ..Default::default()
        }];
        assert!(verify_installs_assertions(&probed));

        probed.installs[0].path = dir.path().join("absent").display().to_string();
        assert!(!verify_installs_assertions(&probed));
    }
}
