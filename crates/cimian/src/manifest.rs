// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Per-host manifest trees and their expansion into the run's work lists.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    download::RepoClient,
    facts::Facts,
    predicates::{self, Condition, ConditionType, OneOrMany},
    util,
};

/// A block of manifest lists applied only when its predicate holds.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case", default)]
pub struct ConditionalItem {
    /// One condition or a list of conditions.
    #[serde(alias = "conditions")]
    pub condition: OneOrMany<Condition>,
    /// How multiple conditions combine; AND unless stated.
    pub condition_type: ConditionType,
    /// Items to install when the predicate holds.
    pub managed_installs: Vec<String>,
    /// Items to uninstall when the predicate holds.
    pub managed_uninstalls: Vec<String>,
    /// Items to update when the predicate holds.
    pub managed_updates: Vec<String>,
    /// Optional items offered when the predicate holds.
    pub optional_installs: Vec<String>,
}

/// One manifest document.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case", default)]
pub struct Manifest {
    /// Manifest name; informational, the repository path is authoritative.
    pub name: String,
    /// Items that must be installed.
    pub managed_installs: Vec<String>,
    /// Items that must be removed.
    pub managed_uninstalls: Vec<String>,
    /// Items that should be updated when already present.
    pub managed_updates: Vec<String>,
    /// Items the user may opt into.
    pub optional_installs: Vec<String>,
    /// Sub-manifests expanded into this one.
    pub includes: Vec<String>,
    /// Conditionally applied blocks.
    pub conditional_items: Vec<ConditionalItem>,
}

/// An item name plus the manifest it came from, for source-chain diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// The item name as written in the manifest.
    pub name: String,
    /// The manifest that contributed it.
    pub manifest: String,
}

/// The flattened output of a manifest tree: four ordered, deduplicated lists.
#[derive(Debug, Clone, Default)]
pub struct ManifestExpansion {
    /// Items to install, including opted-in optional items.
    pub managed_installs: Vec<ManifestEntry>,
    /// Items to uninstall.
    pub managed_uninstalls: Vec<ManifestEntry>,
    /// Items to update.
    pub managed_updates: Vec<ManifestEntry>,
    /// Optional items, before their promotion into the install list.
    pub optional_installs: Vec<ManifestEntry>,
}

fn push_unique(list: &mut Vec<ManifestEntry>, name: &str, manifest: &str) {
    if !list.iter().any(|e| e.name.eq_ignore_ascii_case(name)) {
        list.push(ManifestEntry {
            name: name.to_string(),
            manifest: manifest.to_string(),
        });
    }
}

/// Expands the manifest tree rooted at `root`.
///
/// Includes are followed depth-first; a name is fetched at most once, so
/// include cycles terminate. Conditional blocks are evaluated against
/// `facts` as each manifest is visited. Optional installs are promoted into
/// `managed_installs` at the end, preserving list order.
pub fn expand(
    root: &str,
    repo: &dyn RepoClient,
    facts: &Facts,
    self_service: Option<&Manifest>,
) -> crate::Result<ManifestExpansion> {
    let mut expansion = ManifestExpansion::default();
    let mut visited: Vec<String> = Vec::new();
    expand_into(root, repo, facts, &mut expansion, &mut visited, true)?;

    if let Some(manifest) = self_service {
        merge_manifest(manifest, "SelfServeManifest", facts, &mut expansion)?;
    }

    // Optional items are opt-ins; they install like managed items.
    for entry in expansion.optional_installs.clone() {
        push_unique(&mut expansion.managed_installs, &entry.name, &entry.manifest);
    }

    Ok(expansion)
}

fn expand_into(
    name: &str,
    repo: &dyn RepoClient,
    facts: &Facts,
    expansion: &mut ManifestExpansion,
    visited: &mut Vec<String>,
    is_root: bool,
) -> crate::Result<()> {
    let key = name.to_ascii_lowercase();
    if visited.iter().any(|v| v == &key) {
        tracing::debug!("manifest `{name}` already expanded, skipping");
        return Ok(());
    }
    visited.push(key);

    let bytes = match repo.fetch(&format!("manifests/{name}.yaml")) {
        Ok(bytes) => bytes,
        Err(e) if is_root => return Err(e),
        Err(e) => {
            tracing::warn!("included manifest `{name}` unavailable: {e}");
            return Ok(());
        }
    };
    let manifest = parse_manifest(&bytes)?;

    merge_manifest(&manifest, name, facts, expansion)?;

    for include in &manifest.includes {
        expand_into(include, repo, facts, expansion, visited, false)?;
    }

    Ok(())
}

// An empty document is a valid (if pointless) manifest.
fn parse_manifest(bytes: &[u8]) -> crate::Result<Manifest> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Manifest::default());
    }
    Ok(serde_yaml::from_slice(bytes)?)
}

fn merge_manifest(
    manifest: &Manifest,
    origin: &str,
    facts: &Facts,
    expansion: &mut ManifestExpansion,
) -> crate::Result<()> {
    for name in &manifest.managed_installs {
        push_unique(&mut expansion.managed_installs, name, origin);
    }
    for name in &manifest.managed_uninstalls {
        push_unique(&mut expansion.managed_uninstalls, name, origin);
    }
    for name in &manifest.managed_updates {
        push_unique(&mut expansion.managed_updates, name, origin);
    }
    for name in &manifest.optional_installs {
        push_unique(&mut expansion.optional_installs, name, origin);
    }

    for block in &manifest.conditional_items {
        if predicates::evaluate_all(&block.condition, block.condition_type, facts)? {
            for name in &block.managed_installs {
                push_unique(&mut expansion.managed_installs, name, origin);
            }
            for name in &block.managed_uninstalls {
                push_unique(&mut expansion.managed_uninstalls, name, origin);
            }
            for name in &block.managed_updates {
                push_unique(&mut expansion.managed_updates, name, origin);
            }
            for name in &block.optional_installs {
                push_unique(&mut expansion.optional_installs, name, origin);
            }
        }
    }

    Ok(())
}

/// The writable on-disk manifest recording user-initiated choices.
pub struct SelfServiceManifest {
    path: PathBuf,
    manifest: Manifest,
}

impl SelfServiceManifest {
    /// Loads the manifest at `path`, or an empty one when absent.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let manifest = match std::fs::read_to_string(path) {
            Ok(raw) if !raw.trim().is_empty() => serde_yaml::from_str(&raw)?,
            _ => Manifest::default(),
        };
        Ok(Self {
            path: path.to_path_buf(),
            manifest,
        })
    }

    /// The manifest contents.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Adds `name` to the managed installs and persists.
    pub fn add_install(&mut self, name: &str) -> crate::Result<()> {
        if !self
            .manifest
            .managed_installs
            .iter()
            .any(|n| n.eq_ignore_ascii_case(name))
        {
            self.manifest.managed_installs.push(name.to_string());
            self.save()?;
        }
        Ok(())
    }

    /// Removes `name` from the managed installs and persists. Used when an
    /// on-demand item completes so it does not run again next time.
    pub fn remove_install(&mut self, name: &str) -> crate::Result<()> {
        let before = self.manifest.managed_installs.len();
        self.manifest
            .managed_installs
            .retain(|n| !n.eq_ignore_ascii_case(name));
        if self.manifest.managed_installs.len() != before {
            self.save()?;
        }
        Ok(())
    }

    fn save(&self) -> crate::Result<()> {
        let raw = serde_yaml::to_string(&self.manifest)?;
        util::replace_file_atomic(&self.path, raw.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::DirRepo;
    use crate::facts::{FactMap, FactValue};
    use std::fs;

    fn write_manifest(root: &Path, name: &str, yaml: &str) {
        let dir = root.join("manifests");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{name}.yaml")), yaml).unwrap();
    }

    fn facts() -> Facts {
        let mut map = FactMap::new();
        map.insert("machine_type".into(), FactValue::Str("laptop".into()));
        Facts::from_map(map)
    }

    #[test]
    fn includes_expand_depth_first_and_dedupe() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "site",
            "managed_installs: [Git]\nincludes: [dept, dept]\n",
        );
        write_manifest(
            dir.path(),
            "dept",
            "managed_installs: [Git, SevenZip]\nmanaged_uninstalls: [OldTool]\n",
        );
        let repo = DirRepo::new(dir.path().to_path_buf());
        let expansion = expand("site", &repo, &facts(), None).unwrap();
        let installs: Vec<&str> = expansion
            .managed_installs
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(installs, vec!["Git", "SevenZip"]);
        assert_eq!(expansion.managed_installs[0].manifest, "site");
        assert_eq!(expansion.managed_installs[1].manifest, "dept");
        assert_eq!(expansion.managed_uninstalls[0].name, "OldTool");
    }

    #[test]
    fn include_cycles_terminate() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "a", "managed_installs: [One]\nincludes: [b]\n");
        write_manifest(dir.path(), "b", "managed_installs: [Two]\nincludes: [a]\n");
        let repo = DirRepo::new(dir.path().to_path_buf());
        let expansion = expand("a", &repo, &facts(), None).unwrap();
        let installs: Vec<&str> = expansion
            .managed_installs
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(installs, vec!["One", "Two"]);
    }

    #[test]
    fn conditional_blocks_gate_their_lists() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "site",
            r#"
managed_installs: [Base]
conditional_items:
  - condition:
      key: machine_type
      operator: ==
      value: laptop
    managed_installs: [BatteryTool]
  - condition:
      key: machine_type
      operator: ==
      value: desktop
    managed_installs: [DockTool]
"#,
        );
        let repo = DirRepo::new(dir.path().to_path_buf());
        let expansion = expand("site", &repo, &facts(), None).unwrap();
        let installs: Vec<&str> = expansion
            .managed_installs
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(installs, vec!["Base", "BatteryTool"]);
    }

    #[test]
    fn optional_installs_promote_to_managed() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "site", "optional_installs: [VlcPlayer]\n");
        let repo = DirRepo::new(dir.path().to_path_buf());
        let expansion = expand("site", &repo, &facts(), None).unwrap();
        assert_eq!(expansion.managed_installs[0].name, "VlcPlayer");
        assert_eq!(expansion.optional_installs[0].name, "VlcPlayer");
    }

    #[test]
    fn missing_root_manifest_is_fatal_but_missing_include_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let repo = DirRepo::new(dir.path().to_path_buf());
        assert!(expand("absent", &repo, &facts(), None).is_err());

        write_manifest(dir.path(), "site", "includes: [gone]\nmanaged_installs: [Git]\n");
        let expansion = expand("site", &repo, &facts(), None).unwrap();
        assert_eq!(expansion.managed_installs.len(), 1);
    }

    #[test]
    fn self_service_merges_and_mutates() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "site", "managed_installs: [Git]\n");
        let repo = DirRepo::new(dir.path().to_path_buf());

        let ss_path = dir.path().join("SelfServeManifest");
        let mut ss = SelfServiceManifest::load(&ss_path).unwrap();
        ss.add_install("RunDiagnostics").unwrap();

        let expansion =
            expand("site", &repo, &facts(), Some(ss.manifest())).unwrap();
        assert!(expansion
            .managed_installs
            .iter()
            .any(|e| e.name == "RunDiagnostics" && e.manifest == "SelfServeManifest"));

        ss.remove_install("RunDiagnostics").unwrap();
        let reloaded = SelfServiceManifest::load(&ss_path).unwrap();
        assert!(reloaded.manifest().managed_installs.is_empty());
    }
}
