// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Catalog documents and the session-scoped cache and index over them.
//!
//! A catalog is a YAML mapping `{ items: [...] }` fetched from
//! `catalogs/<name>.yaml` in the repository. Catalogs are cached for a few
//! minutes so the many lookups of a single run hit the network once.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::{
    download::RepoClient,
    facts::normalize_arch,
    predicates::OneOrMany,
    version,
};

/// How long a fetched catalog is reused before it is re-downloaded.
pub const CATALOG_TTL: Duration = Duration::from_secs(5 * 60);

/// The installer flavor of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallerKind {
    /// Windows Installer package driven by msiexec.
    Msi,
    /// Self-contained installer executable.
    Exe,
    /// PowerShell script artifact.
    Powershell,
    /// MSIX/AppX package.
    Msix,
    /// Chocolatey package driven by choco.
    Nupkg,
    /// No artifact; the item is its embedded scripts.
    ScriptOnly,
}

impl InstallerKind {
    /// Short tag used in logs and error messages.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Msi => "msi",
            Self::Exe => "exe",
            Self::Powershell => "powershell",
            Self::Msix => "msix",
            Self::Nupkg => "nupkg",
            Self::ScriptOnly => "script",
        }
    }
}

/// Installer descriptor of a catalog item.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case", default)]
pub struct InstallerInfo {
    /// One of `msi`, `exe`, `powershell`, `msix`, `nupkg`, `nopkg` or empty.
    #[serde(rename = "type")]
    pub kind: String,
    /// Repository-relative artifact path.
    pub location: String,
    /// SHA-256 of the artifact.
    pub hash: String,
    /// Artifact size in bytes.
    pub size: u64,
    /// MSI product code.
    pub product_code: String,
    /// MSI upgrade code.
    pub upgrade_code: String,
    /// Slash-style installer switches.
    pub switches: Vec<String>,
    /// Key or key=value flags, prefixed by heuristic at dispatch time.
    pub flags: Vec<String>,
    /// Opaque arguments appended verbatim.
    pub arguments: Vec<String>,
    /// Optional leading verb.
    pub verb: String,
}

/// One uninstall operation. Older catalogs carry a single mapping here;
/// newer ones carry a list.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case", default)]
pub struct UninstallOperation {
    /// One of `msi`, `exe`, `powershell`, `msix`, `nupkg` or empty.
    #[serde(rename = "type")]
    pub kind: String,
    /// Artifact or tool path, when the operation needs one.
    pub location: String,
    /// MSI product code for `msiexec /x`.
    pub product_code: String,
    /// Extra arguments.
    pub arguments: Vec<String>,
}

/// A declarative install probe: a file, directory or registry assertion.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case", default)]
pub struct InstallAssertion {
    /// One of `file`, `directory`, `registry`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Probed path (filesystem path or registry value path).
    pub path: String,
    /// Expected MD5 of the file, when set.
    pub md5checksum: Option<String>,
    /// Minimum product version, when set.
    pub version: Option<String>,
    /// MSI product code associated with the probe.
    pub product_code: Option<String>,
}

/// A catalog entry: one unit of installable software and its metadata.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case", default)]
pub struct Item {
    /// Unique name within a catalog.
    pub name: String,
    /// Human-facing name.
    pub display_name: String,
    /// Stable identifier (MSIX family name, bundle id, ...).
    pub identifier: String,
    /// Version string; date-style versions are normalized for comparisons.
    pub version: String,
    /// Free-form description.
    pub description: String,
    /// Grouping category.
    pub category: String,
    /// Publisher.
    pub developer: String,
    /// Catalogs this item belongs to.
    pub catalogs: Vec<String>,
    /// Architectures this item supports; empty means all.
    pub supported_architectures: Vec<String>,
    /// Installer descriptor; absent for script-only items.
    pub installer: Option<InstallerInfo>,
    /// Uninstall operations, accepting the legacy single-mapping form.
    #[serde(deserialize_with = "uninstaller_list")]
    pub uninstaller: Vec<UninstallOperation>,
    /// Declarative install probes.
    pub installs: Vec<InstallAssertion>,
    /// Hard prerequisites, as `Name`, `Name-Version` or `Name--Version` refs.
    pub requires: Vec<String>,
    /// Items this one is a companion update for.
    pub update_for: Vec<String>,
    /// Legacy flat prerequisite list, walked after `requires`.
    pub dependencies: Vec<String>,
    /// Process names that hold back installation while running.
    pub blocking_apps: Vec<String>,
    /// Run on every request and never recorded as installed.
    pub on_demand: bool,
    /// Minimum OS version this item applies to.
    #[serde(alias = "minimum_os_version")]
    pub min_os_version: String,
    /// Maximum OS version this item applies to.
    #[serde(alias = "maximum_os_version")]
    pub max_os_version: String,
    /// Install may proceed without user interaction.
    pub unattended_install: bool,
    /// Uninstall may proceed without user interaction.
    pub unattended_uninstall: bool,
    /// Ran before the installer.
    pub preinstall_script: String,
    /// Ran after the installer.
    pub postinstall_script: String,
    /// Ran before the uninstaller.
    pub preuninstall_script: String,
    /// Ran after the uninstaller.
    pub postuninstall_script: String,
    /// Decides installed-ness; exit 0 means not installed.
    #[serde(alias = "installcheck_script")]
    pub install_check_script: String,
    /// Decides installed-ness for uninstalls.
    #[serde(alias = "uninstallcheck_script")]
    pub uninstall_check_script: String,
}

fn uninstaller_list<'de, D>(deserializer: D) -> Result<Vec<UninstallOperation>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<OneOrMany<UninstallOperation>> = Option::deserialize(deserializer)?;
    Ok(match value {
        None => Vec::new(),
        Some(OneOrMany::One(op)) => vec![op],
        Some(OneOrMany::Many(ops)) => ops,
    })
}

fn kind_from_str(declared: &str) -> Option<InstallerKind> {
    match declared.to_ascii_lowercase().as_str() {
        "msi" => Some(InstallerKind::Msi),
        "exe" => Some(InstallerKind::Exe),
        "powershell" | "ps1" => Some(InstallerKind::Powershell),
        "msix" | "appx" => Some(InstallerKind::Msix),
        "nupkg" => Some(InstallerKind::Nupkg),
        _ => None,
    }
}

impl Item {
    /// The installer flavor, derived from the descriptor and scripts.
    pub fn kind(&self) -> InstallerKind {
        self.installer
            .as_ref()
            .and_then(|i| kind_from_str(&i.kind))
            .unwrap_or(InstallerKind::ScriptOnly)
    }

    /// The flavor driving removal: the first typed uninstall operation wins,
    /// falling back to the install flavor.
    pub fn uninstall_kind(&self) -> InstallerKind {
        self.uninstaller
            .iter()
            .find_map(|op| kind_from_str(&op.kind))
            .unwrap_or_else(|| self.kind())
    }

    /// True when the item is only its embedded scripts.
    pub fn is_script_only(&self) -> bool {
        self.kind() == InstallerKind::ScriptOnly && self.has_scripts()
    }

    /// True when any embedded script body is non-empty.
    pub fn has_scripts(&self) -> bool {
        [
            &self.preinstall_script,
            &self.postinstall_script,
            &self.preuninstall_script,
            &self.postuninstall_script,
            &self.install_check_script,
            &self.uninstall_check_script,
        ]
        .iter()
        .any(|s| !s.trim().is_empty())
    }

    /// A lookup hit must carry something executable: an artifact, uninstall
    /// operations, or scripts.
    pub fn is_usable(&self) -> bool {
        self.installer
            .as_ref()
            .map(|i| !i.location.trim().is_empty())
            .unwrap_or(false)
            || !self.uninstaller.is_empty()
            || self.has_scripts()
    }

    /// Name shown to users, falling back to the catalog name.
    pub fn label(&self) -> &str {
        if self.display_name.trim().is_empty() {
            &self.name
        } else {
            &self.display_name
        }
    }

    /// True when this item can run on `host_arch` (normalized spelling).
    pub fn supports_architecture(&self, host_arch: &str) -> bool {
        if self.supported_architectures.is_empty() {
            return true;
        }
        let host = normalize_arch(host_arch);
        self.supported_architectures
            .iter()
            .any(|a| normalize_arch(a) == host)
    }

    /// Minimal stand-in for an item that has disappeared from all catalogs
    /// but must still be uninstalled via its recorded registry state.
    pub fn stub_for_uninstall(name: &str) -> Self {
        Self {
            name: name.to_string(),
            uninstaller: vec![UninstallOperation {
                kind: "msi".into(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

/// One catalog document.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct Catalog {
    /// The items of this catalog, in authoring order.
    pub items: Vec<Item>,
}

struct CachedCatalog {
    fetched_at: Instant,
    catalog: Arc<Catalog>,
}

/// Session-scoped catalog store. Lookups download on miss or expiry and
/// otherwise serve the cached parse.
pub struct CatalogCache {
    repo: Arc<dyn RepoClient>,
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedCatalog>>,
}

impl CatalogCache {
    /// A cache over `repo` with the default TTL.
    pub fn new(repo: Arc<dyn RepoClient>) -> Self {
        Self::with_ttl(repo, CATALOG_TTL)
    }

    /// A cache with an explicit TTL, used by tests.
    pub fn with_ttl(repo: Arc<dyn RepoClient>, ttl: Duration) -> Self {
        Self {
            repo,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The catalog named `name`, downloading it when absent or stale.
    pub fn get(&self, name: &str) -> crate::Result<Arc<Catalog>> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(cached) = entries.get(name) {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.catalog.clone());
            }
        }

        tracing::debug!("fetching catalog `{name}`");
        let bytes = self.repo.fetch(&format!("catalogs/{name}.yaml"))?;
        let catalog: Catalog = if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            Catalog::default()
        } else {
            serde_yaml::from_slice(&bytes)?
        };
        let catalog = Arc::new(catalog);
        entries.insert(
            name.to_string(),
            CachedCatalog {
                fetched_at: Instant::now(),
                catalog: catalog.clone(),
            },
        );
        Ok(catalog)
    }

    /// Drops all cached catalogs.
    pub fn flush(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// Indexed accessors over the configured catalogs, in declared order.
pub struct CatalogIndex {
    cache: Arc<CatalogCache>,
    catalogs: Vec<String>,
    host_arch: String,
}

impl CatalogIndex {
    /// An index over `catalogs` for a host of architecture `host_arch`.
    pub fn new(cache: Arc<CatalogCache>, catalogs: Vec<String>, host_arch: &str) -> Self {
        Self {
            cache,
            catalogs,
            host_arch: normalize_arch(host_arch),
        }
    }

    /// The host architecture this index arbitrates for.
    pub fn host_arch(&self) -> &str {
        &self.host_arch
    }

    fn each_catalog(&self) -> Vec<Arc<Catalog>> {
        let mut out = Vec::new();
        for name in &self.catalogs {
            match self.cache.get(name) {
                Ok(catalog) => out.push(catalog),
                Err(e) => tracing::warn!("catalog `{name}` unavailable: {e}"),
            }
        }
        out
    }

    /// The first architecture-compatible usable item named `name`.
    ///
    /// When entries of that name exist but none support the host
    /// architecture, the first candidate is returned with a warning rather
    /// than failing the lookup.
    pub fn find(&self, name: &str) -> Option<Item> {
        let mut candidates: Vec<Item> = Vec::new();
        for catalog in self.each_catalog() {
            for item in &catalog.items {
                if item.name.eq_ignore_ascii_case(name) && item.is_usable() {
                    candidates.push(item.clone());
                }
            }
        }

        if candidates.is_empty() {
            return None;
        }

        if let Some(hit) = candidates
            .iter()
            .find(|i| i.supports_architecture(&self.host_arch))
        {
            return Some(hit.clone());
        }

        tracing::warn!(
            "no {} variant of `{name}`; falling back to the first of {} candidates",
            self.host_arch,
            candidates.len()
        );
        Some(candidates.swap_remove(0))
    }

    /// Names of every item whose `update_for` references `name` in any of
    /// its `Name`, `Name-Version` or `Name--Version` spellings.
    pub fn updates_for(&self, name: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for catalog in self.each_catalog() {
            for item in &catalog.items {
                let references = item.update_for.iter().any(|entry| {
                    let (base, _) = version::split_name_version(entry);
                    base.eq_ignore_ascii_case(name)
                });
                if references && !out.iter().any(|n| n.eq_ignore_ascii_case(&item.name)) {
                    out.push(item.name.clone());
                }
            }
        }
        out
    }

    /// Every item whose `requires` (or legacy `dependencies`) references
    /// `name`.
    pub fn items_requiring(&self, name: &str) -> Vec<Item> {
        let mut out: Vec<Item> = Vec::new();
        for catalog in self.each_catalog() {
            for item in &catalog.items {
                let references = item
                    .requires
                    .iter()
                    .chain(item.dependencies.iter())
                    .any(|entry| {
                        let (base, _) = version::split_name_version(entry);
                        base.eq_ignore_ascii_case(name)
                    });
                if references && !out.iter().any(|i| i.name.eq_ignore_ascii_case(&item.name)) {
                    out.push(item.clone());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::DirRepo;
    use std::fs;

    fn repo_with_catalog(yaml: &str) -> (tempfile::TempDir, Arc<dyn RepoClient>) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("catalogs")).unwrap();
        fs::write(dir.path().join("catalogs/Production.yaml"), yaml).unwrap();
        let repo: Arc<dyn RepoClient> = Arc::new(DirRepo::new(dir.path().to_path_buf()));
        (dir, repo)
    }

    fn index(repo: Arc<dyn RepoClient>, arch: &str) -> CatalogIndex {
        CatalogIndex::new(
            Arc::new(CatalogCache::new(repo)),
            vec!["Production".into()],
            arch,
        )
    }

    const CATALOG: &str = r#"
items:
  - name: Foo
    version: "1.0"
    supported_architectures: [x64]
    installer:
      type: msi
      location: pkgs/foo/foo-1.0.msi
      hash: aa
      size: 10
  - name: Foo
    version: "1.0"
    supported_architectures: [arm64]
    installer:
      type: msi
      location: pkgs/foo/foo-1.0-arm64.msi
      hash: bb
      size: 10
  - name: RawPlugin
    version: "2.0"
    update_for: [Foo]
    installer:
      type: exe
      location: pkgs/raw/raw.exe
      hash: cc
      size: 5
  - name: Suite
    version: "3.0"
    requires: [Foo--1.0]
    installer:
      type: exe
      location: pkgs/suite/suite.exe
      hash: dd
      size: 5
  - name: Ghost
    version: "9.9"
"#;

    #[test]
    fn architecture_arbitration_prefers_host_arch() {
        let (_dir, repo) = repo_with_catalog(CATALOG);
        let hit = index(repo, "arm64").find("Foo").unwrap();
        assert_eq!(hit.installer.unwrap().location, "pkgs/foo/foo-1.0-arm64.msi");
    }

    #[test]
    fn architecture_mismatch_falls_back_to_first_candidate() {
        let (_dir, repo) = repo_with_catalog(CATALOG);
        let hit = index(repo, "x86").find("Foo").unwrap();
        assert_eq!(hit.installer.unwrap().location, "pkgs/foo/foo-1.0.msi");
    }

    #[test]
    fn items_without_substance_are_not_hits() {
        let (_dir, repo) = repo_with_catalog(CATALOG);
        assert!(index(repo, "x64").find("Ghost").is_none());
    }

    #[test]
    fn update_and_requires_scans() {
        let (_dir, repo) = repo_with_catalog(CATALOG);
        let idx = index(repo, "x64");
        assert_eq!(idx.updates_for("foo"), vec!["RawPlugin"]);
        let requiring = idx.items_requiring("Foo");
        assert_eq!(requiring.len(), 1);
        assert_eq!(requiring[0].name, "Suite");
    }

    #[test]
    fn single_uninstaller_mapping_becomes_a_list() {
        let yaml = r#"
name: OldStyle
version: "1.0"
uninstaller:
  type: msi
  product_code: "{AAAA-BBBB}"
"#;
        let item: Item = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(item.uninstaller.len(), 1);
        assert_eq!(item.uninstaller[0].product_code, "{AAAA-BBBB}");

        let yaml_list = r#"
name: NewStyle
version: "1.0"
uninstaller:
  - type: msi
    product_code: "{AAAA}"
  - type: exe
    location: C:\tools\cleanup.exe
"#;
        let item: Item = serde_yaml::from_str(yaml_list).unwrap();
        assert_eq!(item.uninstaller.len(), 2);
    }

    #[test]
    fn cache_hits_within_ttl_do_not_refetch() {
        let (dir, repo) = repo_with_catalog(CATALOG);
        let cache = CatalogCache::new(repo);
        let first = cache.get("Production").unwrap();
        // Corrupt the backing file; a cached parse must still be served.
        fs::write(dir.path().join("catalogs/Production.yaml"), ": not yaml").unwrap();
        let second = cache.get("Production").unwrap();
        assert_eq!(first.items.len(), second.items.len());
    }
}
