// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Agent configuration, read from `Config.yaml` in the managed-installs root.

use std::{
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::Error;

/// Cloud storage flavor backing the software repository, when any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    /// Plain HTTP(S) repository.
    #[default]
    None,
    /// Repository mirrored from an S3 bucket.
    Aws,
    /// Repository mirrored from an Azure blob container.
    Azure,
}

impl Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Aws => write!(f, "aws"),
            Self::Azure => write!(f, "azure"),
        }
    }
}

/// The agent configuration.
///
/// All paths default to subdirectories of the managed-installs root
/// (`C:\ProgramData\ManagedInstalls` on Windows) so a minimal config only
/// needs `software_repo_url` and `client_identifier`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case", default)]
pub struct Config {
    /// Base URL of the software repository.
    pub software_repo_url: String,
    /// Directory where installer artifacts are cached between runs.
    pub cache_path: PathBuf,
    /// Catalog names consulted in priority order.
    pub catalogs: Vec<String>,
    /// Name of this host's root manifest.
    pub client_identifier: String,
    /// Catalog assumed when an item carries none.
    pub default_catalog: String,
    /// Architecture assumed when detection fails.
    pub default_arch: String,
    /// Cloud storage flavor backing the repository.
    pub cloud_provider: CloudProvider,
    /// Bucket or container name for cloud-mirrored repositories.
    pub cloud_bucket: String,
    /// Whether imported pkg-info YAML should be opened in an editor.
    pub open_imported_yaml: bool,
    /// Basic-auth user for the repository, when it requires one.
    pub repo_user: String,
    /// Basic-auth password for the repository.
    pub repo_pass: String,
    /// Root directory for logs, state and the self-service manifest.
    pub managed_installs_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let root = default_root();
        Self {
            software_repo_url: String::new(),
            cache_path: root.join("Cache"),
            catalogs: Vec::new(),
            client_identifier: String::new(),
            default_catalog: "Production".into(),
            default_arch: std::env::consts::ARCH.to_string(),
            cloud_provider: CloudProvider::None,
            cloud_bucket: String::new(),
            open_imported_yaml: false,
            repo_user: String::new(),
            repo_pass: String::new(),
            managed_installs_dir: root,
        }
    }
}

fn default_root() -> PathBuf {
    #[cfg(windows)]
    {
        let program_data =
            std::env::var_os("ProgramData").map_or_else(|| PathBuf::from(r"C:\ProgramData"), PathBuf::from);
        program_data.join("ManagedInstalls")
    }
    #[cfg(not(windows))]
    {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("ManagedInstalls")
    }
}

impl Config {
    /// The well-known configuration file location for this host.
    pub fn default_path() -> PathBuf {
        default_root().join("Config.yaml")
    }

    /// Loads and validates the configuration at `path`.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let raw = fs::read_to_string(path).map_err(|_| Error::NoConfig(path.to_path_buf()))?;
        let config: Config = serde_yaml::from_str(&raw)?;
        if config.software_repo_url.trim().is_empty() {
            return Err(Error::EmptyRepoUrl);
        }
        Ok(config)
    }

    /// Catalog names to consult, falling back to the default catalog when the
    /// configured list is empty.
    pub fn active_catalogs(&self) -> Vec<String> {
        if self.catalogs.is_empty() {
            vec![self.default_catalog.clone()]
        } else {
            self.catalogs.clone()
        }
    }

    /// Directory that holds per-run session logs.
    pub fn logs_dir(&self) -> PathBuf {
        self.managed_installs_dir.join("logs")
    }

    /// Path of the writable self-service manifest.
    pub fn self_service_manifest_path(&self) -> PathBuf {
        self.managed_installs_dir
            .join("manifests")
            .join("SelfServeManifest")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_round_trip() {
        let yaml = r#"
software_repo_url: https://cimian.example.com/deployment
client_identifier: LAB-PC-001
catalogs:
  - Production
  - Testing
repo_user: svc-cimian
repo_pass: hunter2
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.client_identifier, "LAB-PC-001");
        assert_eq!(config.active_catalogs(), vec!["Production", "Testing"]);
        assert_eq!(config.cloud_provider, CloudProvider::None);
        assert!(config.cache_path.ends_with("Cache"));
    }

    #[test]
    fn empty_catalog_list_falls_back_to_default() {
        let config = Config {
            default_catalog: "Production".into(),
            ..Default::default()
        };
        assert_eq!(config.active_catalogs(), vec!["Production"]);
    }

    #[test]
    fn missing_repo_url_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Config.yaml");
        fs::write(&path, "client_identifier: host1\n").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::EmptyRepoUrl)));
    }
}
