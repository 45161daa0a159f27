// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! What this host believes is installed: a map of item name to version
//! string. Production binds to the per-machine registry subtree
//! `Software\ManagedInstalls\<Name>\Version`; a YAML file store backs
//! non-Windows development and an in-memory store backs tests.

use std::collections::BTreeMap;

/// Authoritative record of installed item versions.
///
/// Writes happen only after an installer reports success; removals only
/// after a successful uninstall, and removing an absent record succeeds.
pub trait InstalledVersionStore: Send + Sync {
    /// The recorded version of `name`, if any.
    fn get(&self, name: &str) -> crate::Result<Option<String>>;
    /// Records `version` for `name`.
    fn set(&self, name: &str, version: &str) -> crate::Result<()>;
    /// Deletes the record for `name`. Idempotent.
    fn remove(&self, name: &str) -> crate::Result<()>;
    /// All records, for the reverse dependency walk.
    fn all(&self) -> crate::Result<BTreeMap<String, String>>;
}

/// Display form of a recorded version; absence reads as `Never`.
pub fn display_recorded(version: Option<&str>) -> String {
    match version {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => "Never".to_string(),
    }
}

/// Volatile store for unit tests.
#[derive(Default)]
pub struct MemoryStore {
    records: std::sync::Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-seeded with records.
    pub fn with_records<I, K, V>(records: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            records: std::sync::Mutex::new(
                records
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

impl InstalledVersionStore for MemoryStore {
    fn get(&self, name: &str) -> crate::Result<Option<String>> {
        Ok(self.records.lock().unwrap().get(name).cloned())
    }

    fn set(&self, name: &str, version: &str) -> crate::Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert(name.to_string(), version.to_string());
        Ok(())
    }

    fn remove(&self, name: &str) -> crate::Result<()> {
        self.records.lock().unwrap().remove(name);
        Ok(())
    }

    fn all(&self) -> crate::Result<BTreeMap<String, String>> {
        Ok(self.records.lock().unwrap().clone())
    }
}

/// YAML-file-backed store for hosts without a per-machine registry.
pub struct FileStore {
    path: std::path::PathBuf,
    records: std::sync::Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Opens (or initializes) the store at `path`.
    pub fn open(path: std::path::PathBuf) -> crate::Result<Self> {
        let records = match std::fs::read_to_string(&path) {
            Ok(raw) if !raw.trim().is_empty() => serde_yaml::from_str(&raw)?,
            _ => BTreeMap::new(),
        };
        Ok(Self {
            path,
            records: std::sync::Mutex::new(records),
        })
    }

    fn persist(&self, records: &BTreeMap<String, String>) -> crate::Result<()> {
        let raw = serde_yaml::to_string(records)?;
        crate::util::replace_file_atomic(&self.path, raw.as_bytes())
    }
}

impl InstalledVersionStore for FileStore {
    fn get(&self, name: &str) -> crate::Result<Option<String>> {
        Ok(self.records.lock().unwrap().get(name).cloned())
    }

    fn set(&self, name: &str, version: &str) -> crate::Result<()> {
        let mut records = self.records.lock().unwrap();
        records.insert(name.to_string(), version.to_string());
        self.persist(&records)
    }

    fn remove(&self, name: &str) -> crate::Result<()> {
        let mut records = self.records.lock().unwrap();
        if records.remove(name).is_some() {
            self.persist(&records)?;
        }
        Ok(())
    }

    fn all(&self) -> crate::Result<BTreeMap<String, String>> {
        Ok(self.records.lock().unwrap().clone())
    }
}

/// Registry-backed store under `HKLM\Software\ManagedInstalls`.
#[cfg(windows)]
pub struct RegistryStore {
    root: String,
}

#[cfg(windows)]
impl RegistryStore {
    const DEFAULT_ROOT: &'static str = r"Software\ManagedInstalls";

    /// The per-machine production store.
    pub fn per_machine() -> Self {
        Self {
            root: Self::DEFAULT_ROOT.to_string(),
        }
    }

    fn hklm() -> winreg::RegKey {
        winreg::RegKey::predef(winreg::enums::HKEY_LOCAL_MACHINE)
    }
}

#[cfg(windows)]
impl InstalledVersionStore for RegistryStore {
    fn get(&self, name: &str) -> crate::Result<Option<String>> {
        let path = format!(r"{}\{name}", self.root);
        match Self::hklm().open_subkey(&path) {
            Ok(key) => match key.get_value::<String, _>("Version") {
                Ok(version) => Ok(Some(version)),
                Err(_) => Ok(None),
            },
            Err(_) => Ok(None),
        }
    }

    fn set(&self, name: &str, version: &str) -> crate::Result<()> {
        let path = format!(r"{}\{name}", self.root);
        let (key, _) = Self::hklm()
            .create_subkey(&path)
            .map_err(|e| crate::Error::Store(e.to_string()))?;
        key.set_value("Version", &version.to_string())
            .map_err(|e| crate::Error::Store(e.to_string()))
    }

    fn remove(&self, name: &str) -> crate::Result<()> {
        let path = format!(r"{}\{name}", self.root);
        match Self::hklm().delete_subkey_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(crate::Error::Store(e.to_string())),
        }
    }

    fn all(&self) -> crate::Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        let Ok(root) = Self::hklm().open_subkey(&self.root) else {
            return Ok(out);
        };
        for name in root.enum_keys().flatten() {
            if let Ok(sub) = root.open_subkey(&name) {
                if let Ok(version) = sub.get_value::<String, _>("Version") {
                    out.insert(name, version);
                }
            }
        }
        Ok(out)
    }
}

/// The production store for this platform: registry on Windows, a YAML file
/// under the managed-installs root elsewhere.
pub fn platform_store(root: &std::path::Path) -> crate::Result<Box<dyn InstalledVersionStore>> {
    #[cfg(windows)]
    {
        let _ = root;
        Ok(Box::new(RegistryStore::per_machine()))
    }
    #[cfg(not(windows))]
    {
        Ok(Box::new(FileStore::open(root.join("installed-versions.yaml"))?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_round_trip_preserves_exact_strings() {
        let store = MemoryStore::new();
        store.set("GoogleChrome", "126.0.6478.127").unwrap();
        assert_eq!(
            store.get("GoogleChrome").unwrap().as_deref(),
            Some("126.0.6478.127")
        );
        store.remove("GoogleChrome").unwrap();
        assert_eq!(store.get("GoogleChrome").unwrap(), None);
        // removing again is not an error
        store.remove("GoogleChrome").unwrap();
    }

    #[test]
    fn absent_records_display_as_never() {
        assert_eq!(display_recorded(None), "Never");
        assert_eq!(display_recorded(Some("")), "Never");
        assert_eq!(display_recorded(Some("1.0")), "1.0");
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("installed-versions.yaml");
        {
            let store = FileStore::open(path.clone()).unwrap();
            store.set("SevenZip", "24.08").unwrap();
            store.set("Git", "2.46.0").unwrap();
            store.remove("Git").unwrap();
        }
        let store = FileStore::open(path).unwrap();
        assert_eq!(store.get("SevenZip").unwrap().as_deref(), Some("24.08"));
        assert_eq!(store.get("Git").unwrap(), None);
        assert_eq!(store.all().unwrap().len(), 1);
    }
}
