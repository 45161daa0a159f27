// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Host facts consumed by conditional manifest blocks. Facts come from
//! registered providers; later registrations win on key collisions, so a
//! deployment can shadow a built-in fact with its own provider.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use sysinfo::System;
use time::OffsetDateTime;

/// A single fact value. Scalars are compared as strings; lists support the
/// membership operators.
#[derive(Debug, Clone, PartialEq)]
pub enum FactValue {
    /// Free-form string.
    Str(String),
    /// Integer, formatted decimally for comparisons.
    Int(i64),
    /// Boolean, formatted as `true`/`false` for comparisons.
    Bool(bool),
    /// List of strings.
    List(Vec<String>),
    /// Point in time, formatted as RFC 3339 for comparisons.
    Time(OffsetDateTime),
}

impl FactValue {
    /// The string form used by the predicate engine.
    pub fn to_comparable(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            Self::List(l) => l.join(","),
            Self::Time(t) => t
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_default(),
        }
    }

    /// The list form, when this fact is a list.
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }
}

impl Display for FactValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_comparable())
    }
}

/// Map of fact name to value.
pub type FactMap = BTreeMap<String, FactValue>;

/// A source of host facts, merged at gather time.
pub trait FactProvider: Send + Sync {
    /// Provider name, for diagnostics.
    fn name(&self) -> &'static str;
    /// The facts this provider currently observes.
    fn facts(&self) -> FactMap;
}

/// Collects facts from all registered providers.
#[derive(Default)]
pub struct FactCollector {
    providers: Vec<Box<dyn FactProvider>>,
}

impl FactCollector {
    /// An empty collector. Tests register static providers on this.
    pub fn new() -> Self {
        Self::default()
    }

    /// The production collector: base host facts, hardware-derived facts and
    /// the active catalog list.
    pub fn with_defaults(active_catalogs: Vec<String>) -> Self {
        let mut collector = Self::new();
        collector.register(Box::new(BaseFactProvider));
        collector.register(Box::new(HardwareFactProvider));
        collector.register(Box::new(CatalogFactProvider {
            catalogs: active_catalogs,
        }));
        collector
    }

    /// Registers an additional provider. Later providers override earlier
    /// ones on duplicate keys.
    pub fn register(&mut self, provider: Box<dyn FactProvider>) {
        self.providers.push(provider);
    }

    /// Gathers all facts into one map, last writer wins.
    pub fn gather(&self) -> Facts {
        let mut map = FactMap::new();
        for provider in &self.providers {
            let facts = provider.facts();
            tracing::trace!("provider `{}` contributed {} facts", provider.name(), facts.len());
            map.extend(facts);
        }
        Facts(map)
    }
}

/// The merged fact set for one evaluation pass.
#[derive(Debug, Clone, Default)]
pub struct Facts(FactMap);

impl Facts {
    /// Wraps a pre-built map, used by tests.
    pub fn from_map(map: FactMap) -> Self {
        Self(map)
    }

    /// Looks up a fact by exact key.
    pub fn get(&self, key: &str) -> Option<&FactValue> {
        self.0.get(key)
    }

    /// Number of facts gathered.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no facts are present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Canonical architecture spelling: `amd64` and `x86_64` collapse to `x64`,
/// `386` to `x86`, `aarch64` to `arm64`, everything else is lowercased.
pub fn normalize_arch(arch: &str) -> String {
    match arch.to_ascii_lowercase().as_str() {
        "amd64" | "x86_64" => "x64".into(),
        "386" => "x86".into(),
        "aarch64" => "arm64".into(),
        other => other.into(),
    }
}

/// Hostname, OS version, architecture, date and user.
struct BaseFactProvider;

impl FactProvider for BaseFactProvider {
    fn name(&self) -> &'static str {
        "base"
    }

    fn facts(&self) -> FactMap {
        let mut map = FactMap::new();
        map.insert(
            "hostname".into(),
            FactValue::Str(System::host_name().unwrap_or_else(|| "unknown".into())),
        );
        map.insert(
            "os_version".into(),
            FactValue::Str(System::os_version().unwrap_or_default()),
        );
        let arch = normalize_arch(std::env::consts::ARCH);
        map.insert("arch".into(), FactValue::Str(arch.clone()));
        map.insert("architecture".into(), FactValue::Str(arch));
        map.insert(
            "date".into(),
            FactValue::Time(OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())),
        );
        map.insert(
            "username".into(),
            FactValue::Str(
                std::env::var("USERNAME")
                    .or_else(|_| std::env::var("USER"))
                    .unwrap_or_default(),
            ),
        );
        map
    }
}

/// Chassis class, machine model, battery and directory-join state. These are
/// WMI-backed on Windows and degrade to `unknown` elsewhere, so conditional
/// blocks keyed on them simply never match on development machines.
struct HardwareFactProvider;

impl FactProvider for HardwareFactProvider {
    fn name(&self) -> &'static str {
        "hardware"
    }

    fn facts(&self) -> FactMap {
        let mut map = FactMap::new();
        map.insert(
            "machine_type".into(),
            FactValue::Str(machine_type_from_chassis(chassis_types()).to_string()),
        );
        map.insert("machine_model".into(), FactValue::Str(machine_model()));
        map.insert("battery_state".into(), FactValue::Str(battery_state()));
        let (domain, joined) = domain_join_state();
        map.insert("domain".into(), FactValue::Str(domain));
        map.insert("joined_type".into(), FactValue::Str(joined));
        map
    }
}

/// Publishes the configured catalog list as the `catalogs` fact.
struct CatalogFactProvider {
    catalogs: Vec<String>,
}

impl FactProvider for CatalogFactProvider {
    fn name(&self) -> &'static str {
        "catalogs"
    }

    fn facts(&self) -> FactMap {
        let mut map = FactMap::new();
        map.insert("catalogs".into(), FactValue::List(self.catalogs.clone()));
        map
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MachineType {
    Laptop,
    Desktop,
    Unknown,
}

impl Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Laptop => write!(f, "laptop"),
            Self::Desktop => write!(f, "desktop"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

// SMBIOS chassis classes: portable/notebook/sub-notebook/tablet family vs
// desktop/tower family.
fn machine_type_from_chassis(chassis: Vec<u32>) -> MachineType {
    for class in chassis {
        match class {
            8..=14 | 30..=32 => return MachineType::Laptop,
            3..=7 | 15 | 16 | 24 => return MachineType::Desktop,
            _ => (),
        }
    }
    MachineType::Unknown
}

#[cfg(windows)]
fn powershell_value(expression: &str) -> Option<String> {
    use crate::shell::CommandExt;
    let output = std::process::Command::new("powershell.exe")
        .args(["-NoProfile", "-NonInteractive", "-Command", expression])
        .output_captured()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn chassis_types() -> Vec<u32> {
    #[cfg(windows)]
    {
        powershell_value("(Get-CimInstance Win32_SystemEnclosure).ChassisTypes")
            .map(|text| {
                text.split_whitespace()
                    .filter_map(|t| t.parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
    #[cfg(not(windows))]
    {
        Vec::new()
    }
}

fn machine_model() -> String {
    #[cfg(windows)]
    {
        powershell_value("(Get-CimInstance Win32_ComputerSystem).Model").unwrap_or_else(|| "unknown".into())
    }
    #[cfg(not(windows))]
    {
        "unknown".into()
    }
}

fn battery_state() -> String {
    #[cfg(windows)]
    {
        match powershell_value("(Get-CimInstance Win32_Battery).BatteryStatus") {
            // 2 = on AC power, 1 = discharging; remaining codes are
            // transitional charge states.
            Some(code) => match code.split_whitespace().next() {
                Some("1") => "discharging".into(),
                Some("2") => "ac_power".into(),
                Some(_) => "charging".into(),
                None => "none".into(),
            },
            None => "none".into(),
        }
    }
    #[cfg(not(windows))]
    {
        "none".into()
    }
}

fn domain_join_state() -> (String, String) {
    #[cfg(windows)]
    {
        let domain = powershell_value("(Get-CimInstance Win32_ComputerSystem).Domain")
            .unwrap_or_else(|| "WORKGROUP".into());
        let dsreg = std::process::Command::new("dsregcmd")
            .arg("/status")
            .output()
            .ok()
            .map(|o| String::from_utf8_lossy(&o.stdout).to_string())
            .unwrap_or_default();
        let flag = |key: &str| {
            dsreg
                .lines()
                .find(|l| l.trim_start().starts_with(key))
                .map(|l| l.contains("YES"))
                .unwrap_or(false)
        };
        let joined = match (flag("AzureAdJoined"), flag("DomainJoined")) {
            (true, true) => "hybrid",
            (true, false) => "entra",
            (false, true) => "domain",
            (false, false) => {
                if domain.eq_ignore_ascii_case("WORKGROUP") {
                    "workgroup"
                } else {
                    "unknown"
                }
            }
        };
        (domain, joined.into())
    }
    #[cfg(not(windows))]
    {
        ("WORKGROUP".into(), "workgroup".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticProvider(FactMap);

    impl FactProvider for StaticProvider {
        fn name(&self) -> &'static str {
            "static"
        }
        fn facts(&self) -> FactMap {
            self.0.clone()
        }
    }

    #[test]
    fn later_providers_win_on_duplicate_keys() {
        let mut collector = FactCollector::new();
        let mut a = FactMap::new();
        a.insert("hostname".into(), FactValue::Str("first".into()));
        let mut b = FactMap::new();
        b.insert("hostname".into(), FactValue::Str("second".into()));
        collector.register(Box::new(StaticProvider(a)));
        collector.register(Box::new(StaticProvider(b)));
        let facts = collector.gather();
        assert_eq!(facts.get("hostname").unwrap().to_comparable(), "second");
    }

    #[test]
    fn arch_spellings_collapse() {
        assert_eq!(normalize_arch("AMD64"), "x64");
        assert_eq!(normalize_arch("x86_64"), "x64");
        assert_eq!(normalize_arch("386"), "x86");
        assert_eq!(normalize_arch("aarch64"), "arm64");
        assert_eq!(normalize_arch("ARM64"), "arm64");
        assert_eq!(normalize_arch("riscv64"), "riscv64");
    }

    #[test]
    fn chassis_classification() {
        assert_eq!(machine_type_from_chassis(vec![9]), MachineType::Laptop);
        assert_eq!(machine_type_from_chassis(vec![31]), MachineType::Laptop);
        assert_eq!(machine_type_from_chassis(vec![3]), MachineType::Desktop);
        assert_eq!(machine_type_from_chassis(vec![99]), MachineType::Unknown);
        assert_eq!(machine_type_from_chassis(Vec::new()), MachineType::Unknown);
    }

    #[test]
    fn comparable_formats() {
        assert_eq!(FactValue::Int(42).to_comparable(), "42");
        assert_eq!(FactValue::Bool(true).to_comparable(), "true");
        assert_eq!(
            FactValue::List(vec!["a".into(), "b".into()]).to_comparable(),
            "a,b"
        );
    }
}
