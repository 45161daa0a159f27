// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Per-installer-type backends behind one dispatch entry point.
//!
//! Every backend takes the same request shape, launches the native tool with
//! its silent flags, maps well-known exit codes to semantic outcomes and
//! returns captured console output for diagnostics.

use std::{
    path::Path,
    sync::Mutex,
    time::Duration,
};

use sysinfo::{ProcessRefreshKind, RefreshKind, System};

use crate::{
    catalog::{InstallerInfo, InstallerKind, Item},
    session::Session,
    status::Action,
    Error,
};

mod exe;
mod msi;
mod msix;
mod nupkg;
mod powershell;
pub mod script;

/// Default per-installer wall-clock budget.
pub const INSTALLER_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// msiexec processes older than this are treated as orphaned and terminated
/// before a new MSI run begins.
const ORPHANED_MSIEXEC_AGE: Duration = Duration::from_secs(30 * 60);

/// What a backend is asked to do.
pub struct DispatchRequest<'a> {
    /// The catalog item.
    pub item: &'a Item,
    /// Install, update or uninstall.
    pub action: Action,
    /// The staged artifact, when the item has one.
    pub artifact: Option<&'a Path>,
    /// The artifact cache directory (nupkg installs use it as a source feed).
    pub cache_dir: &'a Path,
}

/// Semantic result of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The native tool reported success.
    Success,
    /// Success, but the machine wants a reboot to finish.
    RebootRequired,
    /// Held back because one of these processes is running.
    Blocked(Vec<String>),
}

/// Backend output returned to the orchestrator.
#[derive(Debug, Clone)]
pub struct DispatchOutput {
    /// The semantic outcome.
    pub outcome: Outcome,
    /// Tail of the captured console output, for logs.
    pub console: String,
}

impl DispatchOutput {
    fn success(console: String) -> Self {
        Self {
            outcome: Outcome::Success,
            console,
        }
    }
}

/// Uniform entry point the orchestrator drives. Production uses
/// [`NativeDispatcher`]; tests substitute a recording fake.
pub trait Dispatcher: Send + Sync {
    /// Executes `request`, including the item's pre/post scripts.
    fn dispatch(
        &self,
        request: &DispatchRequest<'_>,
        session: &Session,
    ) -> crate::Result<DispatchOutput>;
}

/// Dispatcher that launches real native installers.
pub struct NativeDispatcher {
    // machine-wide installer service tolerates one install at a time
    msi_gate: Mutex<()>,
    timeout: Duration,
}

impl Default for NativeDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeDispatcher {
    /// A dispatcher with the default installer timeout.
    pub fn new() -> Self {
        Self::with_timeout(INSTALLER_TIMEOUT)
    }

    /// A dispatcher with an explicit timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            msi_gate: Mutex::new(()),
            timeout,
        }
    }
}

impl Dispatcher for NativeDispatcher {
    fn dispatch(
        &self,
        request: &DispatchRequest<'_>,
        session: &Session,
    ) -> crate::Result<DispatchOutput> {
        let item = request.item;

        if request.action != Action::Uninstall && !item.blocking_apps.is_empty() {
            let running = running_blocking_apps(&item.blocking_apps);
            if !running.is_empty() {
                session.log_line(
                    tracing::Level::WARN,
                    &format!(
                        "`{}` held back; blocking apps running: {}",
                        item.name,
                        running.join(", ")
                    ),
                );
                return Ok(DispatchOutput {
                    outcome: Outcome::Blocked(running),
                    console: String::new(),
                });
            }
        }

        let (pre, post) = match request.action {
            Action::Uninstall => (&item.preuninstall_script, &item.postuninstall_script),
            _ => (&item.preinstall_script, &item.postinstall_script),
        };
        let pre_stage: &'static str = if request.action == Action::Uninstall {
            "preuninstall"
        } else {
            "preinstall"
        };
        let post_stage: &'static str = if request.action == Action::Uninstall {
            "postuninstall"
        } else {
            "postinstall"
        };

        script::run_script_stage(pre, &item.name, pre_stage)?;

        let kind = match request.action {
            Action::Uninstall => item.uninstall_kind(),
            _ => item.kind(),
        };
        let output = match kind {
            InstallerKind::Msi => {
                let _serialized = self.msi_gate.lock().unwrap();
                terminate_orphaned_msiexec();
                msi::run(request, session, self.timeout)?
            }
            InstallerKind::Exe => exe::run(request, session, self.timeout)?,
            InstallerKind::Powershell => powershell::run(request, session, self.timeout)?,
            InstallerKind::Msix => msix::run(request, session, self.timeout)?,
            InstallerKind::Nupkg => nupkg::run(request, session, self.timeout)?,
            InstallerKind::ScriptOnly => {
                // the pre/post stages *are* the install
                DispatchOutput::success(String::new())
            }
        };

        script::run_script_stage(post, &item.name, post_stage)?;

        Ok(output)
    }
}

/// Composes the argv tail from `switches`, `flags`, `arguments` and the
/// optional verb.
///
/// Switches are slash-prefixed; flags get a dash prefix by heuristic when
/// the author did not write one; arguments pass through verbatim.
pub(crate) fn compose_args(info: &InstallerInfo, kind: InstallerKind) -> Vec<String> {
    let mut args = Vec::new();
    if !info.verb.trim().is_empty() {
        args.push(info.verb.trim().to_string());
    }
    for switch in &info.switches {
        let switch = switch.trim();
        if switch.is_empty() {
            continue;
        }
        if switch.starts_with('/') || switch.starts_with('-') {
            args.push(switch.to_string());
        } else {
            args.push(format!("/{switch}"));
        }
    }
    for flag in &info.flags {
        args.extend(compose_flag(flag, kind));
    }
    for argument in &info.arguments {
        if !argument.trim().is_empty() {
            args.push(argument.clone());
        }
    }
    args
}

fn compose_flag(raw: &str, kind: InstallerKind) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    // the author already chose a prefix
    if raw.starts_with('-') || raw.starts_with('/') {
        return vec![raw.to_string()];
    }

    let (key, value) = match raw.split_once('=') {
        Some((k, v)) => (k.trim(), Some(v.trim())),
        None => (raw, None),
    };

    let is_property_key = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if is_property_key {
        let value = value.unwrap_or_default();
        let value = if value.chars().any(char::is_whitespace) {
            format!("\"{value}\"")
        } else {
            value.to_string()
        };
        return vec![format!("{key}={value}")];
    }

    let prefix = if key.len() <= 3 {
        "-"
    } else if key.contains('_') {
        "--"
    } else if kind == InstallerKind::Msi {
        "-"
    } else {
        "--"
    };

    let mut out = vec![format!("{prefix}{key}")];
    if let Some(value) = value.filter(|v| !v.is_empty()) {
        out.push(value.to_string());
    }
    out
}

fn refreshed_processes() -> System {
    System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    )
}

/// Process names from `blocking_apps` that are currently running, compared
/// case-insensitively and tolerant of a missing `.exe` suffix.
pub(crate) fn running_blocking_apps(apps: &[String]) -> Vec<String> {
    let system = refreshed_processes();
    let mut running = Vec::new();
    for app in apps {
        let wanted = app.trim().trim_end_matches(".exe").to_ascii_lowercase();
        if wanted.is_empty() {
            continue;
        }
        let hit = system.processes().values().any(|process| {
            process
                .name()
                .trim_end_matches(".exe")
                .eq_ignore_ascii_case(&wanted)
        });
        if hit && !running.contains(app) {
            running.push(app.clone());
        }
    }
    running
}

// A wedged Windows Installer service commonly traces back to an abandoned
// msiexec child from a previous run.
fn terminate_orphaned_msiexec() {
    let system = refreshed_processes();
    for process in system.processes().values() {
        if !process.name().eq_ignore_ascii_case("msiexec.exe") {
            continue;
        }
        if Duration::from_secs(process.run_time()) > ORPHANED_MSIEXEC_AGE {
            tracing::warn!(
                "terminating orphaned msiexec (pid {}, running {}s)",
                process.pid(),
                process.run_time()
            );
            process.kill();
        }
    }
}

pub(crate) fn stderr_tail(output: &std::process::Output) -> String {
    let text = if output.stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout)
    } else {
        String::from_utf8_lossy(&output.stderr)
    };
    let lines: Vec<&str> = text.lines().rev().take(8).collect();
    lines.into_iter().rev().collect::<Vec<_>>().join("\n")
}

pub(crate) fn timeout_error(item: &Item, backend: &'static str, timeout: Duration) -> Error {
    Error::InstallerTimeout {
        item: item.name.clone(),
        backend,
        seconds: timeout.as_secs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(
        switches: &[&str],
        flags: &[&str],
        arguments: &[&str],
        verb: &str,
    ) -> InstallerInfo {
        InstallerInfo {
            switches: switches.iter().map(|s| s.to_string()).collect(),
            flags: flags.iter().map(|s| s.to_string()).collect(),
            arguments: arguments.iter().map(|s| s.to_string()).collect(),
            verb: verb.into(),
            ..Default::default()
        }
    }

    #[test]
    fn switches_are_slash_prefixed() {
        let args = compose_args(&info(&["S", "/VERYSILENT"], &[], &[], ""), InstallerKind::Exe);
        assert_eq!(args, vec!["/S", "/VERYSILENT"]);
    }

    #[test]
    fn property_flags_stay_key_value() {
        let args = compose_args(
            &info(&[], &["ALLUSERS=1", "INSTALL_DIR=C:\\Program Files\\Tool"], &[], ""),
            InstallerKind::Msi,
        );
        assert_eq!(
            args,
            vec!["ALLUSERS=1", "INSTALL_DIR=\"C:\\Program Files\\Tool\""]
        );
    }

    #[test]
    fn short_keys_get_single_dash() {
        let args = compose_args(&info(&[], &["s", "d=C:\\x"], &[], ""), InstallerKind::Exe);
        assert_eq!(args, vec!["-s", "-d", "C:\\x"]);
    }

    #[test]
    fn long_keys_follow_installer_flavor() {
        let exe = compose_args(&info(&[], &["silent"], &[], ""), InstallerKind::Exe);
        assert_eq!(exe, vec!["--silent"]);
        let msi = compose_args(&info(&[], &["silent"], &[], ""), InstallerKind::Msi);
        assert_eq!(msi, vec!["-silent"]);
        let underscored = compose_args(&info(&[], &["log_level=debug"], &[], ""), InstallerKind::Msi);
        assert_eq!(underscored, vec!["--log_level", "debug"]);
    }

    #[test]
    fn explicit_prefixes_pass_through() {
        let args = compose_args(
            &info(&[], &["--mode=unattended", "-q"], &[], ""),
            InstallerKind::Exe,
        );
        assert_eq!(args, vec!["--mode=unattended", "-q"]);
    }

    #[test]
    fn verb_leads_and_arguments_trail() {
        let args = compose_args(
            &info(&["quiet"], &[], &["--accept-eula"], "install"),
            InstallerKind::Exe,
        );
        assert_eq!(args, vec!["install", "/quiet", "--accept-eula"]);
    }

    #[test]
    fn blocking_check_matches_this_process() {
        let system = refreshed_processes();
        let own_pid = sysinfo::Pid::from_u32(std::process::id());
        let own_name = system
            .process(own_pid)
            .map(|p| p.name().to_string())
            .expect("own process visible");
        // suffix tolerance: the catalog author writes `.exe`
        let listed = format!("{}.exe", own_name.trim_end_matches(".exe"));
        let running = running_blocking_apps(&[listed.clone(), "no-such-process-zz".into()]);
        assert_eq!(running, vec![listed]);
    }
}
