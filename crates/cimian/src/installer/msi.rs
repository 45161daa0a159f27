// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Windows Installer backend: drives `msiexec` silently and maps its
//! well-known exit codes onto semantic outcomes.

use std::{process::Command, time::Duration};

use crate::{
    catalog::InstallerKind,
    session::Session,
    shell::CommandExt,
    status::Action,
    Error,
};

use super::{compose_args, stderr_tail, timeout_error, DispatchOutput, DispatchRequest, Outcome};

/// Attempts when the installer service reports another install in progress.
const BUSY_RETRIES: u32 = 3;
/// Wait between busy retries.
const BUSY_WAIT: Duration = Duration::from_secs(20);

/// ERROR_SUCCESS_REBOOT_REQUIRED
const EXIT_REBOOT_REQUIRED: i32 = 3010;
/// ERROR_INSTALL_FAILURE, fatal and not worth retrying
const EXIT_FATAL: i32 = 1603;
/// ERROR_INSTALL_ALREADY_RUNNING
const EXIT_BUSY: i32 = 1618;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum MsiDisposition {
    Success,
    RebootRequired,
    Busy,
    Fatal,
    Failed,
}

pub(super) fn classify_exit(code: i32) -> MsiDisposition {
    match code {
        0 => MsiDisposition::Success,
        EXIT_REBOOT_REQUIRED => MsiDisposition::RebootRequired,
        EXIT_BUSY => MsiDisposition::Busy,
        EXIT_FATAL => MsiDisposition::Fatal,
        _ => MsiDisposition::Failed,
    }
}

fn msiexec_path() -> String {
    std::env::var("SYSTEMROOT").map_or_else(
        |_| "msiexec.exe".to_string(),
        |root| format!("{root}\\System32\\msiexec.exe"),
    )
}

pub(super) fn run(
    request: &DispatchRequest<'_>,
    session: &Session,
    timeout: Duration,
) -> crate::Result<DispatchOutput> {
    let item = request.item;
    let native_log = session.native_log_path("msi_install.log");

    let mut base_args: Vec<String> = match request.action {
        Action::Uninstall => {
            let target = uninstall_target(request)?;
            vec!["/x".into(), target, "/qn".into(), "/norestart".into()]
        }
        _ => {
            let artifact = request
                .artifact
                .ok_or_else(|| Error::UnusableItem(item.name.clone()))?;
            vec![
                "/i".into(),
                artifact.display().to_string(),
                "/quiet".into(),
                "/norestart".into(),
                "/l*v".into(),
                native_log.display().to_string(),
            ]
        }
    };
    if let Some(installer) = &item.installer {
        if request.action != Action::Uninstall {
            base_args.extend(compose_args(installer, InstallerKind::Msi));
        }
    }

    let mut attempt = 0;
    loop {
        let waited = Command::new(msiexec_path())
            .args(&base_args)
            .output_with_timeout(timeout)?;
        let Some(output) = waited.output else {
            return Err(timeout_error(item, "msi", timeout));
        };

        let code = output.status.code().unwrap_or(-1);
        let console = stderr_tail(&output);
        match classify_exit(code) {
            MsiDisposition::Success => {
                return Ok(DispatchOutput {
                    outcome: Outcome::Success,
                    console,
                });
            }
            MsiDisposition::RebootRequired => {
                session.log_line(
                    tracing::Level::WARN,
                    &format!("`{}` installed; a reboot is required to finish", item.name),
                );
                return Ok(DispatchOutput {
                    outcome: Outcome::RebootRequired,
                    console,
                });
            }
            MsiDisposition::Busy if attempt < BUSY_RETRIES => {
                attempt += 1;
                session.log_line(
                    tracing::Level::INFO,
                    &format!(
                        "installer service busy; waiting before retry {attempt}/{BUSY_RETRIES} for `{}`",
                        item.name
                    ),
                );
                std::thread::sleep(BUSY_WAIT);
            }
            MsiDisposition::Busy | MsiDisposition::Fatal | MsiDisposition::Failed => {
                return Err(Error::InstallerFailed {
                    item: item.name.clone(),
                    backend: "msi",
                    exit_code: code,
                    stderr_tail: console,
                });
            }
        }
    }
}

/// What `/x` points at: the staged artifact, or a recorded product code.
fn uninstall_target(request: &DispatchRequest<'_>) -> crate::Result<String> {
    if let Some(artifact) = request.artifact {
        return Ok(artifact.display().to_string());
    }
    let item = request.item;
    let from_ops = item
        .uninstaller
        .iter()
        .find(|op| !op.product_code.trim().is_empty())
        .map(|op| op.product_code.trim().to_string());
    if let Some(code) = from_ops {
        return Ok(code);
    }
    if let Some(installer) = &item.installer {
        if !installer.product_code.trim().is_empty() {
            return Ok(installer.product_code.trim().to_string());
        }
    }
    Err(Error::UnusableItem(item.name.clone()))
}
