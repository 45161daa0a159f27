// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! PowerShell-artifact backend: the downloaded artifact is a `.ps1` run
//! under a bypassed execution policy.

use std::{process::Command, time::Duration};

use crate::{session::Session, shell::CommandExt, Error};

use super::{stderr_tail, timeout_error, DispatchOutput, DispatchRequest, Outcome};

fn powershell_path() -> String {
    std::env::var("SYSTEMROOT").map_or_else(
        |_| "powershell.exe".to_string(),
        |root| format!("{root}\\System32\\WindowsPowerShell\\v1.0\\powershell.exe"),
    )
}

pub(super) fn run(
    request: &DispatchRequest<'_>,
    session: &Session,
    timeout: Duration,
) -> crate::Result<DispatchOutput> {
    let item = request.item;
    let artifact = request
        .artifact
        .ok_or_else(|| Error::UnusableItem(item.name.clone()))?;

    session.log_line(
        tracing::Level::INFO,
        &format!("running PowerShell artifact for `{}`", item.name),
    );
    let waited = Command::new(powershell_path())
        .args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-File"])
        .arg(artifact)
        .output_with_timeout(timeout)?;
    let Some(output) = waited.output else {
        return Err(timeout_error(item, "powershell", timeout));
    };

    if output.status.success() {
        Ok(DispatchOutput {
            outcome: Outcome::Success,
            console: stderr_tail(&output),
        })
    } else {
        Err(Error::InstallerFailed {
            item: item.name.clone(),
            backend: "powershell",
            exit_code: output.status.code().unwrap_or(-1),
            stderr_tail: stderr_tail(&output),
        })
    }
}
