// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Installer-executable backend: the artifact *is* the installer and is run
//! directly with its composed arguments.

use std::{process::Command, time::Duration};

use crate::{
    catalog::InstallerKind,
    session::Session,
    shell::CommandExt,
    status::Action,
    Error,
};

use super::{compose_args, stderr_tail, timeout_error, DispatchOutput, DispatchRequest, Outcome};

pub(super) fn run(
    request: &DispatchRequest<'_>,
    session: &Session,
    timeout: Duration,
) -> crate::Result<DispatchOutput> {
    let item = request.item;

    let program: String = match request.action {
        Action::Uninstall => {
            // registry-recorded uninstall binaries live in the operation list
            let op = item
                .uninstaller
                .iter()
                .find(|op| !op.location.trim().is_empty())
                .ok_or_else(|| Error::UnusableItem(item.name.clone()))?;
            op.location.trim().to_string()
        }
        _ => request
            .artifact
            .ok_or_else(|| Error::UnusableItem(item.name.clone()))?
            .display()
            .to_string(),
    };

    let mut args = item
        .installer
        .as_ref()
        .map(|info| compose_args(info, InstallerKind::Exe))
        .unwrap_or_default();
    if request.action == Action::Uninstall {
        for op in &item.uninstaller {
            args.extend(op.arguments.iter().cloned());
        }
    }
    // Fall back to the conventional NSIS silent switch only when the author
    // supplied nothing of their own.
    if args.is_empty() && request.action != Action::Uninstall {
        args.push("/S".into());
    }

    session.log_line(
        tracing::Level::INFO,
        &format!("running installer executable for `{}`", item.name),
    );
    let waited = Command::new(&program)
        .args(&args)
        .output_with_timeout(timeout)?;
    let Some(output) = waited.output else {
        return Err(timeout_error(item, "exe", timeout));
    };

    if output.status.success() {
        Ok(DispatchOutput {
            outcome: Outcome::Success,
            console: stderr_tail(&output),
        })
    } else {
        Err(Error::InstallerFailed {
            item: item.name.clone(),
            backend: "exe",
            exit_code: output.status.code().unwrap_or(-1),
            stderr_tail: stderr_tail(&output),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{InstallerInfo, Item};

    fn item_with_flags(switches: &[&str]) -> Item {
        Item {
            name: "Tool".into(),
            installer: Some(InstallerInfo {
                kind: "exe".into(),
                location: "pkgs/tool.exe".into(),
                switches: switches.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn default_silent_switch_only_when_unconfigured() {
        let bare = item_with_flags(&[]);
        let args = compose_args(bare.installer.as_ref().unwrap(), InstallerKind::Exe);
        assert!(args.is_empty()); // `/S` is appended at run time, not composed

        let configured = item_with_flags(&["VERYSILENT"]);
        let args = compose_args(configured.installer.as_ref().unwrap(), InstallerKind::Exe);
        assert_eq!(args, vec!["/VERYSILENT"]);
    }
}
