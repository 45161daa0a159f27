// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Embedded script execution. Script bodies from catalog items are opaque;
//! they are materialized to a temp file (deleted when the handle drops, on
//! every exit path) and run through the interpreter the content sniff picks.
//! Inlining into a `-Command` argument is deliberately avoided: quoting and
//! command-line length are unreliable for arbitrary bodies.

use std::process::{Command, Output};

use crate::shell::CommandExt;

/// Interpreter a script body runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptLanguage {
    /// `cmd.exe /c` batch script.
    Batch,
    /// PowerShell script file.
    PowerShell,
}

/// Picks the interpreter from the script text: batch markers (`@echo off`,
/// `rem`, `::`) win, everything else is PowerShell.
pub fn sniff_language(body: &str) -> ScriptLanguage {
    let head = body
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .to_ascii_lowercase();
    if head.starts_with("@echo off") || head.starts_with("rem") || head.starts_with("::") {
        ScriptLanguage::Batch
    } else {
        ScriptLanguage::PowerShell
    }
}

fn interpreter(language: ScriptLanguage) -> (String, Vec<&'static str>) {
    match language {
        ScriptLanguage::Batch => {
            let cmd = std::env::var("SYSTEMROOT").map_or_else(
                |_| "cmd.exe".to_string(),
                |root| format!("{root}\\System32\\cmd.exe"),
            );
            (cmd, vec!["/c"])
        }
        ScriptLanguage::PowerShell => {
            let ps = std::env::var("SYSTEMROOT").map_or_else(
                |_| "powershell.exe".to_string(),
                |root| format!("{root}\\System32\\WindowsPowerShell\\v1.0\\powershell.exe"),
            );
            (ps, vec!["-NoProfile", "-ExecutionPolicy", "Bypass", "-File"])
        }
    }
}

/// Runs an embedded script body to completion, capturing output. The caller
/// inspects the exit status; a non-zero exit is not an error here.
pub fn run_script(body: &str, label: &str) -> crate::Result<Output> {
    let language = sniff_language(body);
    let suffix = match language {
        ScriptLanguage::Batch => ".cmd",
        ScriptLanguage::PowerShell => ".ps1",
    };

    let mut file = tempfile::Builder::new()
        .prefix("cimian-script-")
        .suffix(suffix)
        .tempfile()?;
    std::io::Write::write_all(&mut file, body.as_bytes())?;
    std::io::Write::flush(&mut file)?;

    let (program, args) = interpreter(language);
    tracing::debug!("running {label} script via {program}");
    let output = Command::new(program)
        .args(args)
        .arg(file.path())
        .output_captured()?;
    // `file` drops here, removing the materialized script.
    Ok(output)
}

/// Runs a script stage of an item, mapping a non-zero exit to an error.
pub fn run_script_stage(
    body: &str,
    item: &str,
    stage: &'static str,
) -> crate::Result<()> {
    if body.trim().is_empty() {
        return Ok(());
    }
    let output = run_script(body, stage)?;
    if output.status.success() {
        Ok(())
    } else {
        Err(crate::Error::ScriptFailed {
            item: item.to_string(),
            stage,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}
