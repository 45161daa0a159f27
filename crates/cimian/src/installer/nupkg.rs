// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Chocolatey backend. The package id and version come from the `.nuspec`
//! inside the archive; the cached artifact's directory is handed to choco as
//! the source feed, so nothing is renamed or copied.

use std::{
    fs::File,
    io::Read,
    path::Path,
    process::Command,
    time::Duration,
};

use zip::ZipArchive;

use crate::{session::Session, shell::CommandExt, status::Action, Error};

use super::{script, stderr_tail, timeout_error, DispatchOutput, DispatchRequest, Outcome};

const BEFORE_INSTALL_SCRIPT: &str = "tools/chocolateyBeforeInstall.ps1";

pub(super) fn run(
    request: &DispatchRequest<'_>,
    session: &Session,
    timeout: Duration,
) -> crate::Result<DispatchOutput> {
    let item = request.item;
    let artifact = request
        .artifact
        .ok_or_else(|| Error::UnusableItem(item.name.clone()))?;

    let (id, version) = read_nuspec(artifact)?;

    // The pre-install hook ships inside the archive; it runs before choco
    // touches the package, unconditionally.
    if let Some(body) = read_archive_file(artifact, BEFORE_INSTALL_SCRIPT)? {
        session.log_line(
            tracing::Level::INFO,
            &format!("running packaged pre-install hook for `{id}`"),
        );
        let output = script::run_script(&body, "chocolateyBeforeInstall")?;
        if !output.status.success() {
            return Err(Error::ScriptFailed {
                item: item.name.clone(),
                stage: "chocolateyBeforeInstall",
                exit_code: output.status.code().unwrap_or(-1),
            });
        }
    }

    let native_log = session.native_log_path(&format!("choco_{id}.log"));
    let source_dir = artifact.parent().unwrap_or(request.cache_dir);

    let subcommand = match request.action {
        Action::Uninstall => "uninstall",
        _ => {
            if locally_installed(&id, timeout)? {
                "upgrade"
            } else {
                "install"
            }
        }
    };

    let mut cmd = Command::new("choco");
    cmd.arg(subcommand).arg(&id);
    if request.action != Action::Uninstall {
        cmd.args(["--version", &version])
            .arg("--source")
            .arg(source_dir)
            .args(["-y", "--force", "--allowdowngrade", "--debug"])
            .arg(format!("--log-file={}", native_log.display()));
    } else {
        cmd.arg("-y");
    }

    let waited = cmd.output_with_timeout(timeout)?;
    let Some(output) = waited.output else {
        return Err(timeout_error(item, "nupkg", timeout));
    };

    if output.status.success() {
        Ok(DispatchOutput {
            outcome: Outcome::Success,
            console: stderr_tail(&output),
        })
    } else {
        Err(Error::InstallerFailed {
            item: item.name.clone(),
            backend: "nupkg",
            exit_code: output.status.code().unwrap_or(-1),
            stderr_tail: stderr_tail(&output),
        })
    }
}

fn locally_installed(id: &str, timeout: Duration) -> crate::Result<bool> {
    let waited = Command::new("choco")
        .args(["list", "--local-only", "--exact", id])
        .output_with_timeout(timeout)?;
    let Some(output) = waited.output else {
        return Ok(false);
    };
    let text = String::from_utf8_lossy(&output.stdout).to_lowercase();
    let id = id.to_lowercase();
    Ok(text
        .lines()
        .any(|line| line.starts_with(&format!("{id} ")) || line == id))
}

/// Package id and version from the archive's `.nuspec`.
pub(super) fn read_nuspec(artifact: &Path) -> crate::Result<(String, String)> {
    let file = File::open(artifact).map_err(|e| Error::IoWithPath(artifact.to_path_buf(), e))?;
    let mut archive = ZipArchive::new(file)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if !entry.name().to_ascii_lowercase().ends_with(".nuspec") {
            continue;
        }
        let mut xml = String::new();
        entry.read_to_string(&mut xml)?;
        if let Some(parsed) = parse_nuspec(&xml) {
            return Ok(parsed);
        }
    }
    Err(Error::NuspecNotFound(artifact.to_path_buf()))
}

fn read_archive_file(artifact: &Path, name: &str) -> crate::Result<Option<String>> {
    let file = File::open(artifact).map_err(|e| Error::IoWithPath(artifact.to_path_buf(), e))?;
    let mut archive = ZipArchive::new(file)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.name().eq_ignore_ascii_case(name) {
            let mut body = String::new();
            entry.read_to_string(&mut body)?;
            return Ok(Some(body));
        }
    }
    Ok(None)
}

/// Pulls `<id>` and `<version>` out of nuspec XML. The schema is stable
/// enough that tag scanning beats carrying an XML parser for two fields.
fn parse_nuspec(xml: &str) -> Option<(String, String)> {
    let id = tag_text(xml, "id")?;
    let version = tag_text(xml, "version")?;
    Some((id, version))
}

fn tag_text(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    let text = xml[start..end].trim();
    (!text.is_empty()).then(|| text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    const NUSPEC: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<package xmlns="http://schemas.microsoft.com/packaging/2015/06/nuspec.xsd">
  <metadata>
    <id>sysinternals</id>
    <version>2024.7.16</version>
    <authors>Microsoft</authors>
    <description>Suite of utilities.</description>
  </metadata>
</package>"#;

    fn write_nupkg(path: &Path, with_hook: bool) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options: FileOptions =
            FileOptions::default().compression_method(zip::CompressionMethod::Stored);
        writer
            .start_file("sysinternals.nuspec", options)
            .unwrap();
        writer.write_all(NUSPEC.as_bytes()).unwrap();
        if with_hook {
            writer
                .start_file(BEFORE_INSTALL_SCRIPT, options)
                .unwrap();
            writer
                .write_all(b"Write-Host 'preparing'")
                .unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn nuspec_id_and_version_parse() {
        assert_eq!(
            parse_nuspec(NUSPEC),
            Some(("sysinternals".into(), "2024.7.16".into()))
        );
        assert_eq!(parse_nuspec("<package></package>"), None);
    }

    #[test]
    fn nuspec_is_found_inside_the_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sysinternals.nupkg");
        write_nupkg(&path, false);
        let (id, version) = read_nuspec(&path).unwrap();
        assert_eq!(id, "sysinternals");
        assert_eq!(version, "2024.7.16");
    }

    #[test]
    fn packaged_hook_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sysinternals.nupkg");
        write_nupkg(&path, true);
        let body = read_archive_file(&path, BEFORE_INSTALL_SCRIPT)
            .unwrap()
            .unwrap();
        assert!(body.contains("preparing"));

        let without = dir.path().join("plain.nupkg");
        write_nupkg(&without, false);
        assert!(read_archive_file(&without, BEFORE_INSTALL_SCRIPT)
            .unwrap()
            .is_none());
    }

    #[test]
    fn archive_without_nuspec_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.nupkg");
        let file = File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options: FileOptions =
            FileOptions::default().compression_method(zip::CompressionMethod::Stored);
        writer.start_file("readme.txt", options).unwrap();
        writer.write_all(b"nothing here").unwrap();
        writer.finish().unwrap();
        assert!(matches!(
            read_nuspec(&path),
            Err(Error::NuspecNotFound(_))
        ));
    }
}
