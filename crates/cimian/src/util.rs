// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

use sha2::Digest;
use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use crate::Error;

/// Cached installer artifacts older than this are removed by the sweep.
const CACHE_MAX_AGE: Duration = Duration::from_secs(5 * 24 * 60 * 60);

/// Returns a simplified, displayable form of the given path.
#[inline]
pub fn display_path<P: AsRef<Path>>(p: P) -> String {
    dunce::simplified(&p.as_ref().components().collect::<PathBuf>())
        .display()
        .to_string()
}

/// Creates a new file at the given path, creating any parent directories as needed.
#[inline]
pub(crate) fn create_file(path: &Path) -> crate::Result<std::io::BufWriter<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::IoWithPath(parent.to_path_buf(), e))?;
    }
    let file = File::create(path).map_err(|e| Error::IoWithPath(path.to_path_buf(), e))?;
    Ok(std::io::BufWriter::new(file))
}

/// Replaces `path` with `contents` via a sibling temp file and a rename, so
/// concurrent readers never observe a half-written file.
pub(crate) fn replace_file_atomic(path: &Path, contents: &[u8]) -> crate::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::ParentDirNotFound(path.to_path_buf()))?;
    fs::create_dir_all(parent).map_err(|e| Error::IoWithPath(parent.to_path_buf(), e))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".partial-")
        .tempfile_in(parent)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Streaming SHA-256 of a file, hex-encoded lowercase.
pub(crate) fn sha256_of_file(path: &Path) -> crate::Result<String> {
    let mut file = File::open(path).map_err(|e| Error::IoWithPath(path.to_path_buf(), e))?;
    let mut hasher = sha2::Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Verifies the SHA-256 of a file against an expected hex digest.
pub(crate) fn verify_file_sha256(path: &Path, expected: &str) -> crate::Result<()> {
    let actual = sha256_of_file(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(Error::HashMismatch(path.to_path_buf()))
    }
}

/// MD5 of a file, hex-encoded lowercase.
pub(crate) fn md5_of_file(path: &Path) -> crate::Result<String> {
    let mut file = File::open(path).map_err(|e| Error::IoWithPath(path.to_path_buf(), e))?;
    let mut ctx = md5::Context::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

/// Removes cached artifacts older than five days, then prunes directories the
/// sweep left empty. Errors on individual entries are logged and skipped so a
/// locked file can't wedge the whole run.
pub fn sweep_cache(cache_dir: &Path) -> crate::Result<()> {
    if !cache_dir.is_dir() {
        return Ok(());
    }

    let now = SystemTime::now();
    for entry in walkdir::WalkDir::new(cache_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let age = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|m| now.duration_since(m).ok());
        if age.is_some_and(|age| age > CACHE_MAX_AGE) {
            tracing::debug!("Sweeping stale cache entry {}", display_path(entry.path()));
            if let Err(e) = fs::remove_file(entry.path()) {
                tracing::warn!("Failed to remove {}: {e}", display_path(entry.path()));
            }
        }
    }

    // Deepest-first so a chain of newly-empty directories collapses in one pass.
    let mut dirs: Vec<PathBuf> = walkdir::WalkDir::new(cache_dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect();
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        if fs::read_dir(&dir).map(|mut i| i.next().is_none()).unwrap_or(false) {
            let _ = fs::remove_dir(&dir);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_replace_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        replace_file_atomic(&path, b"one").unwrap();
        replace_file_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
    }

    #[test]
    fn sha256_verification_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        fs::write(&path, b"hello world").unwrap();
        let digest = sha256_of_file(&path).unwrap();
        verify_file_sha256(&path, &digest).unwrap();
        assert!(verify_file_sha256(&path, &digest.replace('b', "c")).is_err());
    }

    #[test]
    fn sweep_removes_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        fs::write(dir.path().join("fresh.msi"), b"x").unwrap();
        sweep_cache(dir.path()).unwrap();
        assert!(!nested.exists());
        assert!(dir.path().join("fresh.msi").exists());
    }
}
