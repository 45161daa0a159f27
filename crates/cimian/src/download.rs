// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Repository access and artifact downloads.
//!
//! All repository reads go through [`RepoClient`] so the manifest loader,
//! catalog cache and installer staging share one transport, and tests can
//! serve fixtures from a directory instead of a server.

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use base64::Engine;

use crate::{session::CancelToken, util, Error};

/// Attempts per fetch, counting the first one.
const MAX_ATTEMPTS: u32 = 4;
/// Base delay of the exponential backoff between attempts.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Minimum interval between progress callbacks.
const REPORT_INTERVAL: Duration = Duration::from_millis(100);

/// Receives byte counts while an artifact streams to disk.
pub trait DownloadReporter: Send + Sync {
    /// Called with monotonically increasing totals, at a bounded rate plus
    /// once at completion.
    fn progress(&self, downloaded: u64, total: Option<u64>);
}

/// No-op reporter for fetches nobody watches.
pub struct SilentReporter;

impl DownloadReporter for SilentReporter {
    fn progress(&self, _downloaded: u64, _total: Option<u64>) {}
}

/// Read access to the software repository.
pub trait RepoClient: Send + Sync {
    /// Fetches a small document (manifest, catalog) fully into memory.
    fn fetch(&self, rel: &str) -> crate::Result<Vec<u8>>;

    /// Streams `rel` to `dest`, resuming a partial file when the server
    /// supports ranges, reporting progress and honoring cancellation.
    fn fetch_to_file(
        &self,
        rel: &str,
        dest: &Path,
        reporter: &dyn DownloadReporter,
        cancel: &CancelToken,
    ) -> crate::Result<()>;
}

/// HTTP(S) repository client with optional basic auth.
pub struct HttpRepo {
    agent: ureq::Agent,
    base_url: String,
    auth_header: Option<String>,
}

impl HttpRepo {
    /// A client rooted at `base_url`. Credentials are attached as basic auth
    /// when both are non-empty.
    pub fn new(base_url: &str, user: &str, pass: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .try_proxy_from_env(true)
            .timeout_connect(Duration::from_secs(30))
            .build();
        let auth_header = (!user.is_empty() && !pass.is_empty()).then(|| {
            format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"))
            )
        });
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_header,
        }
    }

    fn url_for(&self, rel: &str) -> String {
        // Catalog authors write Windows-style subpaths with spaces.
        let rel = rel.replace('\\', "/").replace(' ', "%20");
        format!("{}/{}", self.base_url, rel.trim_start_matches('/'))
    }

    fn request(&self, url: &str, range_from: Option<u64>) -> std::result::Result<ureq::Response, Box<ureq::Error>> {
        let mut req = self.agent.get(url);
        if let Some(auth) = &self.auth_header {
            req = req.set("Authorization", auth);
        }
        if let Some(from) = range_from {
            req = req.set("Range", &format!("bytes={from}-"));
        }
        req.call().map_err(Box::new)
    }
}

fn is_retryable(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Transport(_) => true,
        ureq::Error::Status(code, _) => matches!(*code, 408 | 429 | 500..=599),
    }
}

fn backoff(attempt: u32) {
    std::thread::sleep(BACKOFF_BASE * 2u32.saturating_pow(attempt));
}

impl RepoClient for HttpRepo {
    fn fetch(&self, rel: &str) -> crate::Result<Vec<u8>> {
        let url = self.url_for(rel);
        let mut last_error = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            match self.request(&url, None) {
                Ok(response) => {
                    let mut bytes = Vec::new();
                    response.into_reader().read_to_end(&mut bytes)?;
                    return Ok(bytes);
                }
                Err(e) if matches!(*e, ureq::Error::Status(404, _)) => {
                    return Err(Error::RepoNotFound(rel.to_string()));
                }
                Err(e) if is_retryable(&e) && attempt + 1 < MAX_ATTEMPTS => {
                    tracing::debug!("fetch of `{rel}` failed ({e}), retrying");
                    last_error = e.to_string();
                    backoff(attempt);
                }
                Err(e) => {
                    last_error = e.to_string();
                    break;
                }
            }
        }
        Err(Error::DownloadRetriesExhausted(
            rel.to_string(),
            MAX_ATTEMPTS,
            last_error,
        ))
    }

    fn fetch_to_file(
        &self,
        rel: &str,
        dest: &Path,
        reporter: &dyn DownloadReporter,
        cancel: &CancelToken,
    ) -> crate::Result<()> {
        let url = self.url_for(rel);
        let mut last_error = String::new();
        let mut attempt = 0;
        let mut restarted = false;

        while attempt < MAX_ATTEMPTS {
            let resume_from = fs::metadata(dest).map(|m| m.len()).unwrap_or(0);
            let range = (resume_from > 0).then_some(resume_from);

            let response = match self.request(&url, range) {
                Ok(r) => r,
                Err(e) if matches!(*e, ureq::Error::Status(404, _)) => {
                    return Err(Error::RepoNotFound(rel.to_string()));
                }
                // 416: the partial on disk is not smaller than the remote
                // artifact (a leftover from another version, most likely).
                // Drop it and start over; this is not a network failure.
                Err(e)
                    if range.is_some()
                        && !restarted
                        && matches!(*e, ureq::Error::Status(416, _)) =>
                {
                    tracing::debug!(
                        "partial file for `{rel}` ({resume_from} bytes) is not resumable, restarting"
                    );
                    restarted = true;
                    let _ = fs::remove_file(dest);
                    continue;
                }
                Err(e) if is_retryable(&e) && attempt + 1 < MAX_ATTEMPTS => {
                    tracing::debug!("download of `{rel}` failed ({e}), retrying");
                    last_error = e.to_string();
                    attempt += 1;
                    backoff(attempt);
                    continue;
                }
                Err(e) => {
                    last_error = e.to_string();
                    break;
                }
            };

            // A partial counts as resumable only when the server accepted
            // the range; a plain 200 means the bytes on disk are stale.
            let resumed = range.is_some() && response.status() == 206;
            let content_length: Option<u64> = response
                .header("Content-Length")
                .and_then(|v| v.parse().ok());
            let total = content_length.map(|len| if resumed { len + resume_from } else { len });

            let mut out = if resumed {
                OpenOptions::new().append(true).open(dest)?
            } else {
                util::create_file(dest)?.into_inner().map_err(|e| Error::Io(e.into_error()))?
            };
            let mut written = if resumed { resume_from } else { 0 };

            let mut reader = response.into_reader();
            let mut buf = [0u8; 64 * 1024];
            let mut last_report: Option<Instant> = None;
            let copy_result: crate::Result<()> = loop {
                if cancel.is_cancelled() {
                    break Err(Error::Cancelled);
                }
                match reader.read(&mut buf) {
                    Ok(0) => break Ok(()),
                    Ok(n) => {
                        out.write_all(&buf[..n])?;
                        written += n as u64;
                        if last_report.map_or(true, |t| t.elapsed() >= REPORT_INTERVAL) {
                            reporter.progress(written, total);
                            last_report = Some(Instant::now());
                        }
                    }
                    Err(e) => break Err(Error::Io(e)),
                }
            };

            match copy_result {
                Ok(()) => {
                    reporter.progress(written, total);
                    return Ok(());
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if attempt + 1 < MAX_ATTEMPTS => {
                    // Keep the partial file; the next attempt resumes it.
                    tracing::debug!("download of `{rel}` interrupted ({e}), retrying");
                    last_error = e.to_string();
                    attempt += 1;
                    backoff(attempt);
                }
                Err(e) => {
                    last_error = e.to_string();
                    break;
                }
            }
        }

        Err(Error::DownloadRetriesExhausted(
            rel.to_string(),
            MAX_ATTEMPTS,
            last_error,
        ))
    }
}

/// Repository served from a local directory. Used by tests and by mirrored
/// deployments that sync the repository to disk out of band.
pub struct DirRepo {
    root: PathBuf,
}

impl DirRepo {
    /// A client rooted at `root`.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, rel: &str) -> PathBuf {
        let rel = rel.replace('\\', "/");
        self.root.join(rel.trim_start_matches('/'))
    }
}

impl RepoClient for DirRepo {
    fn fetch(&self, rel: &str) -> crate::Result<Vec<u8>> {
        let path = self.path_for(rel);
        fs::read(&path).map_err(|_| Error::RepoNotFound(rel.to_string()))
    }

    fn fetch_to_file(
        &self,
        rel: &str,
        dest: &Path,
        reporter: &dyn DownloadReporter,
        cancel: &CancelToken,
    ) -> crate::Result<()> {
        let source = self.path_for(rel);
        let mut input =
            File::open(&source).map_err(|_| Error::RepoNotFound(rel.to_string()))?;
        let total = input.metadata().ok().map(|m| m.len());
        let mut out = util::create_file(dest)?;
        let mut buf = [0u8; 64 * 1024];
        let mut written = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let n = input.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            written += n as u64;
        }
        out.flush()?;
        reporter.progress(written, total);
        Ok(())
    }
}

/// Downloads an installer artifact into the cache and verifies its declared
/// size and SHA-256. A mismatched artifact is deleted and not retried within
/// the run.
pub fn download_artifact(
    repo: &dyn RepoClient,
    location: &str,
    dest: &Path,
    expected_hash: &str,
    expected_size: u64,
    reporter: &dyn DownloadReporter,
    cancel: &CancelToken,
) -> crate::Result<()> {
    // A prior run may have left a fully verified artifact behind.
    if dest.is_file() && !expected_hash.is_empty() {
        if util::verify_file_sha256(dest, expected_hash).is_ok() {
            tracing::debug!("using cached artifact {}", util::display_path(dest));
            return Ok(());
        }
    }

    repo.fetch_to_file(&format!("pkgs/{}", location.trim_start_matches('/')), dest, reporter, cancel)?;

    if expected_size > 0 {
        let actual = fs::metadata(dest)?.len();
        if actual != expected_size {
            fs::remove_file(dest).ok();
            return Err(Error::HashMismatch(dest.to_path_buf()));
        }
    }
    if !expected_hash.is_empty() {
        if let Err(e) = util::verify_file_sha256(dest, expected_hash) {
            fs::remove_file(dest).ok();
            return Err(e);
        }
    }
    Ok(())
}
