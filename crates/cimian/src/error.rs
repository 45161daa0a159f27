// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

use std::path::PathBuf;

use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug)]
/// Errors returned by the agent.
pub enum Error {
    /// Clap error.
    #[cfg(feature = "cli")]
    #[error(transparent)]
    Clap(#[from] clap::error::Error),
    /// YAML parsing error.
    #[error("Failed to parse YAML: {0}")]
    YamlParseError(#[from] serde_yaml::Error),
    /// JSON de/serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// I/O errors.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// I/O error with the path that caused it.
    #[error("`{0}`: {1}")]
    IoWithPath(PathBuf, std::io::Error),
    /// Hex de/encoding errors.
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
    /// Zip error.
    #[error(transparent)]
    ZipError(#[from] zip::result::ZipError),
    /// HTTP transfer error.
    #[error(transparent)]
    DownloadError(#[from] Box<ureq::Error>),
    /// Time formatting error.
    #[error(transparent)]
    TimeFormat(#[from] time::error::Format),
    /// Missing or unreadable agent configuration.
    #[error("Couldn't read a valid configuration file at {0}")]
    NoConfig(PathBuf),
    /// The configured repository URL is empty.
    #[error("The configured software repository URL is empty")]
    EmptyRepoUrl,
    /// A repository document was not found on the server.
    #[error("`{0}` not found in the software repository")]
    RepoNotFound(String),
    /// An item is not present in any configured catalog.
    #[error("Item `{0}` ({1}) not found in any catalog")]
    ItemNotFound(String, String),
    /// Failed to validate a downloaded artifact hash.
    #[error("Hash mismatch of downloaded file `{0}`")]
    HashMismatch(PathBuf),
    /// Download gave up after exhausting its retry budget.
    #[error("Download of `{0}` failed after {1} attempts: {2}")]
    DownloadRetriesExhausted(String, u32, String),
    /// Unknown predicate operator in a conditional manifest block.
    #[error("Unknown condition operator `{0}`")]
    UnknownOperator(String),
    /// A fact referenced by a condition is not present on this host.
    #[error("Unknown fact key `{0}`")]
    UnknownFactKey(String),
    /// A native installer exited with a failure code.
    #[error("{backend} for `{item}` failed with exit code {exit_code}: {stderr_tail}")]
    InstallerFailed {
        /// Item name.
        item: String,
        /// Backend tag, e.g. `msi` or `choco`.
        backend: &'static str,
        /// The native process exit code.
        exit_code: i32,
        /// Tail of the native stderr output.
        stderr_tail: String,
    },
    /// A native installer exceeded its allotted run time and was killed.
    #[error("{backend} for `{item}` timed out after {seconds}s")]
    InstallerTimeout {
        /// Item name.
        item: String,
        /// Backend tag.
        backend: &'static str,
        /// The timeout that was exceeded.
        seconds: u64,
    },
    /// An embedded pre/post script exited non-zero.
    #[error("{stage} script for `{item}` failed with exit code {exit_code}")]
    ScriptFailed {
        /// Item name.
        item: String,
        /// Which script failed, e.g. `preinstall`.
        stage: &'static str,
        /// The script exit code.
        exit_code: i32,
    },
    /// A `requires` entry of an item could not be installed.
    #[error("failed to install required dependency {dependency} of `{item}`")]
    RequiredDependencyFailed {
        /// The item whose dependency failed.
        item: String,
        /// The dependency that failed.
        dependency: String,
    },
    /// An item has no installer location, uninstall operations, or scripts.
    #[error("Item `{0}` has no installer, uninstaller or scripts")]
    UnusableItem(String),
    /// A `.nupkg` artifact did not contain a parseable nuspec.
    #[error("No usable nuspec found in `{0}`")]
    NuspecNotFound(PathBuf),
    /// The run was cancelled.
    #[error("run cancelled")]
    Cancelled,
    /// Every requested item in the batch failed.
    #[error("all {} requested items failed: {}", .0.len(), .0.join(", "))]
    BatchFailed(Vec<String>),
    /// Installed-version store error.
    #[error("installed-version store: {0}")]
    Store(String),
    /// Failed to get parent directory of a path.
    #[error("Failed to get parent directory of {0}")]
    ParentDirNotFound(PathBuf),
}

/// Convenient type alias of Result type for the agent.
pub type Result<T> = std::result::Result<T, Error>;
