// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! # cimian
//!
//! Endpoint software-management agent for Windows fleets. On each run the
//! agent fetches this host's manifests and catalogs from a software
//! repository, resolves the transitive set of items to install, update or
//! remove, stages installer artifacts into a local cache, drives the
//! matching native installer (MSI, installer executables, PowerShell, MSIX,
//! Chocolatey `.nupkg`, or embedded scripts) and reports progress to any
//! connected GUI over a loopback protocol.
//!
//! The crate is usable as a library: construct a [`config::Config`], build a
//! [`orchestrator::RunContext`] and hand it a
//! [`manifest::ManifestExpansion`]. The `cimian` binary (behind the `cli`
//! feature, enabled by default) wires these together from `Config.yaml`.
//!
//! ## Feature flags
//!
//! - **`cli`**: Enables the command-line binary and its dependencies.
//!   Enabled by default.
//! - **`schema`**: Derives JSON schemas for the configuration and catalog
//!   types.

#![deny(missing_docs)]

#[cfg(feature = "cli")]
use std::fmt::Write as _;

mod error;
mod shell;
mod util;

pub mod catalog;
#[cfg(feature = "cli")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "cli")))]
pub mod cli;
pub mod config;
pub mod download;
pub mod facts;
pub mod installer;
pub mod manifest;
pub mod orchestrator;
pub mod predicates;
pub mod progress;
pub mod server;
pub mod session;
pub mod status;
pub mod store;
pub mod version;

pub use config::Config;
pub use error::{Error, Result};
pub use util::{display_path, sweep_cache};

#[cfg(feature = "cli")]
fn parse_log_level(verbose: u8) -> tracing::Level {
    match verbose {
        0 => tracing_subscriber::EnvFilter::builder()
            .from_env_lossy()
            .max_level_hint()
            .and_then(|l| l.into_level())
            .unwrap_or(tracing::Level::INFO),
        1 => tracing::Level::DEBUG,
        2.. => tracing::Level::TRACE,
    }
}

/// Inits the tracing subscriber.
#[cfg(feature = "cli")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "cli")))]
pub fn init_tracing_subscriber(verbosity: u8) {
    let level = parse_log_level(verbosity);

    let debug = level == tracing::Level::DEBUG;
    let tracing = level == tracing::Level::TRACE;

    let subscriber = tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_target(debug)
        .with_line_number(tracing)
        .with_file(tracing)
        .with_max_level(level);

    let formatter = tracing_subscriber::fmt::format()
        .compact()
        .with_target(debug)
        .with_line_number(tracing)
        .with_file(tracing);

    if tracing {
        subscriber
            .event_format(TracingFormatter::WithTime(formatter))
            .init();
    } else {
        subscriber
            .without_time()
            .event_format(TracingFormatter::WithoutTime(formatter.without_time()))
            .init();
    }
}

#[cfg(feature = "cli")]
enum TracingFormatter {
    WithoutTime(
        tracing_subscriber::fmt::format::Format<tracing_subscriber::fmt::format::Compact, ()>,
    ),
    WithTime(tracing_subscriber::fmt::format::Format<tracing_subscriber::fmt::format::Compact>),
}

#[cfg(feature = "cli")]
struct ShellFieldVisitor {
    message: String,
}

#[cfg(feature = "cli")]
impl tracing::field::Visit for ShellFieldVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

#[cfg(feature = "cli")]
impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for TracingFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        if event.fields().any(|f| f.name() == "shell") {
            let mut visitor = ShellFieldVisitor { message: "".into() };
            event.record(&mut visitor);
            writeln!(writer, "{}", visitor.message)
        } else {
            match self {
                TracingFormatter::WithoutTime(formatter) => {
                    formatter.format_event(ctx, writer, event)
                }
                TracingFormatter::WithTime(formatter) => formatter.format_event(ctx, writer, event),
            }
        }
    }
}
