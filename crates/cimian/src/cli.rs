// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! The cli entry point

#![cfg(feature = "cli")]

use std::{ffi::OsString, path::PathBuf, sync::Arc};

use clap::Parser;

use crate::{
    catalog::{CatalogCache, CatalogIndex},
    config::Config,
    download::{HttpRepo, RepoClient},
    facts::FactCollector,
    init_tracing_subscriber,
    installer::NativeDispatcher,
    manifest::{self, SelfServiceManifest},
    orchestrator::{Orchestrator, RunContext, RunOutcome},
    progress::ProgressTracker,
    server::{StatusServer, TrackerSink, STATUS_PORT},
    session::Session,
    store, util, Result,
};

#[derive(Parser, Debug)]
#[clap(author, version, about, bin_name("cimian"), no_binary_name(true))]
pub(crate) struct Cli {
    /// Evaluate what would change, but dispatch no installers.
    #[clap(long = "checkonly")]
    check_only: bool,
    /// Run unattended and exit at completion.
    #[clap(long)]
    auto: bool,
    /// Accept loopback status reporting on the well-known port.
    #[clap(long = "show-status")]
    show_status: bool,
    /// Logging verbosity, 0 to 3.
    #[clap(long, default_value_t = 0)]
    verbosity: u8,
    /// Restrict the run to the named items. Repeatable or comma-separated;
    /// implies a real run even when combined with --checkonly.
    #[clap(long = "item", value_delimiter = ',')]
    items: Vec<String>,
    /// Read the configuration from this file instead of the default
    /// location.
    #[clap(short, long)]
    config: Option<PathBuf>,
}

fn run_cli(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    let session = Session::new(&config.logs_dir(), cli.verbosity)?;
    session.log_line(
        tracing::Level::INFO,
        &format!("session {} started (logs in {})", session.id(), session.display_log_dir()),
    );

    let tracker = Arc::new(ProgressTracker::new(
        session.id(),
        Some(session.log_dir().join("progress.json")),
    ));

    let _status_server = if cli.show_status {
        let sink = Arc::new(TrackerSink::new(
            tracker.clone(),
            session.cancel_token().clone(),
        ));
        match StatusServer::start(STATUS_PORT, sink) {
            Ok(server) => Some(server),
            Err(e) => {
                tracing::warn!("status listener unavailable: {e}");
                None
            }
        }
    } else {
        None
    };

    let repo: Arc<dyn RepoClient> = Arc::new(HttpRepo::new(
        &config.software_repo_url,
        &config.repo_user,
        &config.repo_pass,
    ));

    let facts = FactCollector::with_defaults(config.active_catalogs()).gather();
    tracing::debug!("gathered {} host facts", facts.len());

    let client_identifier = if config.client_identifier.trim().is_empty() {
        facts
            .get("hostname")
            .map(|v| v.to_comparable())
            .unwrap_or_default()
    } else {
        config.client_identifier.clone()
    };

    let self_service = SelfServiceManifest::load(&config.self_service_manifest_path())?;
    let mut expansion = manifest::expand(
        &client_identifier,
        repo.as_ref(),
        &facts,
        Some(self_service.manifest()),
    )?;

    // an explicit item list narrows the run and forces real dispatch
    let check_only = if cli.items.is_empty() {
        cli.check_only
    } else {
        let wanted: Vec<String> = cli.items.iter().map(|i| i.to_ascii_lowercase()).collect();
        let keep = |entries: &mut Vec<manifest::ManifestEntry>| {
            entries.retain(|e| wanted.contains(&e.name.to_ascii_lowercase()));
        };
        keep(&mut expansion.managed_installs);
        keep(&mut expansion.managed_uninstalls);
        keep(&mut expansion.managed_updates);
        keep(&mut expansion.optional_installs);
        false
    };

    let host_arch = facts
        .get("arch")
        .map(|v| v.to_comparable())
        .unwrap_or_else(|| config.default_arch.clone());

    let cache = Arc::new(CatalogCache::new(repo.clone()));
    let index = CatalogIndex::new(cache, config.active_catalogs(), &host_arch);
    let store = store::platform_store(&config.managed_installs_dir)?;
    let dispatcher = NativeDispatcher::new();

    let orchestrator = Orchestrator::new(RunContext {
        index: &index,
        store: store.as_ref(),
        dispatcher: &dispatcher,
        repo: repo.as_ref(),
        tracker: tracker.clone(),
        session: &session,
        cache_dir: config.cache_path.clone(),
        check_only,
        self_service: Some(self_service),
    });

    let report = orchestrator.run(&expansion)?;

    if let Err(e) = util::sweep_cache(&config.cache_path) {
        tracing::warn!("cache sweep failed: {e}");
    }

    match report.outcome {
        Some(RunOutcome::Warnings) => session.log_line(
            tracing::Level::WARN,
            &format!("completed with {} item failures", report.failed.len()),
        ),
        _ => session.log_line(tracing::Level::INFO, "completed"),
    }
    if cli.auto {
        tracing::debug!("unattended run, exiting at completion");
    }

    Ok(())
}

/// Run the agent CLI, exiting the process on failure.
pub fn run<I, A>(args: I)
where
    I: IntoIterator<Item = A>,
    A: Into<OsString> + Clone,
{
    match try_run(args) {
        Err(crate::Error::Clap(e)) => e.exit(),
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
        Ok(()) => (),
    }
}

/// Try run the agent CLI.
pub fn try_run<I, A>(args: I) -> Result<()>
where
    I: IntoIterator<Item = A>,
    A: Into<OsString> + Clone,
{
    let cli = Cli::try_parse_from(args)?;
    init_tracing_subscriber(cli.verbosity);
    run_cli(cli)
}
