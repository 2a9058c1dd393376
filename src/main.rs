//! CLI entry point for the workdl tool.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};
use workdl_core::reconcile::{CheckOutcome, RecoverOptions};
use workdl_core::{
    Aria2Fetcher, BatchSummary, CatalogClient, Config, DownloadOrchestrator, FetchBackend, Fetcher,
    HttpFetcher, Library, PermissiveLedger, Reconciler, render_diff_tree,
};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let mut config = Config::load_or_default_path(args.config.as_deref())
        .context("failed to load configuration")?;

    if let Command::Get { replace: true, .. } = &args.command {
        config.download.replace = true;
    }

    let library = Library::new(
        workdl_core::config::expand_tilde(&config.paths.download_dir),
        workdl_core::config::expand_tilde(&config.paths.storage_dir),
    );

    let api = Arc::new(
        CatalogClient::builder(&config.api.base_url)
            .credentials(&config.api.username, &config.api.password)
            .proxy(config.api.proxy.clone())
            .retries(
                Duration::from_millis(config.download.base_delay_ms),
                config.download.max_retries,
            )
            .build()?,
    );

    let reconciler = Reconciler::new(library.clone(), Arc::clone(&api));

    match args.command {
        Command::Get { ids, .. } => {
            api.login().await?;
            let orchestrator = build_orchestrator(&config, &library, &api)?;
            install_interrupt_handler(&orchestrator);

            let spinner = batch_spinner(ids.len(), args.quiet);
            let summary = orchestrator.download(&ids).await;
            finish_batch(&spinner, &summary);
        }
        Command::Update { ids } => {
            api.login().await?;
            let orchestrator = build_orchestrator(&config, &library, &api)?;
            let summary = orchestrator.update(&ids).await;
            report_failures(&summary);
            info!(items = ids.len() - summary.failed_items, "manifests updated");
        }
        Command::Diff { id } => {
            let report = reconciler.diff(id)?;
            print!("{}", render_diff_tree(&report));
        }
        Command::Check { ids, ids_only } => {
            let report = reconciler.check(&ids);
            for (id, outcome) in &report.items {
                match outcome {
                    CheckOutcome::Ok => debug!(%id, "complete"),
                    CheckOutcome::Incomplete { missing } => {
                        warn!(%id, missing, "missing wanted files");
                    }
                    CheckOutcome::Unreadable { reason } => warn!(%id, reason = %reason, "unreadable"),
                }
            }
            let failing = report.failing_ids();
            if ids_only {
                for id in &failing {
                    println!("{id}");
                }
            } else if failing.is_empty() {
                info!(items = report.items.len(), "all items complete");
            } else {
                warn!(failing = failing.len(), "items need recover or update");
            }
        }
        Command::Recover {
            id,
            regex,
            ignore_filter,
        } => {
            api.login().await?;
            let orchestrator = build_orchestrator(&config, &library, &api)?;
            install_interrupt_handler(&orchestrator);

            let options = RecoverOptions {
                path_pattern: regex,
                include_filtered: ignore_filter,
            };
            let summary = reconciler.recover(&orchestrator, id, &options).await?;
            report_failures(&summary);
            info!(fetched = summary.fetched, "recover complete");
        }
        Command::Verify { id } => {
            api.login().await?;
            let report = reconciler.verify(id).await?;
            for (file_id, path) in &report.mismatched {
                warn!(file_id, path = %path.display(), "hash mismatch");
            }
            for (file_id, path, reason) in &report.errors {
                warn!(file_id, path = %path.display(), reason = %reason, "verification error");
            }
            info!(
                verified = report.verified,
                mismatched = report.mismatched.len(),
                errors = report.errors.len(),
                skipped_missing = report.skipped_missing,
                "verify complete"
            );
        }
    }

    Ok(())
}

/// Wires the fetch backend and orchestrator from configuration.
fn build_orchestrator(
    config: &Config,
    library: &Library,
    api: &Arc<CatalogClient>,
) -> Result<DownloadOrchestrator> {
    let fetcher: Arc<dyn Fetcher> = match config.download.backend {
        FetchBackend::Http => Arc::new(HttpFetcher::new(config.api.proxy.as_deref())?),
        FetchBackend::Aria2 => Arc::new(Aria2Fetcher::new(
            &config.download.aria2_url,
            config.download.aria2_secret.clone(),
        )?),
    };

    Ok(DownloadOrchestrator::new(
        Arc::clone(api),
        library.clone(),
        config.filter_engine()?,
        fetcher,
        Arc::new(PermissiveLedger),
        &config.download,
    ))
}

/// Lets ctrl-c stop new fetch dispatch while in-flight fetches drain.
fn install_interrupt_handler(orchestrator: &DownloadOrchestrator) {
    let flag = orchestrator.shutdown_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight fetches");
            flag.store(true, Ordering::SeqCst);
        }
    });
}

/// Spinner shown while a batch runs (suppressed by --quiet).
fn batch_spinner(items: usize, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(format!("downloading {items} item(s)"));
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}

fn finish_batch(spinner: &ProgressBar, summary: &BatchSummary) {
    spinner.finish_and_clear();
    report_failures(summary);
    info!(
        fetched = summary.fetched,
        skipped = summary.skipped_existing,
        filtered = summary.filtered,
        "download complete"
    );
}

/// Prints aggregated failures after the whole batch has settled.
fn report_failures(summary: &BatchSummary) {
    if summary.is_clean() {
        return;
    }
    warn!(
        failed_files = summary.failed_files,
        failed_items = summary.failed_items,
        "batch finished with failures"
    );
    for line in &summary.failures {
        warn!("  {line}");
    }
}
