//! CLI entry point for the manuscript downloader.

use std::io::{self, IsTerminal};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mss_core::download::{DirectorySink, DownloadEngine, EgressPool, HttpClient, PageFetcher};
use mss_core::manifest::{
    CachedResolver, JsonManifestResolver, Manifest, ManifestPage, ManifestResolver,
};
use mss_core::{Compositor, Database, ManifestCache, RetryQueue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod app_config;
mod cli;
mod progress;
mod settings;

use cli::Args;
use settings::Settings;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

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
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let file_config = app_config::load_config(args.config.as_deref())?;
    let settings = Settings::resolve(&args, file_config.as_ref())?;
    debug!(?settings, "settings resolved");

    let use_cache = args.manifest.is_some() && !args.no_cache;
    let db = if settings.fetch.persistent_queue || use_cache {
        tokio::fs::create_dir_all(&settings.state_dir)
            .await
            .with_context(|| {
                format!("Failed to create state dir '{}'", settings.state_dir.display())
            })?;
        Some(Database::new(&settings.state_db_path()).await?)
    } else {
        None
    };

    let client = HttpClient::new_with_timeouts(
        settings.fetch.connect_timeout,
        settings.fetch.request_timeout,
    );
    let manifest = load_manifest(&args, db.as_ref(), use_cache, client).await?;
    info!(title = %manifest.title, pages = manifest.pages.len(), "manifest ready");

    let queue = match (&db, settings.fetch.persistent_queue) {
        (Some(db), true) => RetryQueue::persistent(db.clone()),
        _ => RetryQueue::in_memory(),
    };
    let pool = Arc::new(EgressPool::from_options(&settings.fetch)?);
    let fetcher = PageFetcher::new(settings.fetch.clone(), pool, queue)?;
    let compositor = Compositor::new(settings.max_canvas_dimension, settings.tile_concurrency);

    let (progress_tx, progress_rx) = tokio::sync::mpsc::unbounded_channel();
    let engine = DownloadEngine::new(settings.concurrency, fetcher, compositor)?
        .with_max_sweeps(settings.max_sweeps)
        .with_min_tile_coverage(settings.min_tile_coverage)?
        .with_sink(Arc::new(DirectorySink::new(&settings.output_dir)))
        .with_progress(progress_tx);

    let show_bar = !args.quiet && io::stderr().is_terminal();
    let progress = progress::spawn_progress_ui(show_bar, manifest.pages.len(), progress_rx);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight pages");
            signal_cancel.cancel();
        }
    });

    let report = engine.download_all(&manifest.pages, &cancel).await?;
    drop(engine);
    if let Err(e) = progress.await {
        warn!(error = %e, "progress task failed");
    }

    for page in &report.unrecoverable {
        warn!(
            page_index = page.page_index,
            label = %page.label,
            url = %page.url,
            reason = %page.reason,
            "page unrecoverable"
        );
    }
    info!(
        verified = report.verified(),
        total = report.total(),
        unrecoverable = report.unrecoverable.len(),
        retried = report.stats.retried(),
        sweeps = report.sweeps_run,
        output_dir = %settings.output_dir.display(),
        "Download complete"
    );

    if let Some(db) = db {
        db.close().await;
    }

    Ok(if report.is_complete() {
        ExitCode::SUCCESS
    } else if report.cancelled {
        ExitCode::from(130)
    } else {
        ExitCode::FAILURE
    })
}

/// Resolves the manifest argument, or builds one from `--page` URLs.
async fn load_manifest(
    args: &Args,
    db: Option<&Database>,
    use_cache: bool,
    client: HttpClient,
) -> Result<Manifest> {
    let Some(source) = &args.manifest else {
        let pages = args
            .pages
            .iter()
            .enumerate()
            .map(|(index, url)| ManifestPage::new(url, format!("Page {}", index + 1)))
            .collect();
        let manifest = Manifest {
            title: String::new(),
            pages,
        };
        manifest.validate()?;
        return Ok(manifest);
    };

    let resolver = JsonManifestResolver::new(client);
    let manifest = match db {
        Some(db) if use_cache => {
            let cache = ManifestCache::open(db.clone(), None).await?;
            if args.refresh_manifest && cache.invalidate(source).await? {
                debug!(source, "cached manifest dropped");
            }
            CachedResolver::new(resolver, cache).resolve(source).await?
        }
        _ => resolver.resolve(source).await?,
    };
    Ok(manifest)
}
