//! Merges CLI flags, file config and built-in defaults.
//!
//! Precedence is CLI > file > default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use mss_core::download::{
    DEFAULT_CONCURRENCY, DEFAULT_MAX_SWEEPS, Egress, FetchOptions,
};
use mss_core::pyramid::{DEFAULT_MAX_CANVAS_DIMENSION, DEFAULT_TILE_CONCURRENCY};

use crate::app_config::{FileConfig, resolve_default_state_dir};
use crate::cli::Args;

/// Everything the run needs, resolved.
#[derive(Debug, Clone)]
pub struct Settings {
    pub fetch: FetchOptions,
    pub concurrency: usize,
    pub tile_concurrency: usize,
    pub max_sweeps: u32,
    pub max_canvas_dimension: u32,
    pub min_tile_coverage: f64,
    pub output_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl Settings {
    /// Resolves settings from `args` over `file`.
    ///
    /// # Errors
    ///
    /// Returns an error for an unparseable `--proxy` or inconsistent fetch
    /// options.
    pub fn resolve(args: &Args, file: Option<&FileConfig>) -> Result<Self> {
        let file = file.cloned().unwrap_or_default();
        let defaults = FetchOptions::default();

        let proxies = if args.proxies.is_empty() {
            file.proxies.unwrap_or_default()
        } else {
            args.proxies
                .iter()
                .map(|raw| Egress::from_str(raw).map_err(|e| anyhow!("invalid --proxy '{raw}': {e}")))
                .collect::<Result<Vec<_>>>()?
        };

        let fetch = FetchOptions {
            max_retries: args
                .max_retries
                .or(file.max_retries)
                .unwrap_or(defaults.max_retries),
            min_delay: args
                .min_delay_ms
                .or(file.min_delay_ms)
                .map_or(defaults.min_delay, Duration::from_millis),
            max_delay: args
                .max_delay_ms
                .or(file.max_delay_ms)
                .map_or(defaults.max_delay, Duration::from_millis),
            max_quality_fallbacks: if args.no_quality_fallback {
                false
            } else {
                file.max_quality_fallbacks
                    .unwrap_or(defaults.max_quality_fallbacks)
            },
            quality_fallback_threshold: args
                .quality_fallback_threshold
                .or(file.quality_fallback_threshold)
                .unwrap_or(defaults.quality_fallback_threshold),
            proxy_health_check: args.proxy_health_check
                || file
                    .proxy_health_check
                    .unwrap_or(defaults.proxy_health_check),
            proxies,
            persistent_queue: args.persistent_queue
                || file.persistent_queue.unwrap_or(defaults.persistent_queue),
            page_verification_size: args
                .page_verification_size
                .or(file.page_verification_size)
                .unwrap_or(defaults.page_verification_size),
            request_timeout: args
                .request_timeout_secs
                .or(file.request_timeout_secs)
                .map_or(defaults.request_timeout, Duration::from_secs),
            connect_timeout: args
                .connect_timeout_secs
                .or(file.connect_timeout_secs)
                .map_or(defaults.connect_timeout, Duration::from_secs),
            ..defaults
        };
        fetch.validate()?;

        Ok(Self {
            fetch,
            concurrency: args
                .concurrency
                .map(usize::from)
                .or(file.concurrency)
                .unwrap_or(DEFAULT_CONCURRENCY),
            tile_concurrency: args
                .tile_concurrency
                .map(usize::from)
                .or(file.tile_concurrency)
                .unwrap_or(DEFAULT_TILE_CONCURRENCY),
            max_sweeps: args
                .max_sweeps
                .or(file.max_sweeps)
                .unwrap_or(DEFAULT_MAX_SWEEPS),
            max_canvas_dimension: args
                .max_canvas_dimension
                .or(file.max_canvas_dimension)
                .unwrap_or(DEFAULT_MAX_CANVAS_DIMENSION),
            min_tile_coverage: args.min_tile_coverage,
            output_dir: args
                .output_dir
                .clone()
                .or(file.output_dir)
                .unwrap_or_else(|| PathBuf::from(".")),
            state_dir: args
                .state_dir
                .clone()
                .or(file.state_dir)
                .unwrap_or_else(resolve_default_state_dir),
        })
    }

    /// State database path inside the state directory.
    #[must_use]
    pub fn state_db_path(&self) -> PathBuf {
        self.state_dir.join("state.db")
    }
}
