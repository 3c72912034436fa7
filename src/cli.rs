//! CLI argument definitions using clap derive macros.
//!
//! Tunables are `Option`s so that a value given on the command line can be
//! told apart from one that should fall back to the config file.

use std::path::PathBuf;

use clap::Parser;

/// Download every page of a digitized manuscript.
///
/// Pages may be single images (IIIF or plain), Deep Zoom pyramids or ZIF
/// containers. Pages that keep failing are retried in sweeps at the end.
#[derive(Parser, Debug)]
#[command(name = "mss-downloader")]
#[command(author, version, about)]
pub struct Args {
    /// JSON manifest: a local path, file:// URL or http(s) URL
    #[arg(required_unless_present = "pages", conflicts_with = "pages")]
    pub manifest: Option<String>,

    /// Download these page URLs instead of a manifest (repeatable)
    #[arg(short = 'p', long = "page", value_name = "URL")]
    pub pages: Vec<String>,

    /// Config file (defaults to $XDG_CONFIG_HOME/mss-downloader/config.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory the pages are written to
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Directory holding the retry queue and manifest cache database
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Maximum pages in flight (1-100)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u16).range(1..=100))]
    pub concurrency: Option<u16>,

    /// Maximum tile requests in flight per page (1-64)
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..=64))]
    pub tile_concurrency: Option<u16>,

    /// Total attempts per page, including the first (1-100)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub max_retries: Option<u32>,

    /// Lower bound of the backoff delay in milliseconds
    #[arg(long, value_name = "MS")]
    pub min_delay_ms: Option<u64>,

    /// Upper bound of the backoff delay in milliseconds
    #[arg(long, value_name = "MS")]
    pub max_delay_ms: Option<u64>,

    /// Passes over the retry queue after the initial pass (0-20)
    #[arg(short = 's', long, value_parser = clap::value_parser!(u32).range(0..=20))]
    pub max_sweeps: Option<u32>,

    /// Never drop to smaller IIIF sizes
    #[arg(long)]
    pub no_quality_fallback: bool,

    /// Consecutive failures before dropping one IIIF size (1-50)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=50))]
    pub quality_fallback_threshold: Option<u32>,

    /// Egress path: `relay:<prefix>`, `proxy:<url>` or a bare proxy URL (repeatable)
    #[arg(long = "proxy", value_name = "EGRESS")]
    pub proxies: Vec<String>,

    /// Probe egress paths before fetching and periodically after
    #[arg(long)]
    pub proxy_health_check: bool,

    /// Keep the retry queue in the state database across runs
    #[arg(long)]
    pub persistent_queue: bool,

    /// Minimum body size in bytes for a page to count as valid
    #[arg(long, value_name = "BYTES")]
    pub page_verification_size: Option<usize>,

    /// Per-request timeout in seconds (1-3600)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub request_timeout_secs: Option<u64>,

    /// Connect timeout in seconds (1-3600)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub connect_timeout_secs: Option<u64>,

    /// Largest composited canvas side in pixels (256-65535)
    #[arg(long, value_parser = clap::value_parser!(u32).range(256..=65_535))]
    pub max_canvas_dimension: Option<u32>,

    /// Fraction of tiles a composited page needs to count as verified (0-1)
    #[arg(long, value_name = "FRACTION", default_value_t = 0.0)]
    pub min_tile_coverage: f64,

    /// Skip the manifest cache
    #[arg(long)]
    pub no_cache: bool,

    /// Drop the cached manifest before resolving
    #[arg(long, conflicts_with = "no_cache")]
    pub refresh_manifest: bool,
}
