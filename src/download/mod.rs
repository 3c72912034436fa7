//! Page fetching and the download orchestrator.
//!
//! # Overview
//!
//! - [`HttpClient`] - Thin reqwest wrapper with status-aware errors
//! - [`PageFetcher`] - Bounded retries, body verification, IIIF quality
//!   fallback and egress selection for one page
//! - [`EgressPool`] - Direct connection plus optional proxies with health
//!   tracking
//! - [`DownloadEngine`] - Runs a manuscript's pages concurrently, sweeps the
//!   retry queue and reports progress
//! - [`PageSink`] - Where verified pages go
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mss_core::download::{EgressPool, FetchOptions, FetchOutcome, PageFetcher};
//! use mss_core::queue::RetryQueue;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = FetchOptions::default();
//! let pool = Arc::new(EgressPool::from_options(&options)?);
//! let fetcher = PageFetcher::new(options, pool, RetryQueue::in_memory())?;
//!
//! match fetcher.fetch("https://example.org/iiif/p1/full/max/0/default.jpg", 0).await {
//!     FetchOutcome::Fetched(page) => println!("{} bytes", page.bytes.len()),
//!     FetchOutcome::Failed(failure) => eprintln!("gave up: {}", failure.last_error),
//! }
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod engine;
mod error;
mod fetcher;
mod options;
mod proxy;
mod quality;
mod retry;
mod sink;
mod verify;

pub use client::HttpClient;
pub use engine::{
    BatchReport, DEFAULT_CONCURRENCY, DEFAULT_MAX_SWEEPS, DownloadEngine, DownloadStats,
    EngineError, IdentityRefresher, PageImage, PageResult, PageState, ProgressEvent,
    UnrecoverablePage, UrlRefresher,
};
pub use error::FetchError;
pub use fetcher::{FetchFailure, FetchOutcome, FetchedImage, PageFetcher};
pub use options::{
    ConfigError, DEFAULT_HEALTH_CHECK_INTERVAL, DEFAULT_QUALITY_FALLBACK_THRESHOLD, FetchOptions,
};
pub use proxy::{
    DIRECT_FIRST_ATTEMPTS, Egress, EgressHandle, EgressHealth, EgressPool, EgressStatus,
    blames_egress, probe_url_for,
};
pub use quality::{QualityLadder, SIZE_LADDER};
pub use retry::{
    DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES, DEFAULT_MIN_DELAY, FailureType, RetryDecision,
    RetryPolicy, classify_error, parse_retry_after,
};
pub use sink::{DirectorySink, PageSink, page_file_name, sanitize_label};
pub use verify::{PageFormat, detect_format, verify_page_body};
