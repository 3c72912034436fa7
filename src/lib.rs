//! Manuscript page downloader core library.
//!
//! Turns a manuscript's page list into verified page images, surviving
//! flaky library servers along the way.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`manifest`] - Page lists and the resolver seam
//! - [`cache`] - Persistent manifest cache
//! - [`download`] - Page fetcher, egress pool and the download orchestrator
//! - [`pyramid`] - Deep Zoom / ZIF descriptors and the tile compositor
//! - [`queue`] - Retry queue for pages that have not verified yet
//! - [`db`] - State database connection and schema management

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod db;
pub mod download;
pub mod manifest;
pub mod pyramid;
pub mod queue;

// Re-export commonly used types
pub use cache::{CacheError, ManifestCache};
pub use db::Database;
pub use download::{
    BatchReport, DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, DirectorySink, DownloadEngine,
    DownloadStats, EgressPool, EngineError, FetchError, FetchOptions, FetchOutcome, HttpClient,
    PageFetcher, PageFormat, PageState, ProgressEvent,
};
pub use manifest::{
    CachedResolver, JsonManifestResolver, Manifest, ManifestPage, ManifestResolver, PageKind,
    ResolveError,
};
pub use pyramid::{Compositor, PyramidMetadata};
pub use queue::{DownloadTask, QueueError, QueueStatus, RetryQueue};
