//! Page download orchestrator.
//!
//! # Overview
//!
//! [`DownloadEngine::download_all`] takes a manuscript's pages and drives
//! each one to a verified image:
//!
//! 1. **Initial pass**: pages start in manifest order, at most `concurrency`
//!    at a time. Plain images go through the [`PageFetcher`]; Deep Zoom and
//!    ZIF pages are fetched tile by tile and stitched by the [`Compositor`].
//! 2. **Sweeps**: up to `max_sweeps` further passes over the retry queue,
//!    re-attempting the tasks that belong to this batch in queue order.
//! 3. **Report**: per-page results plus the pages that stayed unrecoverable.
//!
//! When a progress channel is attached, every page that verifies is
//! published as a [`ProgressEvent`] right away. Pages still failed after the
//! last sweep are published once, at the end of the batch.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mss_core::download::{DownloadEngine, EgressPool, FetchOptions, PageFetcher};
//! use mss_core::manifest::ManifestPage;
//! use mss_core::pyramid::Compositor;
//! use mss_core::queue::RetryQueue;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = FetchOptions::default();
//! let pool = Arc::new(EgressPool::from_options(&options)?);
//! let fetcher = PageFetcher::new(options, pool, RetryQueue::in_memory())?;
//! let engine = DownloadEngine::new(3, fetcher, Compositor::default())?;
//!
//! let pages = vec![ManifestPage::new("https://example.org/p1.jpg", "f. 1r")];
//! let report = engine.download_all(&pages, &CancellationToken::new()).await?;
//! println!("verified {}/{}", report.verified(), report.total());
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::FetchError;
use super::fetcher::{FetchOutcome, PageFetcher};
use super::sink::PageSink;
use super::verify::PageFormat;
use crate::manifest::{ManifestPage, PageKind};
use crate::pyramid::{
    CompositeError, CompositeOutcome, Compositor, DescriptorError, HttpTileSource, ZifContainer,
    parse_dzi, probe_deep_zoom_layout,
};
use crate::queue::{DownloadTask, QueueError, now_millis};

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
const MAX_CONCURRENCY: usize = 100;

/// Default number of pages in flight.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Default number of passes over the retry queue after the initial pass.
pub const DEFAULT_MAX_SWEEPS: u32 = 2;

/// Error type for download engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// Minimum tile coverage outside `[0, 1]`.
    #[error("invalid minimum tile coverage {value}: must be between 0 and 1")]
    InvalidCoverage { value: f64 },

    /// Queue operation failed.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Semaphore was closed unexpectedly.
    #[error("semaphore closed unexpectedly")]
    SemaphoreClosed,
}

/// Lifecycle of one page within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageState {
    Pending,
    Fetching,
    Verified,
    Failed,
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Verified => "verified",
            Self::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

/// Published when a page is verified, and for every page still failed once
/// the last sweep of the batch has run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Pages verified so far.
    pub completed: usize,
    pub total: usize,
    pub page_index: usize,
    pub label: String,
    pub state: PageState,
    /// `(page_index, reason)` of every page whose latest attempt failed.
    pub failures: Vec<(usize, String)>,
}

/// Bytes of a verified page.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub bytes: Vec<u8>,
    pub format: PageFormat,
    /// URL the bytes came from (after quality fallback or descriptor resolution).
    pub fetched_url: String,
    /// Known for composited pages.
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Final state of one page.
#[derive(Debug, Clone)]
pub struct PageResult {
    pub page_index: usize,
    pub label: String,
    /// URL of the most recent attempt.
    pub url: String,
    pub kind: PageKind,
    pub state: PageState,
    /// Kept when no [`PageSink`] is attached.
    pub image: Option<PageImage>,
    /// Where the sink stored the page.
    pub saved_to: Option<PathBuf>,
    /// Attempts made during this batch.
    pub attempts: u32,
    /// Tiles that could not be placed (composited pages only).
    pub missing_tiles: usize,
    pub error: Option<String>,
}

/// A page that never verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnrecoverablePage {
    pub page_index: usize,
    pub label: String,
    pub url: String,
    pub reason: String,
}

/// Statistics from a download batch.
///
/// Uses atomic counters for updates from concurrent page tasks.
#[derive(Debug, Default)]
pub struct DownloadStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
}

impl DownloadStats {
    /// Creates a new stats tracker with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pages verified.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Page rounds (initial or sweep) that ended without a verified image.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Pages re-attempted by sweeps.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    fn increment_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn add_retried(&self, count: usize) {
        self.retried.fetch_add(count, Ordering::SeqCst);
    }
}

/// Outcome of [`DownloadEngine::download_all`].
#[derive(Debug)]
pub struct BatchReport {
    /// One entry per input page, in manifest order.
    pub results: Vec<PageResult>,
    /// Pages still failed after the last sweep.
    pub unrecoverable: Vec<UnrecoverablePage>,
    pub cancelled: bool,
    pub sweeps_run: u32,
    pub elapsed: Duration,
    pub stats: DownloadStats,
}

impl BatchReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// Pages that ended `Verified`.
    #[must_use]
    pub fn verified(&self) -> usize {
        self.count(PageState::Verified)
    }

    /// Pages never attempted because the batch was cancelled.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.count(PageState::Pending)
    }

    /// Returns `true` if every page verified.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.verified() == self.total()
    }

    fn count(&self, state: PageState) -> usize {
        self.results.iter().filter(|r| r.state == state).count()
    }
}

/// Supplies a fresh URL for a page before a sweep re-attempts it.
///
/// Library adapters whose image URLs carry expiring tokens implement this.
#[async_trait]
pub trait UrlRefresher: Send + Sync + fmt::Debug {
    async fn refresh(&self, page_index: usize, url: &str) -> String;
}

/// Keeps URLs unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityRefresher;

#[async_trait]
impl UrlRefresher for IdentityRefresher {
    async fn refresh(&self, _page_index: usize, url: &str) -> String {
        url.to_string()
    }
}

/// Why a composited page failed.
#[derive(Debug, thiserror::Error)]
enum TiledPageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Composite(#[from] CompositeError),
    #[error("tile coverage {coverage:.2} is below the minimum {minimum:.2}")]
    Coverage { coverage: f64, minimum: f64 },
    #[error("cancelled")]
    Cancelled,
}

/// One page to attempt in a round.
#[derive(Debug, Clone)]
struct Job {
    page_index: usize,
    page: ManifestPage,
    /// Queued task when this is a sweep attempt.
    prior: Option<DownloadTask>,
}

enum JobOutcome {
    Verified {
        image: PageImage,
        attempts: u32,
        missing_tiles: usize,
    },
    Failed {
        reason: String,
        attempts: u32,
    },
    /// Cancelled before any attempt.
    Skipped,
}

/// Per-batch page bookkeeping, shared by page tasks.
struct Tracker {
    results: Vec<PageResult>,
    failures: BTreeMap<usize, String>,
    progress: Option<UnboundedSender<ProgressEvent>>,
}

impl Tracker {
    fn new(pages: &[ManifestPage], progress: Option<UnboundedSender<ProgressEvent>>) -> Self {
        let results = pages
            .iter()
            .enumerate()
            .map(|(page_index, page)| PageResult {
                page_index,
                label: page.label.clone(),
                url: page.url.clone(),
                kind: page.kind,
                state: PageState::Pending,
                image: None,
                saved_to: None,
                attempts: 0,
                missing_tiles: 0,
                error: None,
            })
            .collect();
        Self {
            results,
            failures: BTreeMap::new(),
            progress,
        }
    }

    fn start(&mut self, page_index: usize) {
        if let Some(result) = self.results.get_mut(page_index) {
            result.state = PageState::Fetching;
        }
    }

    fn finish(
        &mut self,
        job: &Job,
        outcome: JobOutcome,
        saved_to: Option<PathBuf>,
        keep_image: bool,
    ) {
        let Some(result) = self.results.get_mut(job.page_index) else {
            return;
        };
        result.url.clone_from(&job.page.url);
        let state = match outcome {
            JobOutcome::Verified {
                image,
                attempts,
                missing_tiles,
            } => {
                result.attempts += attempts;
                result.missing_tiles = missing_tiles;
                result.image = keep_image.then_some(image);
                result.saved_to = saved_to;
                result.error = None;
                self.failures.remove(&job.page_index);
                PageState::Verified
            }
            JobOutcome::Failed { reason, attempts } => {
                result.attempts += attempts;
                result.error = Some(reason.clone());
                self.failures.insert(job.page_index, reason);
                PageState::Failed
            }
            JobOutcome::Skipped => {
                // Nothing was attempted; fall back to the state before this round.
                result.state = if result.error.is_some() {
                    PageState::Failed
                } else {
                    PageState::Pending
                };
                return;
            }
        };
        result.state = state;
        // A failure is final only once no sweep is left to retry it.
        if state == PageState::Verified {
            self.publish(job.page_index, state);
        }
    }

    fn publish_final_failures(&self) {
        for result in self.results.iter().filter(|r| r.state == PageState::Failed) {
            self.publish(result.page_index, PageState::Failed);
        }
    }

    fn publish(&self, page_index: usize, state: PageState) {
        let Some(progress) = &self.progress else {
            return;
        };
        let event = ProgressEvent {
            completed: self
                .results
                .iter()
                .filter(|r| r.state == PageState::Verified)
                .count(),
            total: self.results.len(),
            page_index,
            label: self.results[page_index].label.clone(),
            state,
            failures: self
                .failures
                .iter()
                .map(|(index, reason)| (*index, reason.clone()))
                .collect(),
        };
        if progress.send(event).is_err() {
            debug!("progress receiver dropped");
        }
    }
}

fn lock(tracker: &Mutex<Tracker>) -> MutexGuard<'_, Tracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything a page task needs; shared across spawned tasks.
#[derive(Debug)]
struct Worker {
    fetcher: PageFetcher,
    compositor: Compositor,
    min_tile_coverage: f64,
    sink: Option<Arc<dyn PageSink>>,
}

impl Worker {
    #[instrument(skip(self, job, cancel), fields(page_index = job.page_index, url = %job.page.url, kind = %job.page.kind))]
    async fn run(&self, job: &Job, cancel: &CancellationToken) -> JobOutcome {
        match job.page.kind {
            PageKind::Image => self.run_image(job, cancel).await,
            PageKind::DeepZoom | PageKind::Zif => self.run_tiled(job, cancel).await,
        }
    }

    async fn run_image(&self, job: &Job, cancel: &CancellationToken) -> JobOutcome {
        let outcome = match &job.prior {
            Some(task) => self.fetcher.retry_task(task, cancel).await,
            None => {
                self.fetcher
                    .fetch_with_cancel(&job.page.url, job.page_index, cancel)
                    .await
            }
        };
        match outcome {
            FetchOutcome::Fetched(image) => JobOutcome::Verified {
                attempts: image.attempts,
                missing_tiles: 0,
                image: PageImage {
                    bytes: image.bytes,
                    format: image.format,
                    fetched_url: image.fetched_url,
                    width: None,
                    height: None,
                },
            },
            FetchOutcome::Failed(failure) if failure.attempts == 0 => JobOutcome::Skipped,
            FetchOutcome::Failed(failure) => JobOutcome::Failed {
                reason: failure.last_error.to_string(),
                attempts: failure.attempts,
            },
        }
    }

    async fn run_tiled(&self, job: &Job, cancel: &CancellationToken) -> JobOutcome {
        let url = &job.page.url;
        let queue = self.fetcher.queue();
        match self.composite(job, cancel).await {
            Ok(outcome) => {
                if let Err(e) = queue.remove(url, job.page_index).await {
                    warn!(error = %e, "failed to remove composited page from retry queue");
                }
                JobOutcome::Verified {
                    attempts: 1,
                    missing_tiles: outcome.missing_tiles(),
                    image: PageImage {
                        bytes: outcome.bytes,
                        format: outcome.format,
                        fetched_url: url.clone(),
                        width: Some(outcome.width),
                        height: Some(outcome.height),
                    },
                }
            }
            Err(TiledPageError::Cancelled) => JobOutcome::Skipped,
            Err(error) => {
                let reason = error.to_string();
                warn!(error = %reason, "tiled page failed");
                let task = DownloadTask {
                    page_index: job.page_index,
                    source_url: url.clone(),
                    attempt_count: job.prior.as_ref().map_or(0, |t| t.attempt_count) + 1,
                    last_attempt_at: now_millis(),
                    last_error: Some(reason.clone()),
                    quality_level: 0,
                    egress: None,
                };
                if let Err(e) = queue.enqueue(task).await {
                    warn!(error = %e, "failed to record tiled page in retry queue");
                }
                JobOutcome::Failed {
                    reason,
                    attempts: 1,
                }
            }
        }
    }

    async fn composite(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<CompositeOutcome, TiledPageError> {
        if cancel.is_cancelled() {
            return Err(TiledPageError::Cancelled);
        }
        let result = self.build_composite(job, cancel).await;
        // Tiles skipped by a cancel are not missing; the page is incomplete.
        if cancel.is_cancelled() && !matches!(&result, Ok(outcome) if outcome.missing_tiles() == 0) {
            debug!("tiled page interrupted by cancellation");
            return Err(TiledPageError::Cancelled);
        }
        let outcome = result?;

        let coverage = outcome.coverage();
        if coverage < self.min_tile_coverage {
            return Err(TiledPageError::Coverage {
                coverage,
                minimum: self.min_tile_coverage,
            });
        }
        Ok(outcome)
    }

    async fn build_composite(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<CompositeOutcome, TiledPageError> {
        let url = &job.page.url;
        let outcome = if job.page.kind == PageKind::Zif {
            let body = self.fetcher.fetch_body(url, cancel).await?;
            let container = ZifContainer::parse(body, url)?;
            let metadata = container.metadata().clone();
            self.compositor
                .composite(&metadata, metadata.max_level, &container)
                .await?
        } else {
            let metadata = if PageKind::infer(url) == PageKind::DeepZoom {
                let body = self.fetcher.fetch_body(url, cancel).await?;
                parse_dzi(&String::from_utf8_lossy(&body), url)?
            } else {
                let client = self.fetcher.egress().direct_client();
                probe_deep_zoom_layout(url, &client, cancel).await?
            };
            let source = HttpTileSource::new(self.fetcher.clone(), cancel.clone());
            self.compositor
                .composite(&metadata, metadata.max_level, &source)
                .await?
        };
        Ok(outcome)
    }
}

/// Page download orchestrator.
///
/// # Concurrency Model
///
/// - Each page runs in its own Tokio task
/// - A semaphore permit is acquired before starting each page
/// - Permits are released when the page task completes (RAII)
/// - Tile requests inside a page are bounded separately by the compositor
pub struct DownloadEngine {
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    max_sweeps: u32,
    fetcher: PageFetcher,
    compositor: Compositor,
    min_tile_coverage: f64,
    sink: Option<Arc<dyn PageSink>>,
    refresher: Arc<dyn UrlRefresher>,
    progress: Option<UnboundedSender<ProgressEvent>>,
}

impl fmt::Debug for DownloadEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadEngine")
            .field("concurrency", &self.concurrency)
            .field("max_sweeps", &self.max_sweeps)
            .field("min_tile_coverage", &self.min_tile_coverage)
            .field("refresher", &self.refresher)
            .finish_non_exhaustive()
    }
}

impl DownloadEngine {
    /// Creates an engine running at most `concurrency` pages at once.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConcurrency`] if the value is outside
    /// the valid range (1-100).
    #[instrument(level = "debug", skip(fetcher, compositor))]
    pub fn new(
        concurrency: usize,
        fetcher: PageFetcher,
        compositor: Compositor,
    ) -> Result<Self, EngineError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(EngineError::InvalidConcurrency { value: concurrency });
        }
        debug!(
            concurrency,
            max_attempts = fetcher.options().max_retries,
            max_canvas = compositor.max_canvas_dimension(),
            "creating download engine"
        );
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            max_sweeps: DEFAULT_MAX_SWEEPS,
            fetcher,
            compositor,
            min_tile_coverage: 0.0,
            sink: None,
            refresher: Arc::new(IdentityRefresher),
            progress: None,
        })
    }

    /// Sets the number of sweeps after the initial pass.
    #[must_use]
    pub fn with_max_sweeps(mut self, max_sweeps: u32) -> Self {
        self.max_sweeps = max_sweeps;
        self
    }

    /// Sets the fraction of tiles a composited page needs to count as verified.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidCoverage`] outside `[0, 1]`.
    pub fn with_min_tile_coverage(mut self, minimum: f64) -> Result<Self, EngineError> {
        if !(0.0..=1.0).contains(&minimum) {
            return Err(EngineError::InvalidCoverage { value: minimum });
        }
        self.min_tile_coverage = minimum;
        Ok(self)
    }

    /// Hands verified pages to `sink` instead of keeping them in the report.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn PageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Publishes a [`ProgressEvent`] on `progress` for every page transition.
    #[must_use]
    pub fn with_progress(mut self, progress: UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Consults `refresher` for each queued page before a sweep re-attempts it.
    #[must_use]
    pub fn with_refresher(mut self, refresher: Arc<dyn UrlRefresher>) -> Self {
        self.refresher = refresher;
        self
    }

    /// Returns the configured concurrency limit.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    #[must_use]
    pub fn max_sweeps(&self) -> u32 {
        self.max_sweeps
    }

    #[must_use]
    pub fn fetcher(&self) -> &PageFetcher {
        &self.fetcher
    }

    /// Downloads every page, then sweeps the retry queue for this batch's
    /// failures.
    ///
    /// Individual page failures do not make this method fail; they are
    /// reported in [`BatchReport::unrecoverable`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Queue`] if the retry queue cannot be read for a
    /// sweep, and [`EngineError::SemaphoreClosed`] if the semaphore is closed.
    #[instrument(skip(self, pages, cancel), fields(pages = pages.len()))]
    pub async fn download_all(
        &self,
        pages: &[ManifestPage],
        cancel: &CancellationToken,
    ) -> Result<BatchReport, EngineError> {
        let started = Instant::now();
        let stats = Arc::new(DownloadStats::new());
        let tracker = Arc::new(Mutex::new(Tracker::new(pages, self.progress.clone())));
        // URL each page was last attempted with; sweeps match queue tasks against it.
        let mut current_urls: Vec<String> = pages.iter().map(|p| p.url.clone()).collect();

        let worker = Arc::new(Worker {
            fetcher: self.fetcher.clone(),
            compositor: self.compositor.clone(),
            min_tile_coverage: self.min_tile_coverage,
            sink: self.sink.clone(),
        });

        info!(concurrency = self.concurrency, "starting batch");

        let jobs = pages
            .iter()
            .enumerate()
            .map(|(page_index, page)| Job {
                page_index,
                page: page.clone(),
                prior: None,
            })
            .collect();
        self.run_round(jobs, &worker, &tracker, &stats, cancel).await?;

        let mut sweeps_run = 0;
        while sweeps_run < self.max_sweeps && !cancel.is_cancelled() {
            let jobs = self
                .sweep_jobs(pages, &mut current_urls, &tracker)
                .await?;
            if jobs.is_empty() {
                debug!("no queued pages left for this batch");
                break;
            }
            sweeps_run += 1;
            info!(sweep = sweeps_run, pages = jobs.len(), "sweeping retry queue");
            stats.add_retried(jobs.len());
            self.run_round(jobs, &worker, &tracker, &stats, cancel).await?;
        }

        let results = {
            let mut tracker = lock(&tracker);
            tracker.publish_final_failures();
            std::mem::take(&mut tracker.results)
        };
        let unrecoverable: Vec<UnrecoverablePage> = results
            .iter()
            .filter(|r| r.state == PageState::Failed)
            .map(|r| UnrecoverablePage {
                page_index: r.page_index,
                label: r.label.clone(),
                url: r.url.clone(),
                reason: r.error.clone().unwrap_or_default(),
            })
            .collect();

        let stats = Arc::try_unwrap(stats).unwrap_or_else(|shared| {
            let copy = DownloadStats::new();
            copy.completed.store(shared.completed(), Ordering::SeqCst);
            copy.failed.store(shared.failed(), Ordering::SeqCst);
            copy.retried.store(shared.retried(), Ordering::SeqCst);
            copy
        });

        let report = BatchReport {
            results,
            unrecoverable,
            cancelled: cancel.is_cancelled(),
            sweeps_run,
            elapsed: started.elapsed(),
            stats,
        };
        info!(
            verified = report.verified(),
            unrecoverable = report.unrecoverable.len(),
            pending = report.pending(),
            sweeps = report.sweeps_run,
            cancelled = report.cancelled,
            elapsed_ms = report.elapsed.as_millis(),
            "batch finished"
        );
        Ok(report)
    }

    /// Queue tasks that belong to this batch and still need a verified image,
    /// in queue order, with refreshed URLs.
    async fn sweep_jobs(
        &self,
        pages: &[ManifestPage],
        current_urls: &mut [String],
        tracker: &Mutex<Tracker>,
    ) -> Result<Vec<Job>, EngineError> {
        let queue = self.fetcher.queue();
        let mut jobs = Vec::new();
        for mut task in queue.dequeue_all().await? {
            let index = task.page_index;
            let Some(page) = pages.get(index) else {
                continue;
            };
            if current_urls[index] != task.source_url {
                continue;
            }
            let verified = lock(tracker)
                .results
                .get(index)
                .is_some_and(|r| r.state == PageState::Verified);
            if verified {
                continue;
            }

            let fresh = self.refresher.refresh(index, &task.source_url).await;
            if fresh != task.source_url {
                debug!(page_index = index, old = %task.source_url, new = %fresh, "page URL refreshed");
                queue.remove(&task.source_url, index).await?;
                task.source_url.clone_from(&fresh);
                current_urls[index].clone_from(&fresh);
            }
            let page = ManifestPage {
                url: fresh,
                ..page.clone()
            };
            jobs.push(Job {
                page_index: index,
                page,
                prior: Some(task),
            });
        }
        Ok(jobs)
    }

    async fn run_round(
        &self,
        jobs: Vec<Job>,
        worker: &Arc<Worker>,
        tracker: &Arc<Mutex<Tracker>>,
        stats: &Arc<DownloadStats>,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let mut handles = Vec::new();

        for job in jobs {
            if cancel.is_cancelled() {
                debug!("cancelled; not starting further pages");
                break;
            }
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("cancelled while waiting for a page slot");
                    break;
                }
                permit = Arc::clone(&self.semaphore).acquire_owned() => {
                    permit.map_err(|_| EngineError::SemaphoreClosed)?
                }
            };

            lock(tracker).start(job.page_index);
            let worker = Arc::clone(worker);
            let tracker = Arc::clone(tracker);
            let stats = Arc::clone(stats);
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let mut outcome = worker.run(&job, &cancel).await;

                let mut saved_to = None;
                if let (Some(sink), JobOutcome::Verified { image, .. }) = (&worker.sink, &outcome) {
                    match sink.store(job.page_index, &job.page.label, image).await {
                        Ok(path) => saved_to = Some(path),
                        Err(e) => {
                            warn!(page_index = job.page_index, error = %e, "failed to store page");
                            outcome = JobOutcome::Failed {
                                reason: format!("failed to store page: {e}"),
                                attempts: 0,
                            };
                        }
                    }
                }

                match &outcome {
                    JobOutcome::Verified { .. } => stats.increment_completed(),
                    JobOutcome::Failed { .. } => stats.increment_failed(),
                    JobOutcome::Skipped => {}
                }
                let keep_image = worker.sink.is_none();
                lock(&tracker).finish(&job, outcome, saved_to, keep_image);
            }));
        }

        debug!(task_count = handles.len(), "waiting for pages to complete");
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "page task panicked");
            }
        }
        Ok(())
    }
}
