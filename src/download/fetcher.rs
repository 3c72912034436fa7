//! Bounded-retry page fetcher.
//!
//! # Overview
//!
//! [`PageFetcher::fetch`] turns one page URL into either a verified image or
//! a [`FetchFailure`]. Each attempt:
//!
//! 1. optionally runs a proxy probe round (first attempt, then every
//!    `health_check_interval` attempts);
//! 2. picks an egress path from the shared [`EgressPool`];
//! 3. requests the page at the current IIIF size;
//! 4. verifies the body (size threshold, image signature).
//!
//! Failures sleep a jittered delay in `[min_delay, max_delay]` (or the
//! server's Retry-After) and try again, at most `max_retries` attempts in
//! total. After `quality_fallback_threshold` consecutive failures the next
//! attempt asks for a smaller IIIF rendition. A page that runs out of
//! attempts is recorded in the [`RetryQueue`]; a verified page is removed
//! from it.
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
//!     FetchOutcome::Fetched(image) => println!("{} bytes", image.bytes.len()),
//!     FetchOutcome::Failed(failure) => println!("gave up: {}", failure.last_error),
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::options::{ConfigError, FetchOptions};
use super::proxy::{Egress, EgressPool, blames_egress, probe_url_for};
use super::quality::QualityLadder;
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error, parse_retry_after};
use super::verify::{PageFormat, verify_page_body};
use super::FetchError;
use crate::queue::{DownloadTask, RetryQueue, now_millis};

/// A verified page image.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub page_index: usize,
    /// URL as requested by the caller.
    pub url: String,
    /// URL that produced the image (differs after a quality fallback).
    pub fetched_url: String,
    pub bytes: Vec<u8>,
    pub format: PageFormat,
    /// Attempts made by this call.
    pub attempts: u32,
    pub quality_level: usize,
    pub egress: Egress,
}

/// A page that could not be fetched within the attempt budget.
#[derive(Debug)]
pub struct FetchFailure {
    pub page_index: usize,
    pub url: String,
    /// Attempts made by this call.
    pub attempts: u32,
    pub last_error: FetchError,
}

/// Result of [`PageFetcher::fetch`].
#[derive(Debug)]
pub enum FetchOutcome {
    Fetched(FetchedImage),
    Failed(FetchFailure),
}

impl FetchOutcome {
    /// Returns `true` for [`FetchOutcome::Fetched`].
    #[must_use]
    pub fn is_fetched(&self) -> bool {
        matches!(self, Self::Fetched(_))
    }
}

/// Per-call attempt bookkeeping.
struct AttemptState {
    ladder: Option<QualityLadder>,
    quality_level: usize,
    consecutive_failures: u32,
}

impl AttemptState {
    fn current_url(&self, url: &str) -> String {
        self.ladder
            .as_ref()
            .map_or_else(|| url.to_string(), |ladder| ladder.url_for(self.quality_level))
    }
}

/// Fetches pages with bounded retries, quality fallback and egress selection.
///
/// Cloning is cheap: the egress pool and retry queue are shared.
#[derive(Debug, Clone)]
pub struct PageFetcher {
    options: Arc<FetchOptions>,
    policy: RetryPolicy,
    egress: Arc<EgressPool>,
    queue: RetryQueue,
}

impl PageFetcher {
    /// Creates a fetcher.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `options` are inconsistent.
    pub fn new(
        options: FetchOptions,
        egress: Arc<EgressPool>,
        queue: RetryQueue,
    ) -> Result<Self, ConfigError> {
        options.validate()?;
        let policy = options.retry_policy();
        Ok(Self {
            options: Arc::new(options),
            policy,
            egress,
            queue,
        })
    }

    #[must_use]
    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    #[must_use]
    pub fn queue(&self) -> &RetryQueue {
        &self.queue
    }

    #[must_use]
    pub fn egress(&self) -> &Arc<EgressPool> {
        &self.egress
    }

    /// Fetches and verifies one page image.
    pub async fn fetch(&self, url: &str, page_index: usize) -> FetchOutcome {
        self.fetch_with_cancel(url, page_index, &CancellationToken::new())
            .await
    }

    /// Like [`Self::fetch`], but stops before the next attempt once `cancel` fires.
    ///
    /// A request already in flight is allowed to finish.
    pub async fn fetch_with_cancel(
        &self,
        url: &str,
        page_index: usize,
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        self.run(url, page_index, None, cancel).await
    }

    /// Re-attempts a queued task, continuing its attempt count and quality level.
    pub async fn retry_task(&self, task: &DownloadTask, cancel: &CancellationToken) -> FetchOutcome {
        self.run(&task.source_url, task.page_index, Some(task), cancel)
            .await
    }

    #[instrument(skip(self, prior, cancel), fields(url = %url))]
    async fn run(
        &self,
        url: &str,
        page_index: usize,
        prior: Option<&DownloadTask>,
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        let ladder = if self.options.max_quality_fallbacks {
            QualityLadder::for_url(url)
        } else {
            None
        };
        let quality_level = match (&ladder, prior) {
            (Some(ladder), Some(task)) => task.quality_level.min(ladder.len().saturating_sub(1)),
            _ => 0,
        };
        let mut state = AttemptState {
            ladder,
            quality_level,
            consecutive_failures: 0,
        };
        let prior_attempts = prior.map_or(0, |task| task.attempt_count);

        let mut attempt = 0u32;
        let mut last_error: Option<FetchError> = None;
        let mut last_egress: Option<Egress> = None;

        while attempt < self.policy.max_attempts() {
            if cancel.is_cancelled() {
                debug!(attempt, "cancelled before next attempt");
                break;
            }
            attempt += 1;
            self.maybe_probe(url, attempt).await;

            let handle = self.egress.select(attempt);
            let current_url = state.current_url(url);
            let started = Instant::now();

            let result = match handle.get_bytes(&current_url).await {
                Ok(bytes) => verify_page_body(&current_url, &bytes, self.options.page_verification_size)
                    .map(|format| (bytes, format)),
                Err(error) => Err(error),
            };

            match result {
                Ok((bytes, format)) => {
                    self.egress.record_success(&handle, started.elapsed());
                    if let Err(e) = self.queue.remove(url, page_index).await {
                        warn!(error = %e, "failed to remove verified page from retry queue");
                    }
                    info!(
                        attempt,
                        quality_level = state.quality_level,
                        egress = %handle.egress(),
                        bytes = bytes.len(),
                        format = %format,
                        "page verified"
                    );
                    return FetchOutcome::Fetched(FetchedImage {
                        page_index,
                        url: url.to_string(),
                        fetched_url: current_url,
                        bytes,
                        format,
                        attempts: attempt,
                        quality_level: state.quality_level,
                        egress: handle.egress().clone(),
                    });
                }
                Err(error) => {
                    if blames_egress(&error) {
                        self.egress.record_failure(&handle);
                    }
                    last_egress = Some(handle.egress().clone());

                    let failure_type = self.after_failure(&mut state, &error, attempt);
                    match self.policy.should_retry(failure_type, attempt) {
                        RetryDecision::Retry {
                            delay: backoff_delay,
                            attempt: next_attempt,
                        } => {
                            let retry_after_delay = error.retry_after().and_then(parse_retry_after);
                            let delay = retry_after_delay.unwrap_or(backoff_delay);
                            info!(
                                attempt = next_attempt,
                                max_attempts = self.policy.max_attempts(),
                                delay_ms = delay.as_millis(),
                                using_retry_after = retry_after_delay.is_some(),
                                error = %error,
                                "retrying page"
                            );
                            last_error = Some(error);
                            tokio::select! {
                                () = cancel.cancelled() => {
                                    debug!("cancelled during backoff");
                                    break;
                                }
                                () = tokio::time::sleep(delay) => {}
                            }
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            debug!(%reason, error = %error, "not retrying page");
                            last_error = Some(error);
                            break;
                        }
                    }
                }
            }
        }

        let last_error = last_error.unwrap_or_else(|| FetchError::cancelled(url));
        if attempt > 0 {
            let task = DownloadTask {
                page_index,
                source_url: url.to_string(),
                attempt_count: prior_attempts.saturating_add(attempt),
                last_attempt_at: now_millis(),
                last_error: Some(last_error.to_string()),
                quality_level: state.quality_level,
                egress: last_egress.map(|e| e.to_string()),
            };
            if let Err(e) = self.queue.enqueue(task).await {
                warn!(error = %e, "failed to record page in retry queue");
            }
        }
        warn!(attempts = attempt, error = %last_error, "page fetch failed");

        FetchOutcome::Failed(FetchFailure {
            page_index,
            url: url.to_string(),
            attempts: attempt,
            last_error,
        })
    }

    /// Updates quality fallback state after a failed attempt and returns the
    /// failure type to retry on.
    fn after_failure(&self, state: &mut AttemptState, error: &FetchError, attempt: u32) -> FailureType {
        state.consecutive_failures += 1;
        let failure_type = classify_error(error);

        let Some(ladder) = &state.ladder else {
            return failure_type;
        };
        // Some servers reject sizes they cannot render with a 4xx.
        let size_rejected =
            failure_type == FailureType::Permanent && matches!(error, FetchError::HttpStatus { .. });
        let threshold_reached =
            state.consecutive_failures >= self.options.quality_fallback_threshold;

        if (threshold_reached || size_rejected) && ladder.can_degrade(state.quality_level) {
            state.quality_level += 1;
            state.consecutive_failures = 0;
            info!(
                attempt,
                quality_level = state.quality_level,
                "dropping to smaller image size"
            );
            if size_rejected {
                return FailureType::Transient;
            }
        }
        failure_type
    }

    async fn maybe_probe(&self, url: &str, attempt: u32) {
        if !self.options.proxy_health_check
            || (attempt - 1) % self.options.health_check_interval != 0
        {
            return;
        }
        if let Some(probe_url) = probe_url_for(url) {
            self.egress.probe_all(&probe_url).await;
        }
    }

    /// Fetches a non-image body (descriptor, container) with the same retry
    /// budget and egress selection, but without image verification or queueing.
    ///
    /// # Errors
    ///
    /// Returns the last [`FetchError`] once attempts are exhausted, a
    /// permanent failure occurs, or `cancel` fires.
    #[instrument(skip(self, cancel), fields(url = %url))]
    pub async fn fetch_body(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::cancelled(url));
            }
            attempt += 1;
            self.maybe_probe(url, attempt).await;

            let handle = self.egress.select(attempt);
            let started = Instant::now();
            let error = match handle.get_bytes(url).await {
                Ok(bytes) => {
                    self.egress.record_success(&handle, started.elapsed());
                    return Ok(bytes);
                }
                Err(error) => error,
            };
            if blames_egress(&error) {
                self.egress.record_failure(&handle);
            }

            match self.policy.should_retry(classify_error(&error), attempt) {
                RetryDecision::Retry { delay, .. } => {
                    let delay = error
                        .retry_after()
                        .and_then(parse_retry_after)
                        .unwrap_or(delay);
                    debug!(attempt, delay_ms = delay.as_millis(), error = %error, "retrying body fetch");
                    tokio::select! {
                        () = cancel.cancelled() => return Err(error),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::DoNotRetry { .. } => return Err(error),
            }
        }
    }
}
