//! Retry logic with jittered exponential backoff for page fetches.
//!
//! This module provides the [`RetryPolicy`] and [`FailureType`] types for
//! classifying fetch errors and determining retry behavior.
//!
//! # Overview
//!
//! When an attempt fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - Temporary failures that may succeed on retry
//! - [`FailureType::Permanent`] - Failures that won't succeed regardless of retries
//! - [`FailureType::RateLimited`] - Server rate limiting (retries, honoring Retry-After)
//!
//! The [`RetryPolicy`] then determines whether to retry based on failure type
//! and attempt count. Every delay it produces lies in `[min_delay, max_delay]`.
//!
//! # Example
//!
//! ```
//! use mss_core::download::{FetchError, RetryPolicy, RetryDecision, classify_error};
//!
//! let policy = RetryPolicy::default();
//! let error = FetchError::http_status("https://example.com/iiif/p1/full/max/0/default.jpg", 503);
//!
//! match policy.should_retry(classify_error(&error), 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use super::FetchError;
use super::constants::MAX_RETRY_AFTER;

/// Default number of attempts per page (including the first).
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default lower bound for the delay between attempts.
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(1000);

/// Default upper bound for the delay between attempts.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(5000);

const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Classification of fetch failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network timeout, 5xx server errors, HTML error page with status 200.
    Transient,

    /// Permanent failure that won't succeed regardless of retries.
    ///
    /// Examples: 404 Not Found, 400 Bad Request, invalid URL.
    Permanent,

    /// Server rate limiting (HTTP 429).
    RateLimited,
}

/// Decision on whether to retry a failed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior.
///
/// # Delay Calculation
///
/// ```text
/// raw   = min(min_delay * multiplier^(attempt-1), max_delay)
/// delay = clamp(raw * uniform(0.5, 1.0), min_delay, max_delay)
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,
    min_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy.
    ///
    /// `max_attempts` is raised to 1 and `max_delay` to `min_delay` when smaller;
    /// callers that need those cases rejected validate beforehand.
    #[must_use]
    pub fn new(max_attempts: u32, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_delay,
            max_delay: max_delay.max(min_delay),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    /// Creates a policy with a custom `max_attempts`, using defaults for other settings.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the delay bounds as `(min, max)`.
    #[must_use]
    pub fn delay_bounds(&self) -> (Duration, Duration) {
        (self.min_delay, self.max_delay)
    }

    /// Determines whether to retry after attempt number `attempt` (1-indexed) failed.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::cast_sign_loss)]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let min_ms = self.min_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let exponent = f64::from(attempt.saturating_sub(1));
        let raw_ms = (min_ms * self.backoff_multiplier.powf(exponent)).min(max_ms);

        let factor = rand::thread_rng().gen_range(0.5..=1.0);
        let jittered_ms = (raw_ms * factor).clamp(min_ms, max_ms);

        Duration::from_millis(jittered_ms as u64)
    }
}

/// Classifies a fetch error into a failure type for retry decisions.
///
/// # HTTP Status Code Classification
///
/// | Status | Type | Rationale |
/// |--------|------|-----------|
/// | 400 | Permanent | Bad request |
/// | 404 | Permanent | Not found |
/// | 410 | Permanent | Gone |
/// | 429 | RateLimited | Retry with backoff |
/// | 451 | Permanent | Legal block |
/// | other | Transient | Includes 401/403, which libraries use for throttling |
///
/// Verification failures (short body, non-image body) and every transport
/// error are transient.
#[instrument]
pub fn classify_error(error: &FetchError) -> FailureType {
    match error {
        FetchError::HttpStatus { status, .. } => classify_http_status(*status),

        FetchError::Timeout { .. }
        | FetchError::Network { .. }
        | FetchError::TooSmall { .. }
        | FetchError::NotAnImage { .. } => FailureType::Transient,

        FetchError::InvalidUrl { .. } | FetchError::Proxy { .. } | FetchError::Cancelled { .. } => {
            FailureType::Permanent
        }
    }
}

fn classify_http_status(status: u16) -> FailureType {
    match status {
        400 | 404 | 410 | 451 => FailureType::Permanent,
        429 => FailureType::RateLimited,
        _ => FailureType::Transient,
    }
}

/// Parses a Retry-After header value into a delay.
///
/// Accepts integer seconds or an RFC 7231 HTTP-date. Values above one hour are
/// capped. Negative seconds and dates in the past yield `None`.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        return Some(cap_retry_after(duration));
    }

    let datetime = httpdate::parse_http_date(header_value).ok()?;
    let duration = datetime.duration_since(std::time::SystemTime::now()).ok()?;
    Some(cap_retry_after(duration))
}

fn cap_retry_after(duration: Duration) -> Duration {
    if duration > MAX_RETRY_AFTER {
        warn!(
            delay_secs = duration.as_secs(),
            max_secs = MAX_RETRY_AFTER.as_secs(),
            "Retry-After exceeds maximum, capping at 1 hour"
        );
        MAX_RETRY_AFTER
    } else {
        duration
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== RetryPolicy Tests ====================

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(
            policy.delay_bounds(),
            (Duration::from_millis(1000), Duration::from_millis(5000))
        );
    }

    #[test]
    fn test_retry_policy_max_attempts_minimum_is_one() {
        let policy = RetryPolicy::with_max_attempts(0);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_retry_policy_max_delay_raised_to_min() {
        let policy = RetryPolicy::new(3, Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(policy.delay_bounds().1, Duration::from_secs(2));
    }

    // ==================== Delay Calculation Tests ====================

    #[test]
    fn test_delay_always_within_bounds() {
        let policy = RetryPolicy::new(50, Duration::from_millis(100), Duration::from_millis(800));
        for attempt in 1..50 {
            let delay = policy.calculate_delay(attempt);
            assert!(delay >= Duration::from_millis(100), "attempt {attempt}: {delay:?}");
            assert!(delay <= Duration::from_millis(800), "attempt {attempt}: {delay:?}");
        }
    }

    #[test]
    fn test_delay_equal_bounds_is_constant() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10), Duration::from_millis(10));
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(10));
        assert_eq!(policy.calculate_delay(4), Duration::from_millis(10));
    }

    // ==================== should_retry Tests ====================

    #[test]
    fn test_should_retry_transient_before_max() {
        let policy = RetryPolicy::with_max_attempts(3);
        let decision = policy.should_retry(FailureType::Transient, 1);
        assert!(matches!(decision, RetryDecision::Retry { attempt: 2, .. }));
    }

    #[test]
    fn test_should_not_retry_at_max_attempts() {
        let policy = RetryPolicy::with_max_attempts(3);
        let decision = policy.should_retry(FailureType::Transient, 3);
        match decision {
            RetryDecision::DoNotRetry { reason } => assert!(reason.contains("exhausted")),
            RetryDecision::Retry { .. } => panic!("expected DoNotRetry"),
        }
    }

    #[test]
    fn test_should_not_retry_permanent() {
        let policy = RetryPolicy::with_max_attempts(10);
        let decision = policy.should_retry(FailureType::Permanent, 1);
        assert!(matches!(decision, RetryDecision::DoNotRetry { .. }));
    }

    #[test]
    fn test_should_retry_rate_limited() {
        let policy = RetryPolicy::with_max_attempts(3);
        let decision = policy.should_retry(FailureType::RateLimited, 2);
        assert!(matches!(decision, RetryDecision::Retry { attempt: 3, .. }));
    }

    // ==================== classify_error Tests ====================

    #[test]
    fn test_classify_http_statuses() {
        let cases = [
            (400, FailureType::Permanent),
            (401, FailureType::Transient),
            (403, FailureType::Transient),
            (404, FailureType::Permanent),
            (405, FailureType::Transient),
            (408, FailureType::Transient),
            (410, FailureType::Permanent),
            (418, FailureType::Transient),
            (429, FailureType::RateLimited),
            (451, FailureType::Permanent),
            (500, FailureType::Transient),
            (503, FailureType::Transient),
            (599, FailureType::Transient),
        ];
        for (status, expected) in cases {
            let error = FetchError::http_status("https://example.com", status);
            assert_eq!(classify_error(&error), expected, "status {status}");
        }
    }

    #[test]
    fn test_classify_verification_failures_transient() {
        let error = FetchError::too_small("https://example.com", 512, 10240);
        assert_eq!(classify_error(&error), FailureType::Transient);
        let error = FetchError::not_an_image("https://example.com", "<html>");
        assert_eq!(classify_error(&error), FailureType::Transient);
    }

    #[test]
    fn test_classify_timeout_and_invalid_url() {
        assert_eq!(
            classify_error(&FetchError::timeout("https://example.com")),
            FailureType::Transient
        );
        assert_eq!(
            classify_error(&FetchError::invalid_url("not a url")),
            FailureType::Permanent
        );
        assert_eq!(
            classify_error(&FetchError::cancelled("https://example.com")),
            FailureType::Permanent
        );
    }

    #[tokio::test]
    async fn test_classify_network_error_transient_regardless_of_url_text() {
        // Nothing listens on port 1; the URL path mentions ssl and tls.
        let url = "http://127.0.0.1:1/scans/ssl/tls-handshake/page.jpg";
        let source = reqwest::Client::new().get(url).send().await.unwrap_err();
        let error = FetchError::network(url, source);
        assert_eq!(classify_error(&error), FailureType::Transient);
    }

    // ==================== parse_retry_after Tests ====================

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_parse_retry_after_negative_ignored() {
        assert_eq!(parse_retry_after("-1"), None);
    }

    #[test]
    fn test_parse_retry_after_capped() {
        assert_eq!(parse_retry_after("999999"), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_parse_retry_after_past_date_ignored() {
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_parse_retry_after_garbage() {
        assert_eq!(parse_retry_after("soon"), None);
    }
}
