//! Fetch configuration.

use std::time::Duration;

use thiserror::Error;

use super::Egress;
use super::constants::{CONNECT_TIMEOUT_SECS, DEFAULT_PAGE_VERIFICATION_SIZE, REQUEST_TIMEOUT_SECS};
use super::retry::{DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES, DEFAULT_MIN_DELAY, RetryPolicy};

/// Default consecutive failures before dropping to a smaller IIIF size.
pub const DEFAULT_QUALITY_FALLBACK_THRESHOLD: u32 = 2;

/// Default attempts between proxy probe rounds.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: u32 = 5;

/// Invalid fetch configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_retries must be at least 1")]
    ZeroRetries,

    #[error("min_delay ({min_ms} ms) exceeds max_delay ({max_ms} ms)")]
    DelayBoundsInverted { min_ms: u128, max_ms: u128 },

    #[error("{field} must be at least 1")]
    ZeroValue { field: &'static str },
}

/// Options controlling how one page is fetched.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Total attempts per page, including the first.
    pub max_retries: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Drop to smaller IIIF sizes after repeated failures.
    pub max_quality_fallbacks: bool,
    pub quality_fallback_threshold: u32,
    /// Probe all egress paths before the first attempt and periodically after.
    pub proxy_health_check: bool,
    pub health_check_interval: u32,
    pub proxies: Vec<Egress>,
    /// Keep the retry queue in the state database so it survives restarts.
    pub persistent_queue: bool,
    /// Minimum body size for a page to count as verified.
    pub page_verification_size: usize,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_quality_fallbacks: true,
            quality_fallback_threshold: DEFAULT_QUALITY_FALLBACK_THRESHOLD,
            proxy_health_check: false,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            proxies: Vec::new(),
            persistent_queue: false,
            page_verification_size: DEFAULT_PAGE_VERIFICATION_SIZE,
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
        }
    }
}

impl FetchOptions {
    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::ZeroRetries);
        }
        if self.min_delay > self.max_delay {
            return Err(ConfigError::DelayBoundsInverted {
                min_ms: self.min_delay.as_millis(),
                max_ms: self.max_delay.as_millis(),
            });
        }
        if self.quality_fallback_threshold == 0 {
            return Err(ConfigError::ZeroValue {
                field: "quality_fallback_threshold",
            });
        }
        if self.health_check_interval == 0 {
            return Err(ConfigError::ZeroValue {
                field: "health_check_interval",
            });
        }
        Ok(())
    }

    /// Builds the retry policy these options describe.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.min_delay, self.max_delay)
    }
}
