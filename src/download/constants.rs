//! Constants for the download module (timeouts, verification, backoff).

use std::time::Duration;

/// Default HTTP connect timeout (10 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default per-request timeout (30 seconds). Covers the full body read.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Timeout for proxy health probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Default minimum body size for a page image to count as verified (10 KiB).
pub const DEFAULT_PAGE_VERIFICATION_SIZE: usize = 10_240;

/// Consecutive failures before a proxy is marked unhealthy.
pub const UNHEALTHY_FAILURE_THRESHOLD: u32 = 3;
