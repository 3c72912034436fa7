//! Network egress selection with per-path health tracking.
//!
//! # Overview
//!
//! An [`EgressPool`] holds the direct path plus any configured proxies. Each
//! path keeps an [`EgressHealth`] record updated by real requests and by
//! periodic probes. The fetcher asks the pool for a path before every
//! attempt:
//!
//! - the first [`DIRECT_FIRST_ATTEMPTS`] attempts go direct;
//! - later attempts use the best-ranked healthy proxy, or direct when no
//!   proxy is configured.
//!
//! Proxies are ranked by most recent success, then by lower average response
//! time. A proxy is unhealthy after three consecutive failures. When every
//! proxy is unhealthy the pool resets them all and starts over.

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tracing::{debug, info, instrument, warn};

use super::{FetchOptions, HttpClient};
use super::constants::{PROBE_TIMEOUT, UNHEALTHY_FAILURE_THRESHOLD};
use super::error::FetchError;

/// Attempts that always use the direct path before proxies are considered.
pub const DIRECT_FIRST_ATTEMPTS: u32 = 3;

/// One way of reaching a library server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Egress {
    /// Plain request from this host.
    Direct,
    /// Standard HTTP(S) forward proxy.
    HttpProxy(String),
    /// URL-prefix relay: the percent-encoded target URL is appended to the prefix.
    Relay(String),
}

impl Egress {
    /// Returns the URL to request for `target` through this path.
    #[must_use]
    pub fn request_url(&self, target: &str) -> String {
        match self {
            Self::Direct | Self::HttpProxy(_) => target.to_string(),
            Self::Relay(prefix) => format!("{prefix}{}", urlencoding::encode(target)),
        }
    }

    /// Returns `true` for the direct path.
    #[must_use]
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct)
    }
}

impl fmt::Display for Egress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::HttpProxy(url) => write!(f, "proxy:{url}"),
            Self::Relay(prefix) => write!(f, "relay:{prefix}"),
        }
    }
}

impl FromStr for Egress {
    type Err = String;

    /// Parses `direct`, `relay:<prefix>`, `proxy:<url>` or a bare proxy URL.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty egress entry".to_string());
        }
        if s.eq_ignore_ascii_case("direct") {
            return Ok(Self::Direct);
        }
        if let Some(prefix) = s.strip_prefix("relay:") {
            return non_empty(prefix).map(Self::Relay);
        }
        if let Some(url) = s.strip_prefix("proxy:") {
            return non_empty(url).map(Self::HttpProxy);
        }
        Ok(Self::HttpProxy(s.to_string()))
    }
}

fn non_empty(value: &str) -> Result<String, String> {
    if value.is_empty() {
        Err("egress address is empty".to_string())
    } else {
        Ok(value.to_string())
    }
}

/// Health statistics for one egress path.
#[derive(Debug, Clone)]
pub struct EgressHealth {
    pub last_success: Option<Instant>,
    pub consecutive_failures: u32,
    pub avg_response_time: Option<Duration>,
    pub successes: u64,
    pub failures: u64,
    pub healthy: bool,
}

impl Default for EgressHealth {
    fn default() -> Self {
        Self {
            last_success: None,
            consecutive_failures: 0,
            avg_response_time: None,
            successes: 0,
            failures: 0,
            healthy: true,
        }
    }
}

impl EgressHealth {
    fn record_success(&mut self, elapsed: Duration) {
        self.last_success = Some(Instant::now());
        self.avg_response_time = Some(match self.avg_response_time {
            Some(avg) => (avg + elapsed) / 2,
            None => elapsed,
        });
        self.consecutive_failures = 0;
        self.successes += 1;
        self.healthy = true;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.failures += 1;
        self.healthy = self.consecutive_failures < UNHEALTHY_FAILURE_THRESHOLD;
    }
}

/// Snapshot row returned by [`EgressPool::snapshot`].
#[derive(Debug, Clone)]
pub struct EgressStatus {
    pub egress: Egress,
    pub health: EgressHealth,
}

/// A selected path: where to send the next attempt.
#[derive(Debug, Clone)]
pub struct EgressHandle {
    index: usize,
    egress: Egress,
    client: HttpClient,
}

impl EgressHandle {
    /// The selected path.
    #[must_use]
    pub fn egress(&self) -> &Egress {
        &self.egress
    }

    /// Fetches `target` through this path.
    ///
    /// # Errors
    ///
    /// Propagates [`FetchError`] from the underlying client.
    pub async fn get_bytes(&self, target: &str) -> Result<Vec<u8>, FetchError> {
        self.client.get_bytes(&self.egress.request_url(target)).await
    }
}

#[derive(Debug)]
struct Entry {
    egress: Egress,
    client: HttpClient,
    health: EgressHealth,
}

/// Shared set of egress paths with health tracking.
///
/// The direct path is always entry 0.
#[derive(Debug)]
pub struct EgressPool {
    entries: Mutex<Vec<Entry>>,
}

impl EgressPool {
    /// Creates a pool containing only the direct path.
    #[must_use]
    pub fn direct(client: HttpClient) -> Self {
        Self {
            entries: Mutex::new(vec![Entry {
                egress: Egress::Direct,
                client,
                health: EgressHealth::default(),
            }]),
        }
    }

    /// Creates a pool with the direct path plus `proxies`.
    ///
    /// Relays share the direct client; HTTP proxies get their own client.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Proxy`] if an HTTP proxy address is invalid.
    pub fn with_proxies(
        direct: HttpClient,
        proxies: &[Egress],
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, FetchError> {
        let mut entries = vec![Entry {
            egress: Egress::Direct,
            client: direct.clone(),
            health: EgressHealth::default(),
        }];
        for egress in proxies.iter().filter(|e| !e.is_direct()) {
            let client = match egress {
                Egress::HttpProxy(url) => {
                    HttpClient::with_proxy(url, connect_timeout, request_timeout)?
                }
                Egress::Relay(_) | Egress::Direct => direct.clone(),
            };
            entries.push(Entry {
                egress: egress.clone(),
                client,
                health: EgressHealth::default(),
            });
        }
        debug!(paths = entries.len(), "egress pool created");
        Ok(Self {
            entries: Mutex::new(entries),
        })
    }

    /// Creates the pool described by `options` (timeouts and proxy list).
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Proxy`] if an HTTP proxy address is invalid.
    pub fn from_options(options: &FetchOptions) -> Result<Self, FetchError> {
        let direct = HttpClient::new_with_timeouts(options.connect_timeout, options.request_timeout);
        Self::with_proxies(
            direct,
            &options.proxies,
            options.connect_timeout,
            options.request_timeout,
        )
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Client of the direct path.
    #[must_use]
    pub fn direct_client(&self) -> HttpClient {
        self.lock()
            .first()
            .map_or_else(HttpClient::new, |entry| entry.client.clone())
    }

    /// Number of configured proxies (excluding the direct path).
    #[must_use]
    pub fn proxy_count(&self) -> usize {
        self.lock().len().saturating_sub(1)
    }

    /// Chooses the path for attempt number `attempt` (1-indexed).
    #[must_use]
    pub fn select(&self, attempt: u32) -> EgressHandle {
        let mut entries = self.lock();
        let index = if attempt <= DIRECT_FIRST_ATTEMPTS || entries.len() == 1 {
            0
        } else {
            best_proxy_index(&mut entries)
        };
        let entry = &entries[index];
        EgressHandle {
            index,
            egress: entry.egress.clone(),
            client: entry.client.clone(),
        }
    }

    /// Records a successful request through `handle`.
    pub fn record_success(&self, handle: &EgressHandle, elapsed: Duration) {
        if let Some(entry) = self.lock().get_mut(handle.index) {
            entry.health.record_success(elapsed);
        }
    }

    /// Records a failed request through `handle`.
    pub fn record_failure(&self, handle: &EgressHandle) {
        if let Some(entry) = self.lock().get_mut(handle.index) {
            entry.health.record_failure();
            if !entry.health.healthy {
                warn!(egress = %entry.egress, failures = entry.health.consecutive_failures, "egress marked unhealthy");
            }
        }
    }

    /// Probes every path concurrently with a GET of `probe_url`.
    ///
    /// Returns the number of paths that answered with a 2xx.
    #[instrument(skip(self), fields(probe_url = %probe_url))]
    pub async fn probe_all(&self, probe_url: &str) -> usize {
        let handles: Vec<EgressHandle> = {
            let entries = self.lock();
            entries
                .iter()
                .enumerate()
                .map(|(index, entry)| EgressHandle {
                    index,
                    egress: entry.egress.clone(),
                    client: entry.client.clone(),
                })
                .collect()
        };

        let results = join_all(handles.iter().map(|handle| async move {
            let started = Instant::now();
            let reachable = match tokio::time::timeout(PROBE_TIMEOUT, handle.get_bytes(probe_url)).await {
                Ok(Ok(_)) => true,
                Ok(Err(error)) => !blames_egress(&error),
                Err(_) => false,
            };
            (handle, reachable.then(|| started.elapsed()))
        }))
        .await;

        let mut healthy = 0;
        for (handle, elapsed) in results {
            match elapsed {
                Some(elapsed) => {
                    healthy += 1;
                    self.record_success(handle, elapsed);
                }
                None => self.record_failure(handle),
            }
        }
        info!(healthy, total = handles.len(), "egress probe round complete");
        healthy
    }

    /// Returns all paths, proxies in rank order after the direct path.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EgressStatus> {
        let entries = self.lock();
        let mut order: Vec<usize> = (1..entries.len()).collect();
        order.sort_by(|a, b| rank_cmp(&entries[*a].health, &entries[*b].health));
        std::iter::once(0)
            .chain(order)
            .map(|i| EgressStatus {
                egress: entries[i].egress.clone(),
                health: entries[i].health.clone(),
            })
            .collect()
    }
}

/// Returns `true` if `error` says something about the path rather than the resource.
///
/// A 404 from the library means the path works; a timeout, a relay error page
/// or a 5xx does not.
#[must_use]
pub fn blames_egress(error: &FetchError) -> bool {
    match error {
        FetchError::HttpStatus { status, .. } => {
            *status >= 500 || matches!(status, 403 | 407 | 429)
        }
        FetchError::Network { .. }
        | FetchError::Timeout { .. }
        | FetchError::TooSmall { .. }
        | FetchError::NotAnImage { .. }
        | FetchError::Proxy { .. } => true,
        FetchError::InvalidUrl { .. } | FetchError::Cancelled { .. } => false,
    }
}

/// Probe target for `url`: the root of its origin.
#[must_use]
pub fn probe_url_for(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let port = parsed.port().map(|p| format!(":{p}")).unwrap_or_default();
    Some(format!("{}://{host}{port}/", parsed.scheme()))
}

fn rank_cmp(a: &EgressHealth, b: &EgressHealth) -> std::cmp::Ordering {
    b.healthy
        .cmp(&a.healthy)
        .then_with(|| b.last_success.cmp(&a.last_success))
        .then_with(|| {
            a.avg_response_time
                .unwrap_or(Duration::MAX)
                .cmp(&b.avg_response_time.unwrap_or(Duration::MAX))
        })
}

fn best_proxy_index(entries: &mut [Entry]) -> usize {
    let best = (1..entries.len())
        .filter(|i| entries[*i].health.healthy)
        .min_by(|a, b| rank_cmp(&entries[*a].health, &entries[*b].health));
    if let Some(index) = best {
        return index;
    }

    warn!("all proxies unhealthy, resetting health state");
    for entry in entries.iter_mut().skip(1) {
        entry.health.consecutive_failures = 0;
        entry.health.healthy = true;
    }
    1
}
