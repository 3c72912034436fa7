//! HTTP client wrapper for fetching page and tile bodies.
//!
//! This module provides the `HttpClient` struct, a thin layer over
//! [`reqwest::Client`] that applies the configured timeouts and maps
//! transport failures onto [`FetchError`].

use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, ClientBuilder, Proxy};
use tracing::{debug, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, REQUEST_TIMEOUT_SECS};
use super::error::FetchError;

/// Identifies the tool to library servers.
fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("mss-downloader/{version} (manuscript-research-tool)")
}

/// HTTP client for fetching whole bodies into memory.
///
/// Created once per egress path and reused, taking advantage of connection
/// pooling. Cloning is cheap.
///
/// # Example
///
/// ```no_run
/// use mss_core::download::HttpClient;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new();
/// let bytes = client.get_bytes("https://example.org/iiif/p1/full/max/0/default.jpg").await?;
/// println!("{} bytes", bytes.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a client with default timeouts (10s connect, 30s per request).
    #[must_use]
    pub fn new() -> Self {
        Self::new_with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        )
    }

    /// Creates a direct client with explicit timeouts.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with a static configuration
    /// (no proxy, no custom TLS). This does not happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new_with_timeouts(connect_timeout: Duration, request_timeout: Duration) -> Self {
        let client = base_client_builder(connect_timeout, request_timeout)
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// Creates a client that routes every request through an HTTP(S) proxy.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Proxy`] if the proxy address is invalid.
    #[instrument(level = "debug", skip(connect_timeout, request_timeout))]
    pub fn with_proxy(
        proxy_url: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, FetchError> {
        let proxy = Proxy::all(proxy_url).map_err(|e| FetchError::proxy(proxy_url, e))?;
        let client = base_client_builder(connect_timeout, request_timeout)
            .proxy(proxy)
            .build()
            .map_err(|e| FetchError::proxy(proxy_url, e))?;
        Ok(Self { client })
    }

    /// Fetches `url` and returns the full body.
    ///
    /// # Errors
    ///
    /// - [`FetchError::InvalidUrl`] if `url` does not parse
    /// - [`FetchError::Timeout`] if the request or body read exceeds the timeout
    /// - [`FetchError::Network`] for other transport failures
    /// - [`FetchError::HttpStatus`] for non-2xx responses (with Retry-After)
    #[instrument(skip(self), fields(url = %url))]
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        Url::parse(url).map_err(|_| FetchError::invalid_url(url))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| map_transport_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(std::string::ToString::to_string);
            return Err(FetchError::http_status_with_retry_after(
                url,
                status.as_u16(),
                retry_after,
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| map_transport_error(url, e))?;

        debug!(bytes = bytes.len(), "body received");
        Ok(bytes.to_vec())
    }

    /// Returns a reference to the inner reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

fn map_transport_error(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::timeout(url)
    } else {
        FetchError::network(url, error)
    }
}

fn base_client_builder(connect_timeout: Duration, request_timeout: Duration) -> ClientBuilder {
    Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(request_timeout)
        .gzip(true)
        .cookie_store(true)
        .user_agent(default_user_agent())
}
