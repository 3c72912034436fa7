//! Error types for the download module.
//!
//! A [`FetchError`] describes why one attempt at one URL did not yield a
//! verified image. The fetcher classifies it with
//! [`classify_error`](super::classify_error) to decide whether to try again.

use thiserror::Error;

/// Errors that can occur during a single fetch attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before the body was fully received.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Non-2xx HTTP response.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present.
        retry_after: Option<String>,
    },

    /// 2xx response whose body is shorter than the verification threshold.
    ///
    /// Servers commonly answer with a small HTML error page and status 200.
    #[error("response from {url} too small: {actual_bytes} bytes (minimum {minimum_bytes})")]
    TooSmall {
        /// The URL that returned the short body.
        url: String,
        /// Received body length.
        actual_bytes: usize,
        /// Configured minimum.
        minimum_bytes: usize,
    },

    /// 2xx response whose leading bytes match no known image format.
    #[error("response from {url} is not an image ({content_hint})")]
    NotAnImage {
        /// The URL that returned the body.
        url: String,
        /// Short printable prefix or content type, for diagnostics.
        content_hint: String,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// A proxy could not be configured.
    #[error("invalid proxy {proxy}: {source}")]
    Proxy {
        /// Proxy address as configured.
        proxy: String,
        /// The underlying builder error.
        #[source]
        source: reqwest::Error,
    },

    /// The batch was cancelled before this attempt could run.
    #[error("fetch of {url} cancelled")]
    Cancelled {
        /// The URL whose fetch was abandoned.
        url: String,
    },
}

impl FetchError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a too-small body error.
    pub fn too_small(url: impl Into<String>, actual_bytes: usize, minimum_bytes: usize) -> Self {
        Self::TooSmall {
            url: url.into(),
            actual_bytes,
            minimum_bytes,
        }
    }

    /// Creates a not-an-image error.
    pub fn not_an_image(url: impl Into<String>, content_hint: impl Into<String>) -> Self {
        Self::NotAnImage {
            url: url.into(),
            content_hint: content_hint.into(),
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a proxy configuration error.
    pub fn proxy(proxy: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Proxy {
            proxy: proxy.into(),
            source,
        }
    }

    /// Creates a cancellation marker.
    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    /// Returns the server-provided Retry-After value, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<&str> {
        match self {
            Self::HttpStatus { retry_after, .. } => retry_after.as_deref(),
            _ => None,
        }
    }

    /// Returns `true` for suspicious 2xx responses (short body or wrong signature).
    #[must_use]
    pub fn is_verification_failure(&self) -> bool {
        matches!(self, Self::TooSmall { .. } | Self::NotAnImage { .. })
    }
}
