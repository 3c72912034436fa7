//! Manuscript manifests and the resolver seam.
//!
//! A [`Manifest`] is the ordered list of pages a library exposes for one
//! manuscript. Library-specific adapters implement [`ManifestResolver`];
//! [`JsonManifestResolver`] reads the crate's own JSON shape from a file or
//! URL:
//!
//! ```json
//! {
//!   "title": "Codex example",
//!   "pages": [
//!     "https://lib.example/iiif/f1r/full/max/0/default.jpg",
//!     { "url": "https://lib.example/dz/f1v.dzi", "label": "f. 1v" },
//!     { "url": "https://lib.example/zif/f2r", "kind": "zif" }
//!   ]
//! }
//! ```

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::cache::ManifestCache;
use crate::download::{FetchError, HttpClient};

/// How a page's image is obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    /// A single image URL (plain or IIIF).
    #[default]
    Image,
    /// A Deep Zoom descriptor, or a Deep Zoom base URL to probe.
    DeepZoom,
    /// A Zoomify ZIF container.
    Zif,
}

impl PageKind {
    /// Infers the kind from the URL path suffix.
    #[must_use]
    pub fn infer(url: &str) -> Self {
        let path = url
            .split(['?', '#'])
            .next()
            .unwrap_or(url)
            .to_ascii_lowercase();
        if path.ends_with(".dzi") || path.ends_with(".xml") {
            Self::DeepZoom
        } else if path.ends_with(".zif") {
            Self::Zif
        } else {
            Self::Image
        }
    }
}

impl fmt::Display for PageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Image => "image",
            Self::DeepZoom => "deep_zoom",
            Self::Zif => "zif",
        };
        write!(f, "{label}")
    }
}

/// One page of a manuscript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPage {
    pub url: String,
    pub label: String,
    pub kind: PageKind,
}

impl ManifestPage {
    /// Creates a page whose kind is inferred from `url`.
    #[must_use]
    pub fn new(url: impl Into<String>, label: impl Into<String>) -> Self {
        let url = url.into();
        let kind = PageKind::infer(&url);
        Self {
            url,
            label: label.into(),
            kind,
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: PageKind) -> Self {
        self.kind = kind;
        self
    }
}

/// An ordered list of pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub title: String,
    pub pages: Vec<ManifestPage>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPage {
    Url(String),
    Entry {
        url: String,
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        kind: Option<PageKind>,
    },
}

#[derive(Deserialize)]
struct RawManifest {
    #[serde(default)]
    title: Option<String>,
    pages: Vec<RawPage>,
}

impl Manifest {
    /// Parses the JSON manifest shape. Missing labels become `Page N`;
    /// missing kinds are inferred from the URL.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Parse`] on malformed JSON.
    pub fn from_json(json: &str) -> Result<Self, ResolveError> {
        let raw: RawManifest = serde_json::from_str(json)?;
        let pages = raw
            .pages
            .into_iter()
            .enumerate()
            .map(|(index, page)| {
                let default_label = format!("Page {}", index + 1);
                match page {
                    RawPage::Url(url) => ManifestPage::new(url, default_label),
                    RawPage::Entry { url, label, kind } => {
                        let page = ManifestPage::new(url, label.unwrap_or(default_label));
                        match kind {
                            Some(kind) => page.with_kind(kind),
                            None => page,
                        }
                    }
                }
            })
            .collect();
        Ok(Self {
            title: raw.title.unwrap_or_default(),
            pages,
        })
    }

    /// Checks that the manifest is usable: at least one page, and no page URL
    /// that is empty or carries an unresolved `undefined`/`null`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Invalid`] naming the first problem found.
    pub fn validate(&self) -> Result<(), ResolveError> {
        if self.pages.is_empty() {
            return Err(ResolveError::invalid("manifest has no pages"));
        }
        for (index, page) in self.pages.iter().enumerate() {
            let url = page.url.trim();
            if url.is_empty() {
                return Err(ResolveError::invalid(format!("page {index} has an empty URL")));
            }
            if url.contains("undefined") || url.contains("null") {
                return Err(ResolveError::invalid(format!(
                    "page {index} has an unresolved URL: {url}"
                )));
            }
        }
        Ok(())
    }
}

/// Errors produced while resolving a manifest.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to fetch manifest: {0}")]
    Fetch(#[from] FetchError),

    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed manifest: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid manifest: {reason}")]
    Invalid { reason: String },
}

impl ResolveError {
    #[must_use]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }
}

/// Turns a manuscript URL into its page list.
#[async_trait]
pub trait ManifestResolver: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<Manifest, ResolveError>;
}

/// Reads JSON manifests from `http(s)://` URLs, `file://` URLs or local paths.
#[derive(Debug, Clone, Default)]
pub struct JsonManifestResolver {
    client: HttpClient,
}

impl JsonManifestResolver {
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ManifestResolver for JsonManifestResolver {
    #[instrument(skip(self))]
    async fn resolve(&self, url: &str) -> Result<Manifest, ResolveError> {
        let lower = url.to_ascii_lowercase();
        let json = if lower.starts_with("http://") || lower.starts_with("https://") {
            let bytes = self.client.get_bytes(url).await?;
            String::from_utf8_lossy(&bytes).into_owned()
        } else {
            let path = url.strip_prefix("file://").unwrap_or(url);
            tokio::fs::read_to_string(Path::new(path))
                .await
                .map_err(|source| ResolveError::Io {
                    path: path.to_string(),
                    source,
                })?
        };
        let manifest = Manifest::from_json(&json)?;
        manifest.validate()?;
        debug!(pages = manifest.pages.len(), "manifest resolved");
        Ok(manifest)
    }
}

/// Serves manifests from a [`ManifestCache`], resolving and storing on a miss.
///
/// Cache failures are logged and never fail resolution.
#[derive(Debug)]
pub struct CachedResolver<R> {
    inner: R,
    cache: ManifestCache,
}

impl<R: ManifestResolver> CachedResolver<R> {
    #[must_use]
    pub fn new(inner: R, cache: ManifestCache) -> Self {
        Self { inner, cache }
    }

    #[must_use]
    pub fn cache(&self) -> &ManifestCache {
        &self.cache
    }
}

#[async_trait]
impl<R: ManifestResolver> ManifestResolver for CachedResolver<R> {
    async fn resolve(&self, url: &str) -> Result<Manifest, ResolveError> {
        if let Some(manifest) = self.cache.get(url).await {
            debug!(url, "manifest cache hit");
            return Ok(manifest);
        }
        let manifest = self.inner.resolve(url).await?;
        if let Err(e) = self.cache.put(url, &manifest).await {
            warn!(url, error = %e, "failed to cache manifest");
        }
        Ok(manifest)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_inference() {
        assert_eq!(PageKind::infer("https://x/a.jpg"), PageKind::Image);
        assert_eq!(PageKind::infer("https://x/a.DZI?token=1"), PageKind::DeepZoom);
        assert_eq!(PageKind::infer("https://x/a.xml"), PageKind::DeepZoom);
        assert_eq!(PageKind::infer("https://x/a.zif#frag"), PageKind::Zif);
        assert_eq!(PageKind::infer("https://x/iiif/p/full/max/0/default.jpg"), PageKind::Image);
    }

    #[test]
    fn test_from_json_mixed_entries() {
        let json = r#"{
            "title": "Codex",
            "pages": [
                "https://x/p1.jpg",
                {"url": "https://x/p2.dzi", "label": "f. 1v"},
                {"url": "https://x/p3", "kind": "zif"}
            ]
        }"#;
        let manifest = Manifest::from_json(json).unwrap();
        assert_eq!(manifest.title, "Codex");
        assert_eq!(manifest.pages.len(), 3);
        assert_eq!(manifest.pages[0].label, "Page 1");
        assert_eq!(manifest.pages[0].kind, PageKind::Image);
        assert_eq!(manifest.pages[1].label, "f. 1v");
        assert_eq!(manifest.pages[1].kind, PageKind::DeepZoom);
        assert_eq!(manifest.pages[2].kind, PageKind::Zif);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            Manifest::from_json("not json"),
            Err(ResolveError::Parse(_))
        ));
    }

    #[test]
    fn test_validate() {
        let ok = Manifest {
            title: String::new(),
            pages: vec![ManifestPage::new("https://x/p1.jpg", "1")],
        };
        assert!(ok.validate().is_ok());

        let empty = Manifest {
            title: String::new(),
            pages: vec![],
        };
        assert!(matches!(empty.validate(), Err(ResolveError::Invalid { .. })));

        let unresolved = Manifest {
            title: String::new(),
            pages: vec![ManifestPage::new("https://x/undefined/p1.jpg", "1")],
        };
        assert!(unresolved.validate().is_err());
    }

    #[tokio::test]
    async fn test_json_resolver_reads_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        std::fs::write(&path, r#"{"pages": ["https://x/p1.jpg"]}"#).unwrap();

        let resolver = JsonManifestResolver::default();
        let manifest = resolver.resolve(path.to_str().unwrap()).await.unwrap();
        assert_eq!(manifest.pages.len(), 1);
        assert_eq!(manifest.title, "");
    }

    #[tokio::test]
    async fn test_json_resolver_missing_file() {
        let resolver = JsonManifestResolver::default();
        let result = resolver.resolve("/nonexistent/dir/m.json").await;
        assert!(matches!(result, Err(ResolveError::Io { .. })));
    }
}
