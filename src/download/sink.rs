//! Page output: file naming and the sink verified pages are handed to.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::engine::PageImage;
use super::verify::PageFormat;

/// Longest label fragment kept in a file name.
const MAX_LABEL_CHARS: usize = 60;

/// Receives each verified page as soon as it is available.
#[async_trait]
pub trait PageSink: Send + Sync + std::fmt::Debug {
    /// Stores one page and returns where it went.
    async fn store(
        &self,
        page_index: usize,
        label: &str,
        image: &PageImage,
    ) -> std::io::Result<PathBuf>;
}

/// Writes pages as `{index:04}_{label}.{ext}` under one directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl PageSink for DirectorySink {
    async fn store(
        &self,
        page_index: usize,
        label: &str,
        image: &PageImage,
    ) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(page_file_name(page_index, label, image.format));
        let partial = path.with_extension("part");
        tokio::fs::write(&partial, &image.bytes).await?;
        tokio::fs::rename(&partial, &path).await?;
        debug!(page_index, path = %path.display(), bytes = image.bytes.len(), "page written");
        Ok(path)
    }
}

/// File name for a page: zero-padded index, sanitized label, format extension.
#[must_use]
pub fn page_file_name(page_index: usize, label: &str, format: PageFormat) -> String {
    let label = sanitize_label(label);
    if label.is_empty() {
        format!("{page_index:04}.{}", format.extension())
    } else {
        format!("{page_index:04}_{label}.{}", format.extension())
    }
}

/// Reduces a page label to characters that are safe in a file name.
///
/// Separators, whitespace and punctuation collapse to a single `_`.
#[must_use]
pub fn sanitize_label(value: &str) -> String {
    let mut out = String::new();
    let mut prev_sep = false;
    for ch in value.chars() {
        let mapped = match ch {
            c if c.is_alphanumeric() || matches!(c, '-' | '.') => c,
            _ => '_',
        };
        if mapped == '_' {
            if !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else {
            out.push(mapped);
            prev_sep = false;
        }
    }
    let trimmed: String = out
        .trim_matches(|c| c == '_' || c == '.')
        .chars()
        .take(MAX_LABEL_CHARS)
        .collect();
    if is_plain_segment(&trimmed) {
        trimmed
    } else {
        trimmed.replace('.', "_")
    }
}

fn is_plain_segment(name: &str) -> bool {
    !Path::new(name)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_page_file_name() {
        assert_eq!(page_file_name(3, "f. 2r", PageFormat::Jpeg), "0003_f._2r.jpg");
        assert_eq!(page_file_name(12, "", PageFormat::Png), "0012.png");
        assert_eq!(page_file_name(0, "Page 1", PageFormat::Tiff), "0000_Page_1.tif");
    }

    #[test]
    fn test_sanitize_label_strips_path_tricks() {
        assert_eq!(sanitize_label("../../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize_label("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_label("  __  "), "");
    }

    #[test]
    fn test_sanitize_label_truncates() {
        let long = "x".repeat(200);
        assert_eq!(sanitize_label(&long).len(), MAX_LABEL_CHARS);
    }

    #[tokio::test]
    async fn test_directory_sink_writes_page() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path().join("out"));
        let image = PageImage {
            bytes: vec![1, 2, 3],
            format: PageFormat::Png,
            fetched_url: "https://x/p.png".to_string(),
            width: None,
            height: None,
        };
        let path = sink.store(7, "f. 4v", &image).await.unwrap();
        assert_eq!(path.file_name().unwrap(), "0007_f._4v.png");
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
        assert!(!path.with_extension("part").exists());
    }
}
