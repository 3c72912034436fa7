//! IIIF size fallback ladder.
//!
//! IIIF Image API URLs carry the requested size as the segment after
//! `/full/`. When a server keeps failing at the largest size, asking for a
//! smaller rendition often succeeds. [`QualityLadder`] yields those variants
//! from largest to smallest.

use std::sync::LazyLock;

use regex::Regex;

/// Size segments, largest first. Index 0 is the highest quality.
pub const SIZE_LADDER: &[&str] = &["max", "full", "4096,", "2048,", "1024,", "512,", "256,"];

#[allow(clippy::expect_used)]
static IIIF_SIZE_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/full/([^/]+)/").expect("static IIIF size regex is valid"));

/// Size variants of one IIIF image URL.
#[derive(Debug, Clone)]
pub struct QualityLadder {
    url: String,
    /// Rung of the ladder the original URL asked for.
    start: usize,
}

impl QualityLadder {
    /// Builds a ladder for `url`, or `None` if it has no `/full/<size>/` segment.
    ///
    /// A URL already asking for a size below the top starts at that rung (or
    /// at the first rung not larger than it, for sizes not on the ladder).
    #[must_use]
    pub fn for_url(url: &str) -> Option<Self> {
        let captures = IIIF_SIZE_SEGMENT.captures(url)?;
        let size = captures.get(1)?.as_str();
        let start = SIZE_LADDER
            .iter()
            .position(|rung| *rung == size)
            .or_else(|| first_rung_not_larger(size))
            .unwrap_or(0);
        Some(Self {
            url: url.to_string(),
            start,
        })
    }

    /// Number of levels available at or below the starting size.
    #[must_use]
    pub fn len(&self) -> usize {
        SIZE_LADDER.len() - self.start
    }

    /// Returns `true` if the ladder has no levels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the URL for `level` (0 = original request). Levels beyond the
    /// ladder clamp to the smallest size.
    #[must_use]
    pub fn url_for(&self, level: usize) -> String {
        if level == 0 {
            return self.url.clone();
        }
        let rung = (self.start + level).min(SIZE_LADDER.len() - 1);
        let replacement = format!("/full/{}/", SIZE_LADDER[rung]);
        IIIF_SIZE_SEGMENT
            .replace(&self.url, replacement.as_str())
            .into_owned()
    }

    /// Returns `true` if a level below `level` exists.
    #[must_use]
    pub fn can_degrade(&self, level: usize) -> bool {
        level + 1 < self.len()
    }
}

/// Maps a `w,` size segment that is not on the ladder to the next rung at or
/// below it.
fn first_rung_not_larger(size: &str) -> Option<usize> {
    let width: u32 = size.strip_suffix(',')?.parse().ok()?;
    SIZE_LADDER.iter().position(|rung| {
        rung.strip_suffix(',')
            .and_then(|w| w.parse::<u32>().ok())
            .is_some_and(|w| w <= width)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const URL: &str = "https://iiif.example.org/iiif/2/ms1%2Ff001r/full/max/0/default.jpg";

    #[test]
    fn test_non_iiif_url_has_no_ladder() {
        assert!(QualityLadder::for_url("https://example.org/pages/1.jpg").is_none());
    }

    #[test]
    fn test_level_zero_is_original_url() {
        let ladder = QualityLadder::for_url(URL).unwrap();
        assert_eq!(ladder.url_for(0), URL);
    }

    #[test]
    fn test_degrades_in_order() {
        let ladder = QualityLadder::for_url(URL).unwrap();
        assert!(ladder.url_for(1).contains("/full/full/"));
        assert!(ladder.url_for(2).contains("/full/4096,/"));
        assert!(ladder.url_for(6).contains("/full/256,/"));
        assert!(ladder.url_for(99).contains("/full/256,/"));
    }

    #[test]
    fn test_starts_at_requested_rung() {
        let url = "https://iiif.example.org/iiif/2/p/full/2048,/0/default.jpg";
        let ladder = QualityLadder::for_url(url).unwrap();
        assert_eq!(ladder.len(), 4);
        assert!(ladder.url_for(1).contains("/full/1024,/"));
    }

    #[test]
    fn test_off_ladder_width_maps_down() {
        let url = "https://iiif.example.org/iiif/2/p/full/3000,/0/default.jpg";
        let ladder = QualityLadder::for_url(url).unwrap();
        assert!(ladder.url_for(1).contains("/full/1024,/"));
    }

    #[test]
    fn test_can_degrade_stops_at_bottom() {
        let ladder = QualityLadder::for_url(URL).unwrap();
        assert!(ladder.can_degrade(0));
        assert!(ladder.can_degrade(5));
        assert!(!ladder.can_degrade(6));
    }
}
