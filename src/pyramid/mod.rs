//! Tile pyramids: descriptors, tile sources and the compositor.
//!
//! # Overview
//!
//! - [`PyramidMetadata`] - Level geometry and tile addressing
//! - [`parse_dzi`] - Deep Zoom XML descriptors
//! - [`ZifContainer`] - Zoomify containers (TIFF/BigTIFF, little-endian)
//! - [`probe_deep_zoom_layout`] - Grid discovery when no descriptor exists
//! - [`TileSource`] - Seam the compositor pulls tile bytes through
//! - [`Compositor`] - Stitches one level into an encoded page
//!
//! # Example
//!
//! ```ignore
//! use mss_core::pyramid::{Compositor, HttpTileSource, parse_dzi};
//!
//! let meta = parse_dzi(&xml, "https://lib.example/dz/page1.dzi")?;
//! let source = HttpTileSource::new(fetcher, cancel);
//! let page = Compositor::default().composite(&meta, meta.max_level, &source).await?;
//! std::fs::write("page1.jpg", &page.bytes)?;
//! ```

mod compositor;
mod dzi;
mod error;
mod metadata;
mod probe;
mod source;
mod zif;

pub use compositor::{
    CompositeOutcome, Compositor, DEFAULT_MAX_CANVAS_DIMENSION, DEFAULT_TILE_CONCURRENCY,
    JPEG_QUALITY,
};
pub use dzi::{dzi_base_url, parse_dzi};
pub use error::{CompositeError, DescriptorError, TileFetchError};
pub use metadata::{
    DEFAULT_OVERLAP, DEFAULT_TILE_FORMAT, DEFAULT_TILE_SIZE, PyramidMetadata, TileDescriptor,
    TileLayout, max_level_for,
};
pub use probe::{MAX_PROBE_INDEX, MAX_PROBE_LEVEL, probe_deep_zoom_layout};
pub use source::{HttpTileSource, TileSource};
pub use zif::ZifContainer;

#[cfg(test)]
pub(crate) use compositor::test_support::solid_png;
#[cfg(test)]
pub(crate) use zif::test_support::classic_zif;
