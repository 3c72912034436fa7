//! Error types for tile pyramids and compositing.

use thiserror::Error;

use crate::download::FetchError;

/// A tile descriptor (DZI XML, ZIF header, probed grid) could not be used.
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// The DZI document is not well-formed XML.
    #[error("malformed descriptor XML: {0}")]
    Xml(String),

    /// No `<Image>` element was found.
    #[error("descriptor has no Image element")]
    MissingImage,

    /// No `<Size>` element was found inside `<Image>`.
    #[error("descriptor has no Size element")]
    MissingSize,

    /// An attribute could not be parsed as a number.
    #[error("invalid {field} value {value:?}")]
    InvalidValue { field: &'static str, value: String },

    /// Width or height is zero.
    #[error("image dimensions must be positive, got {width}x{height}")]
    EmptyImage { width: u32, height: u32 },

    #[error("tile size must be positive")]
    ZeroTileSize,

    #[error("overlap {overlap} must be smaller than tile size {tile_size}")]
    OverlapTooLarge { overlap: u32, tile_size: u32 },

    /// The container ended before a structure it points at.
    #[error("container truncated while reading {0}")]
    Truncated(&'static str),

    /// Not a little-endian TIFF or BigTIFF container.
    #[error("not a little-endian TIFF container")]
    NotTiff,

    #[error("unsupported TIFF version {0}")]
    UnsupportedVersion(u16),

    #[error("missing TIFF tag {0}")]
    MissingTag(u16),

    #[error("tiles must be square, got {width}x{height}")]
    NonSquareTiles { width: u32, height: u32 },

    /// The offset and byte-count tables disagree with the tile grid.
    #[error("tile table has {actual} entries, grid needs {expected}")]
    TileCountMismatch { expected: usize, actual: usize },

    /// Direct probing found no level-0 origin tile.
    #[error("no tile grid found under {base_url}")]
    ProbeFailed { base_url: String },

    #[error("tile grid search under {base_url} was cancelled")]
    ProbeCancelled { base_url: String },
}

/// One tile could not be obtained. The compositor leaves its region blank.
#[derive(Debug, Error)]
pub enum TileFetchError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("tile {column},{row} is not in the container")]
    NotInContainer { column: u32, row: u32 },
}

/// Compositing a page failed. None of these are retried by the compositor.
#[derive(Debug, Error)]
pub enum CompositeError {
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    /// The requested level is not available in this pyramid.
    #[error("level {level} is not available (max level {max_level})")]
    LevelOutOfRange { level: u32, max_level: u32 },

    /// The level has no tiles.
    #[error("level {level} has an empty tile grid")]
    DegenerateGrid { level: u32 },

    /// Every tile fetch or decode failed.
    #[error("none of {attempted} tiles could be composited")]
    NoTilesComposited { attempted: usize },

    #[error("failed to encode composite: {0}")]
    Encode(#[from] image::ImageError),

    /// The blocking compose task panicked or was cancelled.
    #[error("compose task failed: {0}")]
    Task(String),
}
