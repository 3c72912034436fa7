//! Pyramid geometry shared by every tile layout.

use serde::Serialize;

use super::error::{CompositeError, DescriptorError};

/// Deep Zoom defaults, also used for probed grids.
pub const DEFAULT_TILE_SIZE: u32 = 256;
pub const DEFAULT_OVERLAP: u32 = 1;
pub const DEFAULT_TILE_FORMAT: &str = "jpg";

/// Where the tiles of a pyramid come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TileLayout {
    /// `{base_url}_files/{level}/{col}_{row}.{format}`.
    DeepZoom { base_url: String },
    /// Tiles packed in one downloaded container.
    Zif { source_url: String },
}

/// One tile of one level. Derived from [`PyramidMetadata`], never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileDescriptor {
    pub column: u32,
    pub row: u32,
    pub level: u32,
    pub url: String,
}

/// Dimensions and tiling of a multi-resolution image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PyramidMetadata {
    pub full_width: u32,
    pub full_height: u32,
    pub tile_size: u32,
    pub overlap: u32,
    pub max_level: u32,
    /// Tile file extension, lower-cased (`jpg`, `png`).
    pub format: String,
    pub layout: TileLayout,
}

/// `ceil(log2(max(width, height)))`, the Deep Zoom full-resolution level.
#[must_use]
pub fn max_level_for(width: u32, height: u32) -> u32 {
    let largest = width.max(height);
    if largest <= 1 {
        0
    } else {
        u32::BITS - (largest - 1).leading_zeros()
    }
}

fn ceil_div(value: u64, divisor: u64) -> u64 {
    value.div_ceil(divisor)
}

impl PyramidMetadata {
    /// Validates the geometry and derives `max_level`.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError`] for zero dimensions, zero tile size, or an
    /// overlap that swallows the whole tile.
    pub fn new(
        full_width: u32,
        full_height: u32,
        tile_size: u32,
        overlap: u32,
        format: impl Into<String>,
        layout: TileLayout,
    ) -> Result<Self, DescriptorError> {
        if full_width == 0 || full_height == 0 {
            return Err(DescriptorError::EmptyImage {
                width: full_width,
                height: full_height,
            });
        }
        if tile_size == 0 {
            return Err(DescriptorError::ZeroTileSize);
        }
        if overlap >= tile_size {
            return Err(DescriptorError::OverlapTooLarge { overlap, tile_size });
        }
        Ok(Self {
            full_width,
            full_height,
            tile_size,
            overlap,
            max_level: max_level_for(full_width, full_height),
            format: format.into().to_ascii_lowercase(),
            layout,
        })
    }

    /// Pins the full-resolution level to what the server actually uses.
    #[must_use]
    pub fn with_max_level(mut self, max_level: u32) -> Self {
        self.max_level = max_level;
        self
    }

    /// Returns `true` if tiles exist for `level` in this layout.
    #[must_use]
    pub fn has_level(&self, level: u32) -> bool {
        match self.layout {
            TileLayout::DeepZoom { .. } => level <= self.max_level,
            TileLayout::Zif { .. } => level == self.max_level,
        }
    }

    /// Pixel dimensions of `level`, or `None` above `max_level`.
    #[must_use]
    pub fn level_dimensions(&self, level: u32) -> Option<(u32, u32)> {
        if level > self.max_level {
            return None;
        }
        let divisor = 1u64.checked_shl(self.max_level - level)?;
        let scale = |dim: u32| {
            u32::try_from(ceil_div(u64::from(dim), divisor))
                .unwrap_or(u32::MAX)
                .max(1)
        };
        Some((scale(self.full_width), scale(self.full_height)))
    }

    /// `(columns, rows)` of the tile grid at `level`.
    ///
    /// # Errors
    ///
    /// Returns [`CompositeError::LevelOutOfRange`] if the layout has no such level.
    pub fn grid(&self, level: u32) -> Result<(u32, u32), CompositeError> {
        let (width, height) = self.checked_dimensions(level)?;
        let ts = u64::from(self.tile_size);
        let cols = u32::try_from(ceil_div(u64::from(width), ts)).unwrap_or(u32::MAX);
        let rows = u32::try_from(ceil_div(u64::from(height), ts)).unwrap_or(u32::MAX);
        Ok((cols, rows))
    }

    /// Every tile of `level` in row-major order.
    ///
    /// # Errors
    ///
    /// Returns [`CompositeError::LevelOutOfRange`] or
    /// [`CompositeError::DegenerateGrid`].
    pub fn tiles(&self, level: u32) -> Result<Vec<TileDescriptor>, CompositeError> {
        let (cols, rows) = self.grid(level)?;
        if cols == 0 || rows == 0 {
            return Err(CompositeError::DegenerateGrid { level });
        }
        let mut tiles = Vec::with_capacity(cols as usize * rows as usize);
        for row in 0..rows {
            for column in 0..cols {
                tiles.push(TileDescriptor {
                    column,
                    row,
                    level,
                    url: self.tile_url(level, column, row),
                });
            }
        }
        Ok(tiles)
    }

    /// Address of one tile.
    #[must_use]
    pub fn tile_url(&self, level: u32, column: u32, row: u32) -> String {
        match &self.layout {
            TileLayout::DeepZoom { base_url } => {
                format!("{base_url}_files/{level}/{column}_{row}.{}", self.format)
            }
            TileLayout::Zif { source_url } => format!("{source_url}#tile={column},{row}"),
        }
    }

    pub(crate) fn checked_dimensions(&self, level: u32) -> Result<(u32, u32), CompositeError> {
        if !self.has_level(level) {
            return Err(CompositeError::LevelOutOfRange {
                level,
                max_level: self.max_level,
            });
        }
        self.level_dimensions(level)
            .ok_or(CompositeError::LevelOutOfRange {
                level,
                max_level: self.max_level,
            })
    }
}
