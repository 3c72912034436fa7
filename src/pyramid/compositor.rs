//! Stitches a pyramid level into one page image.
//!
//! # Overview
//!
//! [`Compositor::composite`] fetches every tile of a level with bounded
//! concurrency, crops each tile's overlap, places it on a white canvas and
//! encodes the result. Levels wider or taller than `max_canvas_dimension`
//! are scaled down before the canvas is allocated, so the canvas never
//! exceeds the cap. Tiles that fail to fetch or decode leave their region
//! white and are counted in [`CompositeOutcome::missing_tiles`].

use std::io::Cursor;

use futures_util::StreamExt;
use futures_util::stream;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgb, RgbImage};
use tracing::{debug, info, instrument};

use super::error::CompositeError;
use super::metadata::{PyramidMetadata, TileDescriptor};
use super::source::TileSource;
use crate::download::PageFormat;

/// Default per-side canvas cap.
pub const DEFAULT_MAX_CANVAS_DIMENSION: u32 = 16_384;

/// Default number of tile requests in flight per page.
pub const DEFAULT_TILE_CONCURRENCY: usize = 5;

/// JPEG quality for encoded composites.
pub const JPEG_QUALITY: u8 = 85;

/// A stitched and encoded page.
#[derive(Debug, Clone)]
pub struct CompositeOutcome {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PageFormat,
    pub tiles_attempted: usize,
    pub tiles_composited: usize,
    /// The level exceeded the canvas cap and was scaled down.
    pub scaled: bool,
}

impl CompositeOutcome {
    #[must_use]
    pub fn missing_tiles(&self) -> usize {
        self.tiles_attempted.saturating_sub(self.tiles_composited)
    }

    /// Fraction of tiles composited, in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn coverage(&self) -> f64 {
        if self.tiles_attempted == 0 {
            return 0.0;
        }
        self.tiles_composited as f64 / self.tiles_attempted as f64
    }
}

/// Canvas geometry for one level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct CanvasPlan {
    pub level_width: u32,
    pub level_height: u32,
    pub tile_size: u32,
    pub overlap: u32,
    pub canvas_width: u32,
    pub canvas_height: u32,
    scale: f64,
}

impl CanvasPlan {
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_lossless
    )]
    pub(crate) fn new(level_width: u32, level_height: u32, tile_size: u32, overlap: u32, max_dimension: u32) -> Self {
        let largest = level_width.max(level_height);
        let max_dimension = max_dimension.max(1);
        let scale = if largest > max_dimension {
            f64::from(max_dimension) / f64::from(largest)
        } else {
            1.0
        };
        let fit = |dim: u32| {
            if dim == largest {
                max_dimension
            } else {
                ((f64::from(dim) * scale).floor() as u32).clamp(1, max_dimension)
            }
        };
        let (canvas_width, canvas_height) = if largest > max_dimension {
            (fit(level_width), fit(level_height))
        } else {
            (level_width, level_height)
        };
        Self {
            level_width,
            level_height,
            tile_size,
            overlap,
            canvas_width,
            canvas_height,
            scale,
        }
    }

    pub(crate) fn is_scaled(&self) -> bool {
        self.canvas_width != self.level_width || self.canvas_height != self.level_height
    }

    /// Canvas column of level column `position`.
    pub(crate) fn x_edge(&self, position: u32) -> u32 {
        self.edge(position, self.level_width, self.canvas_width)
    }

    /// Canvas row of level row `position`.
    pub(crate) fn y_edge(&self, position: u32) -> u32 {
        self.edge(position, self.level_height, self.canvas_height)
    }

    /// The far side of the level always maps to the far side of the canvas.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn edge(&self, position: u32, level: u32, canvas: u32) -> u32 {
        if position >= level {
            return canvas;
        }
        if !self.is_scaled() {
            return position;
        }
        ((f64::from(position) * self.scale).floor() as u32).min(canvas)
    }
}

/// Builds page images from tile pyramids.
#[derive(Debug, Clone)]
pub struct Compositor {
    max_canvas_dimension: u32,
    tile_concurrency: usize,
}

impl Default for Compositor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CANVAS_DIMENSION, DEFAULT_TILE_CONCURRENCY)
    }
}

impl Compositor {
    #[must_use]
    pub fn new(max_canvas_dimension: u32, tile_concurrency: usize) -> Self {
        Self {
            max_canvas_dimension: max_canvas_dimension.max(1),
            tile_concurrency: tile_concurrency.max(1),
        }
    }

    #[must_use]
    pub fn max_canvas_dimension(&self) -> u32 {
        self.max_canvas_dimension
    }

    /// Fetches, stitches and encodes `level` of `metadata`.
    ///
    /// Every tile in the grid is attempted. The output is PNG when the tiles
    /// are PNG and JPEG otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`CompositeError::LevelOutOfRange`] or
    /// [`CompositeError::DegenerateGrid`] before any request is made,
    /// [`CompositeError::NoTilesComposited`] when not a single tile could be
    /// placed, and [`CompositeError::Encode`] if encoding fails.
    #[instrument(skip(self, metadata, source), fields(width = metadata.full_width, height = metadata.full_height))]
    pub async fn composite(
        &self,
        metadata: &PyramidMetadata,
        level: u32,
        source: &dyn TileSource,
    ) -> Result<CompositeOutcome, CompositeError> {
        let (level_width, level_height) = metadata.checked_dimensions(level)?;
        let tiles = metadata.tiles(level)?;
        let attempted = tiles.len();
        debug!(attempted, "fetching tiles");

        let fetched: Vec<(TileDescriptor, Vec<u8>)> = stream::iter(tiles)
            .map(|tile| async move {
                let result = source.fetch_tile(&tile).await;
                (tile, result)
            })
            .buffer_unordered(self.tile_concurrency)
            .filter_map(|(tile, result)| async move {
                match result {
                    Ok(bytes) => Some((tile, bytes)),
                    Err(e) => {
                        debug!(column = tile.column, row = tile.row, error = %e, "tile unavailable");
                        None
                    }
                }
            })
            .collect()
            .await;

        let plan = CanvasPlan::new(
            level_width,
            level_height,
            metadata.tile_size,
            metadata.overlap,
            self.max_canvas_dimension,
        );
        let format = if metadata.format == "png" {
            PageFormat::Png
        } else {
            PageFormat::Jpeg
        };

        let outcome = tokio::task::spawn_blocking(move || {
            let (canvas, composited) = stitch(&plan, &fetched);
            if composited == 0 {
                return Err(CompositeError::NoTilesComposited { attempted });
            }
            let bytes = encode(&canvas, format)?;
            Ok(CompositeOutcome {
                bytes,
                width: plan.canvas_width,
                height: plan.canvas_height,
                format,
                tiles_attempted: attempted,
                tiles_composited: composited,
                scaled: plan.is_scaled(),
            })
        })
        .await
        .map_err(|e| CompositeError::Task(e.to_string()))??;

        info!(
            level,
            width = outcome.width,
            height = outcome.height,
            tiles = outcome.tiles_composited,
            missing = outcome.missing_tiles(),
            scaled = outcome.scaled,
            "page composited"
        );
        Ok(outcome)
    }
}

/// Places decoded tiles on a white canvas. Returns the canvas and the number
/// of tiles placed.
pub(crate) fn stitch(plan: &CanvasPlan, tiles: &[(TileDescriptor, Vec<u8>)]) -> (RgbImage, usize) {
    let mut canvas = RgbImage::from_pixel(plan.canvas_width, plan.canvas_height, Rgb([255, 255, 255]));
    let mut composited = 0;

    for (tile, bytes) in tiles {
        let Some(x0) = tile.column.checked_mul(plan.tile_size) else {
            continue;
        };
        let Some(y0) = tile.row.checked_mul(plan.tile_size) else {
            continue;
        };
        if x0 >= plan.level_width || y0 >= plan.level_height {
            continue;
        }
        let content_width = plan.tile_size.min(plan.level_width - x0);
        let content_height = plan.tile_size.min(plan.level_height - y0);
        let src_x = if tile.column > 0 { plan.overlap } else { 0 };
        let src_y = if tile.row > 0 { plan.overlap } else { 0 };

        let decoded = match image::load_from_memory(bytes) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                debug!(column = tile.column, row = tile.row, error = %e, "tile did not decode");
                continue;
            }
        };
        if src_x >= decoded.width() || src_y >= decoded.height() {
            continue;
        }
        let crop_width = content_width.min(decoded.width() - src_x);
        let crop_height = content_height.min(decoded.height() - src_y);
        let cropped = imageops::crop_imm(&decoded, src_x, src_y, crop_width, crop_height).to_image();

        if plan.is_scaled() {
            let dx0 = plan.x_edge(x0);
            let dy0 = plan.y_edge(y0);
            let dx1 = plan.x_edge(x0 + crop_width);
            let dy1 = plan.y_edge(y0 + crop_height);
            if dx1 > dx0 && dy1 > dy0 {
                let resized = imageops::resize(&cropped, dx1 - dx0, dy1 - dy0, FilterType::Triangle);
                imageops::replace(&mut canvas, &resized, i64::from(dx0), i64::from(dy0));
            }
        } else {
            imageops::replace(&mut canvas, &cropped, i64::from(x0), i64::from(y0));
        }
        composited += 1;
    }
    (canvas, composited)
}

fn encode(canvas: &RgbImage, format: PageFormat) -> Result<Vec<u8>, image::ImageError> {
    let mut bytes = Vec::new();
    if format == PageFormat::Png {
        canvas.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    } else {
        JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY).encode_image(canvas)?;
    }
    Ok(bytes)
}
