//! Tile grids discovered by probing, for servers without a descriptor.
//!
//! The highest level is the largest `L <= 20` that serves
//! `{base}_files/L/0_0.jpg`. The last column and row are then found by
//! binary search up to 200, and the size of the corner tile fixes the
//! level's exact dimensions.

use std::io::Cursor;

use image::ImageReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::error::DescriptorError;
use super::metadata::{
    DEFAULT_OVERLAP, DEFAULT_TILE_FORMAT, DEFAULT_TILE_SIZE, PyramidMetadata, TileLayout,
};
use crate::download::HttpClient;

/// Highest level tried.
pub const MAX_PROBE_LEVEL: u32 = 20;

/// Upper bound for the column and row search.
pub const MAX_PROBE_INDEX: u32 = 200;

fn tile_url(base_url: &str, level: u32, column: u32, row: u32) -> String {
    format!("{base_url}_files/{level}/{column}_{row}.{DEFAULT_TILE_FORMAT}")
}

async fn exists(client: &HttpClient, url: &str, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    let found = client.get_bytes(url).await.is_ok();
    debug!(url, found, "probed tile");
    found
}

/// Largest index in `0..=MAX_PROBE_INDEX` for which `probe(index)` holds,
/// given that `probe(0)` holds.
async fn last_index<F, Fut>(probe: F) -> u32
where
    F: Fn(u32) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let (mut low, mut high) = (0u32, MAX_PROBE_INDEX);
    while low < high {
        let mid = (low + high).div_ceil(2);
        if probe(mid).await {
            low = mid;
        } else {
            high = mid - 1;
        }
    }
    low
}

/// Finds a Deep Zoom tile grid under `base_url` without a descriptor.
///
/// Uses tile size 256, overlap 1 and `jpg` tiles. No request is issued once
/// `cancel` fires.
///
/// # Errors
///
/// Returns [`DescriptorError::ProbeFailed`] if no level serves an origin tile,
/// and [`DescriptorError::ProbeCancelled`] if `cancel` fired during the search.
#[instrument(skip(client, cancel))]
pub async fn probe_deep_zoom_layout(
    base_url: &str,
    client: &HttpClient,
    cancel: &CancellationToken,
) -> Result<PyramidMetadata, DescriptorError> {
    let cancelled = || DescriptorError::ProbeCancelled {
        base_url: base_url.to_string(),
    };
    let mut max_level = None;
    for level in (0..=MAX_PROBE_LEVEL).rev() {
        if exists(client, &tile_url(base_url, level, 0, 0), cancel).await {
            max_level = Some(level);
            break;
        }
    }
    if cancel.is_cancelled() {
        return Err(cancelled());
    }
    let level = max_level.ok_or_else(|| DescriptorError::ProbeFailed {
        base_url: base_url.to_string(),
    })?;

    let last_column = last_index(|c| async move {
        exists(client, &tile_url(base_url, level, c, 0), cancel).await
    })
    .await;
    let last_row = last_index(|r| async move {
        exists(client, &tile_url(base_url, level, 0, r), cancel).await
    })
    .await;
    if cancel.is_cancelled() {
        return Err(cancelled());
    }

    let ts = DEFAULT_TILE_SIZE;
    let (mut width, mut height) = ((last_column + 1) * ts, (last_row + 1) * ts);
    if let Ok(bytes) = client
        .get_bytes(&tile_url(base_url, level, last_column, last_row))
        .await
    {
        let corner = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .ok()
            .and_then(|reader| reader.into_dimensions().ok());
        if let Some((tile_width, tile_height)) = corner {
            let left = if last_column > 0 { DEFAULT_OVERLAP } else { 0 };
            let top = if last_row > 0 { DEFAULT_OVERLAP } else { 0 };
            width = last_column * ts + tile_width.saturating_sub(left).clamp(1, ts);
            height = last_row * ts + tile_height.saturating_sub(top).clamp(1, ts);
        }
    }

    info!(
        level,
        columns = last_column + 1,
        rows = last_row + 1,
        width,
        height,
        "probed tile grid"
    );
    PyramidMetadata::new(
        width,
        height,
        ts,
        DEFAULT_OVERLAP,
        DEFAULT_TILE_FORMAT,
        TileLayout::DeepZoom {
            base_url: base_url.to_string(),
        },
    )
    .map(|meta| meta.with_max_level(level))
}
