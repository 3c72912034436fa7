use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, Rgb, RgbImage};
use mss_core::download::{EgressPool, FetchOptions, PageFetcher};
use mss_core::queue::RetryQueue;
use wiremock::{Request, Respond, ResponseTemplate};

/// Bytes that pass verification as a JPEG of `len` bytes.
#[must_use]
pub fn jpeg_page(len: usize) -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
    bytes.resize(len, 0x42);
    bytes
}

/// A solid-colour PNG tile.
#[must_use]
pub fn png_tile(width: u32, height: u32, colour: [u8; 3]) -> Vec<u8> {
    let tile = RgbImage::from_pixel(width, height, Rgb(colour));
    let mut buf = Vec::new();
    tile.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap_or_else(|e| panic!("encode tile: {e}"));
    buf
}

/// A solid-colour JPEG tile.
#[must_use]
pub fn jpeg_tile(width: u32, height: u32, colour: [u8; 3]) -> Vec<u8> {
    let tile = RgbImage::from_pixel(width, height, Rgb(colour));
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, 90)
        .encode_image(&tile)
        .unwrap_or_else(|e| panic!("encode tile: {e}"));
    buf
}

/// Pixel size of tile `(column, row)` in a Deep Zoom level, overlap included.
#[must_use]
pub fn deep_zoom_tile_size(
    width: u32,
    height: u32,
    tile_size: u32,
    overlap: u32,
    column: u32,
    row: u32,
) -> (u32, u32) {
    let columns = width.div_ceil(tile_size);
    let rows = height.div_ceil(tile_size);
    let content_w = tile_size.min(width - column * tile_size);
    let content_h = tile_size.min(height - row * tile_size);
    let left = if column > 0 { overlap } else { 0 };
    let top = if row > 0 { overlap } else { 0 };
    let right = if column + 1 < columns { overlap } else { 0 };
    let bottom = if row + 1 < rows { overlap } else { 0 };
    (left + content_w + right, top + content_h + bottom)
}

#[must_use]
pub fn dzi_xml(width: u32, height: u32, tile_size: u32, overlap: u32, format: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Image xmlns="http://schemas.microsoft.com/deepzoom/2008" TileSize="{tile_size}" Overlap="{overlap}" Format="{format}">
  <Size Width="{width}" Height="{height}"/>
</Image>"#
    )
}

/// Options with millisecond backoff so retry tests stay fast.
#[must_use]
pub fn fast_options(max_retries: u32) -> FetchOptions {
    FetchOptions {
        max_retries,
        min_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        ..FetchOptions::default()
    }
}

/// Fetcher over the direct path only.
#[must_use]
pub fn fetcher(options: FetchOptions, queue: RetryQueue) -> PageFetcher {
    let pool = EgressPool::from_options(&options).unwrap_or_else(|e| panic!("egress pool: {e}"));
    PageFetcher::new(options, Arc::new(pool), queue).unwrap_or_else(|e| panic!("fetcher: {e}"))
}

/// Fails the first `fail_count` requests with `fail_status`, then serves `body`.
pub struct FlakyResponder {
    pub request_count: Arc<AtomicUsize>,
    pub fail_count: usize,
    pub fail_status: u16,
    pub body: Vec<u8>,
}

impl FlakyResponder {
    #[must_use]
    pub fn new(fail_count: usize, fail_status: u16, body: Vec<u8>) -> Self {
        Self {
            request_count: Arc::new(AtomicUsize::new(0)),
            fail_count,
            fail_status,
            body,
        }
    }
}

impl Respond for FlakyResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.request_count.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_count {
            ResponseTemplate::new(self.fail_status).set_body_bytes(b"busy".to_vec())
        } else {
            ResponseTemplate::new(200).set_body_bytes(self.body.clone())
        }
    }
}
