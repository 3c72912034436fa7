//! Tile pyramid pages end to end: descriptor or probe, tile fetches over HTTP,
//! compositing through the download engine.

use std::sync::Arc;
use std::time::Duration;

use mss_core::download::{DownloadEngine, PageFormat, PageState};
use mss_core::manifest::{ManifestPage, PageKind};
use mss_core::pyramid::{Compositor, HttpTileSource, parse_dzi};
use mss_core::queue::RetryQueue;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::fixtures::{
    deep_zoom_tile_size, dzi_xml, fast_options, fetcher, jpeg_tile, png_tile,
};
use support::socket_guard::start_mock_server_or_skip;

macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        mock_server
    }};
}

const WIDTH: u32 = 700;
const HEIGHT: u32 = 450;
const LEVEL: u32 = 10;

fn colour(column: u32, row: u32) -> [u8; 3] {
    [
        u8::try_from(column * 60).unwrap(),
        u8::try_from(row * 100).unwrap(),
        10,
    ]
}

/// Mounts every tile of the 3x2 full level, skipping `missing`.
async fn mount_tiles(server: &MockServer, base_path: &str, ext: &str, missing: &[(u32, u32)]) {
    for row in 0..2 {
        for column in 0..3 {
            if missing.contains(&(column, row)) {
                continue;
            }
            let (w, h) = deep_zoom_tile_size(WIDTH, HEIGHT, 256, 1, column, row);
            let body = if ext == "png" {
                png_tile(w, h, colour(column, row))
            } else {
                jpeg_tile(w, h, colour(column, row))
            };
            Mock::given(method("GET"))
                .and(path(format!("{base_path}_files/{LEVEL}/{column}_{row}.{ext}")))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
                .mount(server)
                .await;
        }
    }
}

async fn mount_descriptor(server: &MockServer, descriptor_path: &str) {
    Mock::given(method("GET"))
        .and(path(descriptor_path))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(dzi_xml(WIDTH, HEIGHT, 256, 1, "png")),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_dzi_descriptor_and_http_tiles_composite_exactly() {
    let mock_server = require_mock_server!();
    mount_descriptor(&mock_server, "/dz/f1r.dzi").await;
    mount_tiles(&mock_server, "/dz/f1r", "png", &[]).await;

    let url = format!("{}/dz/f1r.dzi", mock_server.uri());
    let fetcher = fetcher(fast_options(2), RetryQueue::in_memory());
    let cancel = CancellationToken::new();
    let xml = fetcher.fetch_body(&url, &cancel).await.unwrap();
    let meta = parse_dzi(&String::from_utf8_lossy(&xml), &url).unwrap();
    assert_eq!(meta.max_level, LEVEL);

    let source = HttpTileSource::new(fetcher, cancel);
    let outcome = Compositor::default()
        .composite(&meta, meta.max_level, &source)
        .await
        .unwrap();

    assert_eq!((outcome.width, outcome.height), (WIDTH, HEIGHT));
    assert_eq!(outcome.tiles_composited, 6);
    let img = image::load_from_memory(&outcome.bytes).unwrap().to_rgb8();
    assert_eq!(img.dimensions(), (WIDTH, HEIGHT));
    assert_eq!(img.get_pixel(256, 0).0, colour(1, 0));
    assert_eq!(img.get_pixel(699, 449).0, colour(2, 1));
}

#[tokio::test]
async fn test_engine_composites_deep_zoom_page_with_missing_tile() {
    let mock_server = require_mock_server!();
    mount_descriptor(&mock_server, "/dz/f2v.dzi").await;
    mount_tiles(&mock_server, "/dz/f2v", "png", &[(1, 1)]).await;

    let engine = DownloadEngine::new(
        2,
        fetcher(fast_options(2), RetryQueue::in_memory()),
        Compositor::default(),
    )
    .unwrap();
    let pages = vec![ManifestPage::new(
        format!("{}/dz/f2v.dzi", mock_server.uri()),
        "f. 2v",
    )];
    let report = engine
        .download_all(&pages, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_complete());
    let page = &report.results[0];
    assert_eq!(page.kind, PageKind::DeepZoom);
    assert_eq!(page.state, PageState::Verified);
    assert_eq!(page.missing_tiles, 1);
    let image = page.image.as_ref().unwrap();
    assert_eq!(image.format, PageFormat::Png);
    assert_eq!((image.width, image.height), (Some(WIDTH), Some(HEIGHT)));
    let img = image::load_from_memory(&image.bytes).unwrap().to_rgb8();
    assert_eq!(img.get_pixel(300, 300).0, [255, 255, 255]);
}

#[tokio::test]
async fn test_coverage_below_minimum_fails_and_queues_page() {
    let mock_server = require_mock_server!();
    mount_descriptor(&mock_server, "/dz/f3r.dzi").await;
    mount_tiles(&mock_server, "/dz/f3r", "png", &[(0, 0), (1, 0), (2, 0)]).await;

    let queue = RetryQueue::in_memory();
    let engine = DownloadEngine::new(
        1,
        fetcher(fast_options(1), queue.clone()),
        Compositor::default(),
    )
    .unwrap()
    .with_max_sweeps(0)
    .with_min_tile_coverage(0.9)
    .unwrap();
    let url = format!("{}/dz/f3r.dzi", mock_server.uri());
    let pages = vec![ManifestPage::new(url.clone(), "f. 3r")];
    let report = engine
        .download_all(&pages, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.unrecoverable.len(), 1);
    assert!(report.unrecoverable[0].reason.contains("coverage"));
    let tasks = queue.dequeue_all().await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].source_url, url);
    assert_eq!(tasks[0].attempt_count, 1);
}

#[tokio::test]
async fn test_probed_deep_zoom_page_without_descriptor() {
    let mock_server = require_mock_server!();
    mount_tiles(&mock_server, "/dz/f4r", "jpg", &[]).await;

    let engine = DownloadEngine::new(
        1,
        fetcher(fast_options(1), RetryQueue::in_memory()),
        Compositor::default(),
    )
    .unwrap();
    let page = ManifestPage::new(format!("{}/dz/f4r", mock_server.uri()), "f. 4r")
        .with_kind(PageKind::DeepZoom);
    let report = engine
        .download_all(&[page], &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_complete(), "{:?}", report.unrecoverable);
    let image = report.results[0].image.as_ref().unwrap();
    assert_eq!(image.format, PageFormat::Jpeg);
    assert_eq!((image.width, image.height), (Some(WIDTH), Some(HEIGHT)));
}

#[tokio::test]
async fn test_deep_zoom_sink_receives_composited_page() {
    let mock_server = require_mock_server!();
    mount_descriptor(&mock_server, "/dz/f5r.dzi").await;
    mount_tiles(&mock_server, "/dz/f5r", "png", &[]).await;

    let out = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(
        1,
        fetcher(fast_options(1), RetryQueue::in_memory()),
        Compositor::default(),
    )
    .unwrap()
    .with_sink(Arc::new(mss_core::DirectorySink::new(out.path())));
    let pages = vec![ManifestPage::new(
        format!("{}/dz/f5r.dzi", mock_server.uri()),
        "f. 5r",
    )];
    let report = engine
        .download_all(&pages, &CancellationToken::new())
        .await
        .unwrap();

    let saved = report.results[0].saved_to.clone().unwrap();
    assert_eq!(saved, out.path().join("0000_f._5r.png"));
    assert!(report.results[0].image.is_none());
    let img = image::open(&saved).unwrap();
    assert_eq!((img.width(), img.height()), (WIDTH, HEIGHT));
}

#[tokio::test]
async fn test_cancel_during_compositing_leaves_page_pending() {
    let mock_server = require_mock_server!();
    mount_descriptor(&mock_server, "/dz/f6r.dzi").await;
    for row in 0..2 {
        for column in 0..3 {
            let (w, h) = deep_zoom_tile_size(WIDTH, HEIGHT, 256, 1, column, row);
            Mock::given(method("GET"))
                .and(path(format!("/dz/f6r_files/{LEVEL}/{column}_{row}.png")))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_bytes(png_tile(w, h, colour(column, row)))
                        .set_delay(Duration::from_millis(400)),
                )
                .mount(&mock_server)
                .await;
        }
    }

    let out = tempfile::tempdir().unwrap();
    let queue = RetryQueue::in_memory();
    let engine = DownloadEngine::new(
        1,
        fetcher(fast_options(2), queue.clone()),
        Compositor::new(16_384, 5),
    )
    .unwrap()
    .with_sink(Arc::new(mss_core::DirectorySink::new(out.path())));
    let pages = vec![ManifestPage::new(
        format!("{}/dz/f6r.dzi", mock_server.uri()),
        "f. 6r",
    )];

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });
    let report = engine.download_all(&pages, &cancel).await.unwrap();

    assert!(report.cancelled);
    let page = &report.results[0];
    assert_eq!(page.state, PageState::Pending);
    assert!(page.image.is_none());
    assert!(page.saved_to.is_none());
    assert!(report.unrecoverable.is_empty());
    assert!(queue.is_empty().await.unwrap());
    assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
}
