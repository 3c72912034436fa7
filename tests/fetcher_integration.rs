//! Integration tests for the page fetcher against a mock HTTP server.

use std::sync::atomic::Ordering;
use std::time::Duration;

use mss_core::download::{Egress, FetchError, FetchOptions, FetchOutcome, PageFormat};
use mss_core::queue::RetryQueue;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

mod support;
use support::fixtures::{FlakyResponder, fast_options, fetcher, jpeg_page};
use support::socket_guard::start_mock_server_or_skip;

macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        mock_server
    }};
}

#[tokio::test]
async fn test_verified_page_on_first_attempt() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/p1.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(jpeg_page(20_000)))
        .expect(1)
        .mount(&mock_server)
        .await;

    let queue = RetryQueue::in_memory();
    let fetcher = fetcher(fast_options(3), queue.clone());
    let outcome = fetcher
        .fetch(&format!("{}/p1.jpg", mock_server.uri()), 0)
        .await;

    let FetchOutcome::Fetched(image) = outcome else {
        panic!("expected a verified page, got {outcome:?}");
    };
    assert_eq!(image.attempts, 1);
    assert_eq!(image.format, PageFormat::Jpeg);
    assert_eq!(image.bytes.len(), 20_000);
    assert!(queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_always_timeout_makes_exactly_max_retries_attempts() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/slow.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(jpeg_page(20_000))
                .set_delay(Duration::from_secs(5)),
        )
        .expect(3)
        .mount(&mock_server)
        .await;

    let options = FetchOptions {
        request_timeout: Duration::from_millis(200),
        ..fast_options(3)
    };
    let queue = RetryQueue::in_memory();
    let fetcher = fetcher(options, queue.clone());
    let url = format!("{}/slow.jpg", mock_server.uri());
    let outcome = fetcher.fetch(&url, 4).await;

    let FetchOutcome::Failed(failure) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(failure.attempts, 3);
    assert!(matches!(failure.last_error, FetchError::Timeout { .. }));

    let tasks = queue.dequeue_all().await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].page_index, 4);
    assert_eq!(tasks[0].source_url, url);
    assert_eq!(tasks[0].attempt_count, 3);
}

#[tokio::test]
async fn test_small_html_body_with_200_is_rejected() {
    let mock_server = require_mock_server!();
    let mut html = b"<html><body>Service busy</body></html>".to_vec();
    html.resize(512, b' ');
    Mock::given(method("GET"))
        .and(path("/p2.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(html)
                .insert_header("Content-Type", "text/html"),
        )
        .expect(2)
        .mount(&mock_server)
        .await;

    let options = FetchOptions {
        page_verification_size: 10_240,
        ..fast_options(2)
    };
    let fetcher = fetcher(options, RetryQueue::in_memory());
    let outcome = fetcher
        .fetch(&format!("{}/p2.jpg", mock_server.uri()), 1)
        .await;

    let FetchOutcome::Failed(failure) = outcome else {
        panic!("512-byte HTML must not verify");
    };
    assert!(matches!(
        failure.last_error,
        FetchError::TooSmall {
            actual_bytes: 512,
            minimum_bytes: 10_240,
            ..
        }
    ));
}

#[tokio::test]
async fn test_too_small_body_is_retried_until_it_verifies() {
    let mock_server = require_mock_server!();
    let responder = FlakyResponder::new(0, 200, jpeg_page(20_000));
    let count = std::sync::Arc::clone(&responder.request_count);
    // First response: a short body with status 200.
    Mock::given(method("GET"))
        .and(path("/p3.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tiny".to_vec()))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/p3.jpg"))
        .respond_with(responder)
        .mount(&mock_server)
        .await;

    let fetcher = fetcher(fast_options(3), RetryQueue::in_memory());
    let outcome = fetcher
        .fetch(&format!("{}/p3.jpg", mock_server.uri()), 2)
        .await;

    let FetchOutcome::Fetched(image) = outcome else {
        panic!("expected recovery on the second attempt");
    };
    assert_eq!(image.attempts, 2);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_iiif_quality_fallback_after_repeated_failures() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/iiif/p1/full/max/0/default.jpg"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/iiif/p1/full/full/0/default.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(jpeg_page(20_000)))
        .expect(1)
        .mount(&mock_server)
        .await;

    let options = FetchOptions {
        quality_fallback_threshold: 2,
        ..fast_options(5)
    };
    let fetcher = fetcher(options, RetryQueue::in_memory());
    let url = format!("{}/iiif/p1/full/max/0/default.jpg", mock_server.uri());
    let outcome = fetcher.fetch(&url, 0).await;

    let FetchOutcome::Fetched(image) = outcome else {
        panic!("expected the smaller rendition to verify");
    };
    assert_eq!(image.attempts, 3);
    assert_eq!(image.quality_level, 1);
    assert_eq!(image.url, url);
    assert!(image.fetched_url.ends_with("/full/full/0/default.jpg"));
}

#[tokio::test]
async fn test_quality_fallback_disabled_keeps_original_size() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/iiif/p1/full/max/0/default.jpg"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&mock_server)
        .await;

    let options = FetchOptions {
        max_quality_fallbacks: false,
        quality_fallback_threshold: 1,
        ..fast_options(3)
    };
    let fetcher = fetcher(options, RetryQueue::in_memory());
    let outcome = fetcher
        .fetch(
            &format!("{}/iiif/p1/full/max/0/default.jpg", mock_server.uri()),
            0,
        )
        .await;
    assert!(!outcome.is_fetched());
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/gone.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    let queue = RetryQueue::in_memory();
    let fetcher = fetcher(fast_options(5), queue.clone());
    let outcome = fetcher
        .fetch(&format!("{}/gone.jpg", mock_server.uri()), 9)
        .await;

    let FetchOutcome::Failed(failure) = outcome else {
        panic!("404 must fail");
    };
    assert_eq!(failure.attempts, 1);
    // Still queued: a sweep may try again with a refreshed URL.
    assert_eq!(queue.len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_retry_task_success_removes_queue_entry() {
    let mock_server = require_mock_server!();
    let responder = FlakyResponder::new(2, 500, jpeg_page(20_000));
    Mock::given(method("GET"))
        .and(path("/p5.jpg"))
        .respond_with(responder)
        .mount(&mock_server)
        .await;

    let queue = RetryQueue::in_memory();
    let fetcher = fetcher(fast_options(2), queue.clone());
    let url = format!("{}/p5.jpg", mock_server.uri());

    assert!(!fetcher.fetch(&url, 5).await.is_fetched());
    let tasks = queue.dequeue_all().await.unwrap();
    assert_eq!(tasks.len(), 1);

    let outcome = fetcher
        .retry_task(&tasks[0], &CancellationToken::new())
        .await;
    assert!(outcome.is_fetched());
    assert!(queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_fetch_body_skips_image_verification() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/page.dzi"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<Image/>"))
        .mount(&mock_server)
        .await;

    let queue = RetryQueue::in_memory();
    let fetcher = fetcher(fast_options(2), queue.clone());
    let body = fetcher
        .fetch_body(
            &format!("{}/page.dzi", mock_server.uri()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(body, b"<Image/>");
    assert!(queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_unauthorized_is_retried_to_the_budget() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/p.jpg"))
        .respond_with(ResponseTemplate::new(401))
        .expect(3)
        .mount(&mock_server)
        .await;

    let fetcher = fetcher(fast_options(3), RetryQueue::in_memory());
    let outcome = fetcher
        .fetch(&format!("{}/p.jpg", mock_server.uri()), 0)
        .await;

    let FetchOutcome::Failed(failure) = outcome else {
        panic!("401 must fail");
    };
    assert_eq!(failure.attempts, 3);
    assert!(matches!(
        failure.last_error,
        FetchError::HttpStatus { status: 401, .. }
    ));
}

#[tokio::test]
async fn test_connection_refused_is_retried_even_with_tls_words_in_url() {
    // Nothing listens on port 1.
    let url = "http://127.0.0.1:1/scans/ssl/page.jpg";
    let queue = RetryQueue::in_memory();
    let fetcher = fetcher(fast_options(3), queue.clone());
    let outcome = fetcher.fetch(url, 0).await;

    let FetchOutcome::Failed(failure) = outcome else {
        panic!("refused connection must fail");
    };
    assert_eq!(failure.attempts, 3);
    assert!(matches!(failure.last_error, FetchError::Network { .. }));
    assert_eq!(queue.dequeue_all().await.unwrap()[0].attempt_count, 3);
}

#[tokio::test]
async fn test_relay_takes_over_after_direct_attempts_fail() {
    let mock_server = require_mock_server!();
    let uri = mock_server.uri();
    let target = format!("{uri}/p7.jpg");

    // Health probes hit the origin root, directly and through the relay.
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/relay"))
        .and(query_param("url", format!("{uri}/")))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/p7.jpg"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/relay"))
        .and(query_param("url", target.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(jpeg_page(20_000)))
        .expect(1)
        .mount(&mock_server)
        .await;

    let relay = Egress::Relay(format!("{uri}/relay?url="));
    let options = FetchOptions {
        proxies: vec![relay.clone()],
        proxy_health_check: true,
        health_check_interval: 5,
        ..fast_options(5)
    };
    let queue = RetryQueue::in_memory();
    let fetcher = fetcher(options, queue.clone());
    let outcome = fetcher.fetch(&target, 7).await;

    let FetchOutcome::Fetched(image) = outcome else {
        panic!("expected the relay to serve the page, got {outcome:?}");
    };
    assert_eq!(image.attempts, 4);
    assert_eq!(image.egress, relay);
    assert_eq!(image.fetched_url, target);
    assert!(queue.is_empty().await.unwrap());

    let snapshot = fetcher.egress().snapshot();
    assert!(snapshot[0].egress.is_direct());
    assert_eq!(snapshot[0].health.consecutive_failures, 3);
    assert_eq!(snapshot[1].egress, relay);
}
