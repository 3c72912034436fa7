//! End-to-end tests for the `mss-downloader` binary.

#![allow(deprecated)]

mod support;
use support::fixtures::jpeg_page;
use support::socket_guard::start_mock_server_or_skip;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

/// Command isolated from the user's config and state.
fn command(temp: &TempDir) -> Command {
    let config_home = temp.path().join("xdg-config");
    std::fs::create_dir_all(&config_home).unwrap();
    let mut cmd = Command::cargo_bin("mss-downloader").unwrap();
    cmd.env("XDG_CONFIG_HOME", &config_home)
        .env_remove("RUST_LOG")
        .arg("--state-dir")
        .arg(temp.path().join("state"));
    cmd
}

#[test]
fn test_binary_help() {
    let mut cmd = Command::cargo_bin("mss-downloader").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("manuscript"))
        .stdout(predicate::str::contains("--max-sweeps"));
}

#[test]
fn test_binary_requires_manifest_or_pages() {
    let mut cmd = Command::cargo_bin("mss-downloader").unwrap();
    cmd.assert().failure().code(2);
}

#[test]
fn test_binary_rejects_invalid_config_file() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("bad.toml");
    std::fs::write(&config, "rate_limit = 10\n").unwrap();

    command(&temp)
        .arg("--config")
        .arg(&config)
        .arg("-p")
        .arg("https://lib.example/p.jpg")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown configuration key"));
}

#[tokio::test]
async fn test_binary_downloads_manifest_pages() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    for name in ["p1", "p2"] {
        Mock::given(method("GET"))
            .and(path(format!("/{name}.jpg")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(jpeg_page(12_000)))
            .mount(&mock_server)
            .await;
    }

    let temp = TempDir::new().unwrap();
    let manifest = temp.path().join("codex.json");
    std::fs::write(
        &manifest,
        format!(
            r#"{{"title": "Codex", "pages": [
                {{"url": "{uri}/p1.jpg", "label": "f. 1r"}},
                "{uri}/p2.jpg"
            ]}}"#,
            uri = mock_server.uri()
        ),
    )
    .unwrap();
    let out = temp.path().join("out");

    command(&temp)
        .arg("-q")
        .arg("--output-dir")
        .arg(&out)
        .arg(&manifest)
        .assert()
        .success();

    assert_eq!(std::fs::read(out.join("0000_f._1r.jpg")).unwrap().len(), 12_000);
    assert!(out.join("0001_Page_2.jpg").exists());
    assert!(temp.path().join("state").join("state.db").exists());
}

#[tokio::test]
async fn test_binary_exit_code_partial_success_is_one() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/ok.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(jpeg_page(12_000)))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gone.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    command(&temp)
        .arg("-q")
        .args(["--max-sweeps", "0", "-r", "1"])
        .arg("--output-dir")
        .arg(temp.path().join("out"))
        .arg("-p")
        .arg(format!("{}/ok.jpg", mock_server.uri()))
        .arg("-p")
        .arg(format!("{}/gone.jpg", mock_server.uri()))
        .assert()
        .failure()
        .code(1);

    assert!(temp.path().join("out").join("0000_Page_1.jpg").exists());
}
