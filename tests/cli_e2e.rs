//! End-to-end CLI tests for the edo-transfer binary.

// `Command::cargo_bin` is deprecated in assert_cmd >=2.0.17 in favor of
// `cargo::cargo_bin_cmd!` macro. Suppressed until migration to the new API.
#![allow(deprecated)]

use assert_cmd::Command;
use md5::{Digest, Md5};
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

mod support;
use support::range_server::RangeServer;
use support::socket_guard::start_mock_server_or_skip;

fn write_config(config_home: &std::path::Path, contents: &str) {
    let config_dir = config_home.join("edo-transfer");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(config_dir.join("config.toml"), contents).unwrap();
}

/// Binary isolated from the user's config and token.
fn edo_transfer(config_home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("edo-transfer").unwrap();
    cmd.env("XDG_CONFIG_HOME", config_home.path())
        .env("HOME", config_home.path())
        .env_remove("EDO_TOKEN")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_binary_help_lists_subcommands() {
    let home = TempDir::new().unwrap();
    edo_transfer(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("download"))
        .stdout(predicate::str::contains("upload"));
}

#[test]
fn test_binary_without_subcommand_fails() {
    let home = TempDir::new().unwrap();
    edo_transfer(&home)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_binary_rejects_out_of_range_retries() {
    let home = TempDir::new().unwrap();
    edo_transfer(&home)
        .args(["download", "http://127.0.0.1:9/a", "a.bin", "--retries", "101"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("101"));
}

#[test]
fn test_binary_rejects_unknown_config_key() {
    let home = TempDir::new().unwrap();
    write_config(home.path(), "concurrency = 4\n");
    edo_transfer(&home)
        .args(["download", "http://127.0.0.1:9/a", "a.bin"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown configuration key"));
}

#[test]
fn test_binary_reports_missing_ticket_file() {
    let home = TempDir::new().unwrap();
    let file = home.path().join("payload.bin");
    std::fs::write(&file, b"data").unwrap();
    edo_transfer(&home)
        .arg("upload")
        .arg(&file)
        .args(["--ticket", "does-not-exist.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read ticket file"));
}

#[test]
fn test_binary_direct_upload_needs_api_host() {
    let home = TempDir::new().unwrap();
    let file = home.path().join("payload.bin");
    std::fs::write(&file, b"data").unwrap();
    let ticket = home.path().join("ticket.json");
    std::fs::write(&ticket, r#"{"maxsize": 4, "filename": "payload.bin"}"#).unwrap();
    edo_transfer(&home)
        .arg("upload")
        .arg(&file)
        .arg("--ticket")
        .arg(&ticket)
        .assert()
        .failure()
        .stderr(predicate::str::contains("--api-host"));
}

#[test]
fn test_binary_downloads_file_and_prints_md5() {
    let body: Vec<u8> = (0..10_000u32).map(|i| (i % 241) as u8).collect();
    let server = tokio_test::block_on(async {
        let server = start_mock_server_or_skip().await?;
        Mock::given(method("GET"))
            .and(path("/doc.bin"))
            .respond_with(RangeServer::new(body.clone()))
            .mount(&server)
            .await;
        Some(server)
    });
    let Some(server) = server else {
        return;
    };

    let home = TempDir::new().unwrap();
    let dest = home.path().join("doc.bin");
    edo_transfer(&home)
        .arg("download")
        .arg(format!("{}/doc.bin", server.uri()))
        .arg(&dest)
        .arg("--md5")
        .arg("-q")
        .assert()
        .success()
        .stdout(predicate::str::contains(hex::encode(Md5::digest(&body))));

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert!(!home.path().join(".doc.bin").exists());
}

#[test]
fn test_binary_download_failure_exits_non_zero() {
    let server = tokio_test::block_on(async {
        let server = start_mock_server_or_skip().await?;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Some(server)
    });
    let Some(server) = server else {
        return;
    };

    let home = TempDir::new().unwrap();
    edo_transfer(&home)
        .arg("download")
        .arg(format!("{}/gone.bin", server.uri()))
        .arg(home.path().join("gone.bin"))
        .arg("-q")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to download"));
}
