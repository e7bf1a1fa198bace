#![allow(deprecated)] // cargo_bin! macro doesn't exist yet in assert_cmd 2.1

use assert_cmd::Command;
use predicates::prelude::*;
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Stdio};
use tempfile::TempDir;

fn sharedav() -> Command {
    let mut cmd = Command::cargo_bin("sharedav").unwrap();
    cmd.env_remove("SHAREDAV_CONFIG");
    cmd
}

/// Write a config with one share per `(name, dir)` pair, all owned by the
/// current user.
fn write_config(dir: &Path, shares: &[(&str, &Path)], extra: &str) -> std::path::PathBuf {
    let owner = std::env::var("USER").unwrap_or_else(|_| "nobody".to_string());
    let mut text = String::new();
    for (name, path) in shares {
        text.push_str(&format!(
            "[[share]]\nname = \"{name}\"\npath = \"{}\"\nas = \"{owner}\"\n\n",
            path.display()
        ));
    }
    text.push_str(extra);
    let path = dir.join("config.toml");
    std::fs::write(&path, text).unwrap();
    path
}

/// Spawn the binary and read the first stdout line.
fn spawn_with_first_line(args: &[&str]) -> (Child, String) {
    let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin("sharedav"))
        .args(args)
        .env_remove("SHAREDAV_CONFIG")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn sharedav");
    let mut line = String::new();
    BufReader::new(child.stdout.take().unwrap())
        .read_line(&mut line)
        .expect("Failed to read first line");
    (child, line.trim().to_string())
}

/// Send `method` to `url` with an empty body.
fn request(method: &str, url: &str) -> Response {
    Client::new()
        .request(reqwest::Method::from_bytes(method.as_bytes()).unwrap(), url)
        .send()
        .unwrap_or_else(|e| panic!("{method} {url} failed: {e}"))
}

// ============================================================================
// Help and usage
// ============================================================================

#[test]
fn test_help_lists_subcommands() {
    sharedav()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("serve-shares"))
        .stdout(predicate::str::contains("shares"));
}

#[test]
fn test_short_help_succeeds() {
    // The sudo capability probe runs the executable with -h.
    sharedav().arg("-h").assert().success();
}

#[test]
fn test_serve_shares_requires_pairs() {
    sharedav().arg("serve-shares").assert().failure();
    sharedav()
        .args(["serve-shares", "docs", "/tmp", "photos"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("NAME PATH pairs"));
}

// ============================================================================
// shares
// ============================================================================

#[test]
fn test_shares_table() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        dir.path(),
        &[("Docs", dir.path()), ("photos", dir.path())],
        "[permissions]\ndefault = \"ro\"\ndocs = \"rw\"\n",
    );

    sharedav()
        .args(["shares", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("docs"))
        .stdout(predicate::str::contains("photos"))
        .stdout(predicate::str::contains("rw"))
        .stdout(predicate::str::contains("ro"));
}

#[test]
fn test_shares_json() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), &[("docs", dir.path())], "");

    sharedav()
        .args(["shares", "--json", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"name\": \"docs\""))
        .stdout(predicate::str::contains("\"access\": \"none\""));
}

#[test]
fn test_shares_config_from_env() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), &[("docs", dir.path())], "");

    sharedav()
        .arg("shares")
        .env("SHAREDAV_CONFIG", &config)
        .assert()
        .success()
        .stdout(predicate::str::contains("docs"));
}

#[test]
fn test_missing_config_exit_code() {
    sharedav()
        .args(["shares", "--config", "/nonexistent/sharedav.toml"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("Failed to load configuration"));
}

#[test]
fn test_invalid_config_exit_code() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), &[("docs", dir.path()), ("DOCS", dir.path())], "");

    sharedav()
        .args(["shares", "--config"])
        .arg(&config)
        .assert()
        .code(3)
        .stderr(predicate::str::contains("duplicate share"));
}

// ============================================================================
// serve-shares and serve
// ============================================================================

#[test]
fn test_serve_shares_reports_address_first() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("hello.txt"), "hello").unwrap();
    let dir_arg = dir.path().to_str().unwrap();

    let (mut child, addr) = spawn_with_first_line(&["serve-shares", "docs", dir_arg]);
    assert!(addr.parse::<std::net::SocketAddr>().is_ok(), "not an address: {addr:?}");

    let resp = request("GET", &format!("http://{addr}/docs/hello.txt"));
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().unwrap(), "hello");

    child.kill().unwrap();
    child.wait().unwrap();
}

#[test]
fn test_serve_without_privilege_separation() {
    let dir = TempDir::new().unwrap();
    let share_dir = dir.path().join("docs");
    std::fs::create_dir(&share_dir).unwrap();
    std::fs::write(share_dir.join("hello.txt"), "hello").unwrap();
    let config = write_config(
        dir.path(),
        &[("docs", &share_dir)],
        "[permissions]\ndefault = \"ro\"\n",
    );

    let (mut child, url) = spawn_with_first_line(&[
        "serve",
        "--no-privilege-separation",
        "--listen",
        "127.0.0.1:0",
        "--config",
        config.to_str().unwrap(),
    ]);
    assert!(url.starts_with("http://"), "not a URL: {url:?}");

    let resp = request("GET", &format!("{url}/docs/hello.txt"));
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().unwrap(), "hello");

    let resp = request("PUT", &format!("{url}/docs/new.txt"));
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(!share_dir.join("new.txt").exists());

    let resp = request("GET", &format!("{url}/missing/hello.txt"));
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(resp.text().unwrap(), "not found\n");

    child.kill().unwrap();
    child.wait().unwrap();
}
