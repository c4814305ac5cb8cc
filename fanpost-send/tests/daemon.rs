//! Integration tests for the fanpost-send daemon

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Write a minimal config pointing at a temp database
fn setup_test_env() -> (TempDir, String) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    let db_path = temp_dir.path().join("test.db");

    let config_content = format!(
        r#"
[database]
path = "{}"

[scheduler]
tick_interval_ms = 100

[dispatch]
base_delay_ms = 1
max_delay_ms = 5
jitter = false
"#,
        db_path.display().to_string().replace('\\', "/")
    );

    fs::write(&config_path, config_content).unwrap();

    (temp_dir, config_path.to_str().unwrap().to_string())
}

fn daemon() -> Command {
    let mut cmd = Command::cargo_bin("fanpost-send").unwrap();
    cmd.env_remove("FANPOST_LOG_LEVEL")
        .env_remove("FANPOST_LOG_FORMAT")
        .env_remove("FANPOST_CONFIG");
    cmd
}

#[test]
fn test_once_with_no_posts() {
    let (_temp_dir, config_path) = setup_test_env();

    daemon()
        .arg("--config")
        .arg(&config_path)
        .arg("--once")
        .write_stdin("")
        .assert()
        .success()
        .stderr(predicate::str::contains("fanpost-send daemon starting"))
        .stderr(predicate::str::contains("released 0 post(s) once, exiting"));
}

#[test]
fn test_tick_interval_override() {
    let (_temp_dir, config_path) = setup_test_env();

    daemon()
        .arg("--config")
        .arg(&config_path)
        .arg("--tick-interval-ms")
        .arg("250")
        .arg("--once")
        .write_stdin("")
        .assert()
        .success()
        .stderr(predicate::str::contains("Tick interval: 250ms"));
}

#[test]
fn test_verbose_flag() {
    let (_temp_dir, config_path) = setup_test_env();

    daemon()
        .arg("--config")
        .arg(&config_path)
        .arg("--verbose")
        .arg("--once")
        .write_stdin("")
        .assert()
        .success();
}

#[test]
fn test_invalid_config_exits_with_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    fs::write(&config_path, "[scheduler\ntick_interval_ms = ").unwrap();

    daemon()
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--once")
        .write_stdin("")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_submit_due_post_once() {
    let (_temp_dir, config_path) = setup_test_env();

    // No agent or token is configured, so the destination fails but the post is still released
    daemon()
        .arg("--config")
        .arg(&config_path)
        .arg("--once")
        .write_stdin(
            "{\"op\":\"submit\",\"user_id\":\"u1\",\"raw_content\":\"hello\",\
             \"target_platforms\":[\"facebook\"],\"scheduled_at\":\"now\",\
             \"credential_refs\":{\"facebook\":\"fb-page\"}}\n",
        )
        .assert()
        .success()
        .stdout(predicate::str::contains("\"ok\":true"))
        .stderr(predicate::str::contains("released 1 post(s) once, exiting"));
}

#[test]
fn test_invalid_request_line() {
    let (_temp_dir, config_path) = setup_test_env();

    daemon()
        .arg("--config")
        .arg(&config_path)
        .arg("--once")
        .write_stdin("this is not json\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"ok\":false"))
        .stdout(predicate::str::contains("\"code\":3"));
}
