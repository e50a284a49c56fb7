//! CLI integration tests using assert_cmd.
//!
//! None of these need a database: they cover help output, config handling
//! and argument validation.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

#[allow(deprecated)]
fn ride_engine() -> Command {
    let mut cmd = Command::cargo_bin("ride-engine").unwrap();
    cmd.env_remove("DATABASE_URL")
        .env_remove("RIDE_ENGINE_CONFIG");
    cmd
}

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    f
}

// --- Help ---

#[test]
fn help_shows_all_subcommands() {
    ride_engine().arg("--help").assert().success().stdout(
        predicate::str::contains("migrate")
            .and(predicate::str::contains("sweep"))
            .and(predicate::str::contains("check-config"))
            .and(predicate::str::contains("otp-history")),
    );
}

#[test]
fn help_sweep_shows_args() {
    ride_engine()
        .args(["sweep", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--once").and(predicate::str::contains("--interval-secs")));
}

#[test]
fn unknown_subcommand_fails() {
    ride_engine().arg("dispatch").assert().failure();
}

// --- Config ---

#[test]
fn check_config_prints_defaults() {
    ride_engine()
        .arg("check-config")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("presence_window_secs = 120")
                .and(predicate::str::contains("ride_freshness_secs = 300"))
                .and(predicate::str::contains("otp_ttl_secs = 120")),
        );
}

#[test]
fn check_config_applies_file_overrides() {
    let f = config_file("presence_window_secs = 30\notp_fixed_code = \"123456\"\n");
    ride_engine()
        .arg("--config")
        .arg(f.path())
        .arg("check-config")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("presence_window_secs = 30")
                .and(predicate::str::contains("otp_fixed_code = \"123456\"")),
        );
}

#[test]
fn check_config_rejects_invalid_values() {
    let f = config_file("store_timeout_ms = 0\n");
    ride_engine()
        .arg("--config")
        .arg(f.path())
        .arg("check-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("store_timeout_ms must be greater than zero"));
}

#[test]
fn check_config_rejects_unknown_keys() {
    let f = config_file("presense_window_secs = 30\n");
    ride_engine()
        .arg("--config")
        .arg(f.path())
        .arg("check-config")
        .assert()
        .failure();
}

#[test]
fn missing_config_file_fails() {
    ride_engine()
        .args(["--config", "/nonexistent/ride-engine.toml", "check-config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("reading config"));
}

// --- Connection requirements ---

#[test]
fn migrate_requires_database_url() {
    ride_engine()
        .arg("migrate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("DATABASE_URL is required"));
}

#[test]
fn otp_history_requires_phone() {
    ride_engine()
        .arg("otp-history")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--phone"));
}

#[test]
fn sweep_requires_database_url() {
    ride_engine()
        .args(["sweep", "--once"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("DATABASE_URL is required"));
}

#[test]
fn sweep_needs_no_redis_or_signing_secret() {
    // Gets as far as parsing the database URL.
    ride_engine()
        .args(["--database-url", "not a url", "sweep", "--once"])
        .assert()
        .failure()
        .stderr(
            predicate::str::contains("invalid database URL")
                .and(predicate::str::contains("REDIS_URL").not())
                .and(predicate::str::contains("JWT_SECRET").not()),
        );
}

#[test]
fn sweep_rejects_zero_interval() {
    ride_engine()
        .args([
            "--database-url",
            "not a url",
            "sweep",
            "--interval-secs",
            "0",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--interval-secs must be greater than zero"));
}
