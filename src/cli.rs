//! # CLI Execution Functions
//!
//! Execution logic for each subcommand, kept out of `main.rs`.

use anyhow::Result;
use ride_engine::config::CoreConfig;
use ride_engine::db::Database;
use ride_engine::store::OtpAuditStore;
use ride_engine::Sweeper;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::Cli;

fn load_config(cli: &Cli) -> Result<CoreConfig> {
    CoreConfig::load_or_default(cli.config.as_deref())
}

fn require<'a>(value: &'a Option<String>, name: &str, flag: &str) -> Result<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("{} is required (set via {} or env)", name, flag))
}

// ── Config ──────────────────────────────────────────────────────

pub fn run_check_config(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

// ── Database ────────────────────────────────────────────────────

pub fn run_migrate(cli: &Cli) -> Result<()> {
    let database_url = require(&cli.database_url, "DATABASE_URL", "--database-url")?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let database = Database::connect(database_url).await?;
        let applied = database.migrate().await?;
        if applied.is_empty() {
            info!("schema up to date");
        } else {
            info!(count = applied.len(), "migrations applied");
        }
        Ok(())
    })
}

pub fn run_otp_history(cli: &Cli, phone: &str, limit: usize) -> Result<()> {
    let database_url = require(&cli.database_url, "DATABASE_URL", "--database-url")?;
    let rt = tokio::runtime::Runtime::new()?;
    let records = rt.block_on(async {
        let database = Database::connect(database_url).await?;
        let records = database.otp_history(phone, limit.max(1)).await?;
        anyhow::Ok(records)
    })?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

// ── Sweep ───────────────────────────────────────────────────────

pub fn run_sweep(cli: &Cli, once: bool, interval_secs: Option<u64>) -> Result<()> {
    let config = load_config(cli)?;
    let database_url = require(&cli.database_url, "DATABASE_URL", "--database-url")?;
    let interval = interval_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.sweep_interval());
    if interval.is_zero() {
        anyhow::bail!("--interval-secs must be greater than zero");
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let database = Arc::new(Database::connect(database_url).await?);
        let sweeper = Arc::new(Sweeper::on_database(&config, database));

        if once {
            let report = sweeper.sweep().await?;
            info!(
                presence_removed = report.presence_removed,
                otps_purged = report.otps_purged,
                "sweep complete"
            );
            println!("{}", serde_json::to_string(&report)?);
            return Ok(());
        }

        info!(interval_secs = interval.as_secs(), "sweeper running, ctrl-c to stop");
        let handle = sweeper.spawn(interval);
        tokio::signal::ctrl_c().await?;
        warn!("shutting down sweeper");
        handle.abort();
        Ok(())
    })
}
