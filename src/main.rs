//! # Main — CLI Entry Point for Operating the Ride Core
//!
//! The coordination core is a library; this binary covers the operational
//! chores around it.
//!
//! ## Subcommands
//!
//! - `migrate`: apply schema migrations to PostgreSQL.
//! - `sweep`: presence compaction plus OTP audit purge, once or on an interval.
//! - `check-config`: load, validate and print the effective core config.
//! - `otp-history`: print the OTP audit trail for a phone number as JSON.
//!
//! ## Global Options
//!
//! - `--config`: TOML file with core tuning knobs (defaults otherwise).
//! - `--database-url` / `DATABASE_URL`: PostgreSQL connection.
//!
//! Every subcommand works on Postgres alone. Redis and the session signing
//! secret are only needed by services embedding [`ride_engine::RideEngine`].

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ride-engine", about = "Ride matching and lifecycle coordination core")]
struct Cli {
    /// Core config TOML (windows, TTLs, timeouts)
    #[arg(long, env = "RIDE_ENGINE_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL connection URL (or set DATABASE_URL env var)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,
    /// Delete stale presence rows and purge old OTP audit records
    Sweep {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
        /// Seconds between passes (defaults to sweep_interval_secs from config)
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Validate the core config and print the effective values
    CheckConfig,
    /// Show OTP audit records for a phone number, newest first
    OtpHistory {
        /// Phone number
        #[arg(long)]
        phone: String,
        /// Maximum records to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Initialize structured logging: LOG_FORMAT=json for log shippers, human-readable otherwise
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();

    match &cli.command {
        Commands::CheckConfig => cli::run_check_config(&cli),
        Commands::Migrate => cli::run_migrate(&cli),
        Commands::Sweep {
            once,
            interval_secs,
        } => cli::run_sweep(&cli, *once, *interval_secs),
        Commands::OtpHistory { phone, limit } => cli::run_otp_history(&cli, phone, *limit),
    }
}
