//! # Config — Core Tuning Knobs
//!
//! Windows, TTLs and timeouts for the coordination core. Loaded from an
//! optional TOML file; every field has a default so an empty file (or no
//! file) yields a working configuration.
//!
//! ```toml
//! presence_window_secs = 120
//! ride_freshness_secs = 300
//! otp_ttl_secs = 120
//! otp_code_length = 6
//! session_ttl_secs = 86400
//! store_timeout_ms = 2000
//! ```
//!
//! Connection strings and secrets are not part of this file; the binary takes
//! them from flags / environment.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default page size for proximity discovery.
pub const NEARBY_DEFAULT_LIMIT: usize = 50;
/// Hard cap for proximity discovery.
pub const NEARBY_MAX_LIMIT: usize = 100;
/// Defaults for nearest-driver lookups.
pub const NEAREST_DRIVERS_DEFAULT_RADIUS_M: f64 = 3000.0;
pub const NEAREST_DRIVERS_DEFAULT_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// A driver is online only if pinged within this many seconds.
    pub presence_window_secs: u64,
    /// Open rides not updated within this many seconds are hidden from discovery.
    pub ride_freshness_secs: u64,
    /// Lifetime of an issued OTP, fast path and audit copy alike.
    pub otp_ttl_secs: u64,
    pub otp_code_length: usize,
    /// Issue this code instead of a random one (development environments).
    pub otp_fixed_code: Option<String>,
    /// Audit rows whose expiry is older than this are purged by the sweep.
    pub otp_retention_hours: u64,
    pub session_ttl_secs: u64,
    /// Deadline for every individual store call.
    pub store_timeout_ms: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            presence_window_secs: 120,
            ride_freshness_secs: 300,
            otp_ttl_secs: 120,
            otp_code_length: 6,
            otp_fixed_code: None,
            otp_retention_hours: 24,
            session_ttl_secs: 86_400,
            store_timeout_ms: 2000,
            sweep_interval_secs: 60,
        }
    }
}

impl CoreConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: CoreConfig = toml::from_str(s).context("invalid core config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    /// Load `path` if given, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let windows = [
            ("presence_window_secs", self.presence_window_secs),
            ("ride_freshness_secs", self.ride_freshness_secs),
            ("otp_ttl_secs", self.otp_ttl_secs),
            ("session_ttl_secs", self.session_ttl_secs),
            ("store_timeout_ms", self.store_timeout_ms),
            ("sweep_interval_secs", self.sweep_interval_secs),
        ];
        for (name, value) in windows {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        if !(4..=10).contains(&self.otp_code_length) {
            bail!(
                "otp_code_length must be between 4 and 10, got {}",
                self.otp_code_length
            );
        }
        if let Some(code) = &self.otp_fixed_code {
            if code.len() != self.otp_code_length || !code.chars().all(|c| c.is_ascii_digit()) {
                bail!(
                    "otp_fixed_code must be {} ASCII digits",
                    self.otp_code_length
                );
            }
        }
        Ok(())
    }

    pub fn presence_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.presence_window_secs as i64)
    }

    pub fn ride_freshness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ride_freshness_secs as i64)
    }

    pub fn otp_ttl(&self) -> Duration {
        Duration::from_secs(self.otp_ttl_secs)
    }

    pub fn otp_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.otp_retention_hours as i64)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
