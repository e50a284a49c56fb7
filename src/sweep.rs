//! Periodic compaction: stale presence rows and OTP audit records past
//! retention. Needs only the durable stores, so a sweep job can run with a
//! database connection and nothing else.

use crate::clock::{Clock, SystemClock};
use crate::config::CoreConfig;
use crate::db::Database;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::presence::PresenceTracker;
use crate::store::{bounded, OtpAuditStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Counts from one compaction pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SweepReport {
    pub presence_removed: u64,
    pub otps_purged: u64,
}

pub struct Sweeper {
    presence: Arc<PresenceTracker>,
    otp_audit: Arc<dyn OtpAuditStore>,
    clock: Arc<dyn Clock>,
    retention: chrono::Duration,
    timeout: Duration,
}

impl Sweeper {
    pub fn new(
        presence: Arc<PresenceTracker>,
        otp_audit: Arc<dyn OtpAuditStore>,
        clock: Arc<dyn Clock>,
        config: &CoreConfig,
    ) -> Self {
        Sweeper {
            presence,
            otp_audit,
            clock,
            retention: config.otp_retention(),
            timeout: config.store_timeout(),
        }
    }

    /// Sweeper over Postgres alone.
    pub fn on_database(config: &CoreConfig, database: Arc<Database>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let presence = Arc::new(PresenceTracker::new(
            database.clone(),
            database.clone(),
            clock.clone(),
            Arc::new(Metrics::new()),
            config.presence_window(),
            config.store_timeout(),
        ));
        Sweeper::new(presence, database, clock, config)
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        let presence_removed = self.presence.sweep().await?;
        let older_than = self.clock.now() - self.retention;
        let otps_purged = bounded(
            self.timeout,
            "purge_expired_otps",
            self.otp_audit.purge_expired_otps(older_than),
        )
        .await?;
        Ok(SweepReport {
            presence_removed,
            otps_purged,
        })
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the handle is aborted.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.sweep().await {
                    Ok(report) => info!(
                        presence_removed = report.presence_removed,
                        otps_purged = report.otps_purged,
                        "sweep complete"
                    ),
                    Err(e) => warn!(error = %e, "sweep failed"),
                }
            }
        })
    }
}
