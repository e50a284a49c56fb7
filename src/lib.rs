//! # ride-engine — Ride Matching and Lifecycle Coordination Core
//!
//! Customers request rides, nearby drivers discover and accept them, and the
//! ride moves through its lifecycle. Alongside: driver presence, OTP login
//! and pinned sessions.
//!
//! | Service | Module | Stores |
//! |---------|--------|--------|
//! | Ride lifecycle + discovery | [`lifecycle`] | [`store::RideStore`] |
//! | Driver presence | [`presence`] | [`store::PresenceStore`], [`geo::GeoIndex`] |
//! | OTP | [`otp`] | [`kv::FastKv`], [`store::OtpAuditStore`] |
//! | Sessions | [`session`] | [`kv::FastKv`] |
//! | Compaction | [`sweep`] | [`store::PresenceStore`], [`store::OtpAuditStore`] |
//!
//! Backends: PostgreSQL/PostGIS ([`db::Database`]) and Redis
//! ([`kv::RedisKv`]) in production; [`memory`] for tests and embedding.
//! [`RideEngine`] wires one of each.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod geo;
pub mod kv;
pub mod lifecycle;
pub mod memory;
pub mod metrics;
pub mod otp;
pub mod presence;
pub mod principal;
pub mod ride;
pub mod session;
pub mod store;
pub mod sweep;

pub use error::{Error, Result};
pub use principal::{Principal, Role};
pub use sweep::{SweepReport, Sweeper};

use clock::Clock;
use config::CoreConfig;
use geo::GeoIndex;
use kv::FastKv;
use lifecycle::RideLifecycle;
use metrics::Metrics;
use otp::OtpAuthenticator;
use presence::PresenceTracker;
use session::{JwtSigner, SessionRegistry, TokenSigner};
use std::sync::Arc;
use std::time::Duration;
use store::{OtpAuditStore, PresenceStore, RideStore};
use tracing::info;

/// Backends a [`RideEngine`] runs on.
pub struct Backends {
    pub rides: Arc<dyn RideStore>,
    pub presence: Arc<dyn PresenceStore>,
    pub geo: Arc<dyn GeoIndex>,
    pub otp_audit: Arc<dyn OtpAuditStore>,
    pub kv: Arc<dyn FastKv>,
    pub signer: Arc<dyn TokenSigner>,
    pub clock: Arc<dyn Clock>,
}

pub struct RideEngine {
    pub config: CoreConfig,
    pub metrics: Arc<Metrics>,
    pub presence: Arc<PresenceTracker>,
    pub lifecycle: RideLifecycle,
    pub otp: OtpAuthenticator,
    pub sessions: SessionRegistry,
    sweeper: Arc<Sweeper>,
}

impl RideEngine {
    /// Wire the services over `backends`. Fails on an invalid config.
    pub fn new(config: CoreConfig, backends: Backends) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::validation(e.to_string()))?;
        let metrics = Arc::new(Metrics::new());
        let timeout = config.store_timeout();
        let presence = Arc::new(PresenceTracker::new(
            backends.presence,
            backends.geo,
            backends.clock.clone(),
            metrics.clone(),
            config.presence_window(),
            timeout,
        ));
        let lifecycle = RideLifecycle::new(
            backends.rides,
            presence.clone(),
            backends.clock.clone(),
            metrics.clone(),
            config.ride_freshness(),
            timeout,
        );
        let sweeper = Arc::new(Sweeper::new(
            presence.clone(),
            backends.otp_audit.clone(),
            backends.clock.clone(),
            &config,
        ));
        let otp = OtpAuthenticator::new(
            backends.kv.clone(),
            backends.otp_audit,
            backends.clock.clone(),
            metrics.clone(),
            &config,
        );
        let sessions = SessionRegistry::new(
            backends.signer,
            backends.kv,
            backends.clock.clone(),
            metrics.clone(),
            timeout,
        );
        Ok(RideEngine {
            config,
            metrics,
            presence,
            lifecycle,
            otp,
            sessions,
            sweeper,
        })
    }

    /// Postgres + Redis backends. Migrations are not applied here.
    pub async fn connect(
        config: CoreConfig,
        database_url: &str,
        redis_url: &str,
        jwt_secret: &str,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let database = Arc::new(db::Database::connect(database_url).await?);
        let kv = Arc::new(kv::RedisKv::connect(redis_url).await?);
        let signer = Arc::new(JwtSigner::new(jwt_secret.as_bytes())?);
        info!("connected to postgres and redis");
        Ok(Self::new(
            config,
            Backends {
                rides: database.clone(),
                presence: database.clone(),
                geo: database.clone(),
                otp_audit: database,
                kv,
                signer,
                clock: Arc::new(clock::SystemClock),
            },
        )?)
    }

    /// Everything in process, signed with a random per-engine secret.
    pub fn in_memory(config: CoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = Arc::new(memory::MemoryStore::new());
        let kv = Arc::new(memory::MemoryKv::new(clock.clone()));
        let signer = Arc::new(JwtSigner::random());
        Self::new(
            config,
            Backends {
                rides: store.clone(),
                presence: store.clone(),
                geo: store.clone(),
                otp_audit: store,
                kv,
                signer,
                clock,
            },
        )
    }

    /// Delete stale presence rows and OTP audit records past retention.
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweeper.sweep().await
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the handle is aborted.
    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        self.sweeper.clone().spawn(interval)
    }
}
