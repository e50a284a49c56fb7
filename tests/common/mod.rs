//! Shared test helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use ride_engine::clock::ManualClock;
use ride_engine::config::CoreConfig;
use ride_engine::db::Database;
use ride_engine::error::{Error, Result};
use ride_engine::geo::GeoPoint;
use ride_engine::kv::FastKv;
use ride_engine::RideEngine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Customer pickup used across the Dhaka scenarios.
pub const PICKUP: GeoPoint = GeoPoint {
    lat: 23.8103,
    lng: 90.4125,
};
pub const DROPOFF: GeoPoint = GeoPoint {
    lat: 23.7509,
    lng: 90.3935,
};
/// Where the browsing drivers stand, ~60 m from the pickup.
pub const DRIVER_SPOT: GeoPoint = GeoPoint {
    lat: 23.8100,
    lng: 90.4120,
};

/// In-memory engine on a manual clock.
pub fn memory_engine() -> (RideEngine, Arc<ManualClock>) {
    memory_engine_with(CoreConfig::default())
}

pub fn memory_engine_with(config: CoreConfig) -> (RideEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let engine = RideEngine::in_memory(config, clock.clone()).unwrap();
    (engine, clock)
}

/// [`FastKv`] whose calls fail while `down` is set, delegating otherwise.
pub struct FlakyKv {
    inner: Arc<dyn FastKv>,
    down: AtomicBool,
}

impl FlakyKv {
    pub fn new(inner: Arc<dyn FastKv>) -> Self {
        FlakyKv {
            inner,
            down: AtomicBool::new(false),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::transient("kv unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl FastKv for FlakyKv {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;
        self.inner.delete(key).await
    }
}

/// Returns the test database URL from the `TEST_DATABASE_URL` environment variable.
/// Panics if the variable is not set.
pub fn test_db_url() -> String {
    std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set for integration tests")
}

/// Returns true if the test database URL is configured.
pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

pub fn test_redis_url() -> String {
    std::env::var("TEST_REDIS_URL").expect("TEST_REDIS_URL must be set for redis tests")
}

pub fn has_test_redis() -> bool {
    std::env::var("TEST_REDIS_URL").is_ok()
}

/// One-time schema initialization.
static SCHEMA_INIT: OnceCell<()> = OnceCell::const_new();

/// Ensure the test database schema is set up (runs migrations once per test binary).
pub async fn ensure_schema() {
    SCHEMA_INIT
        .get_or_init(|| async {
            let db = Database::connect(&test_db_url()).await.unwrap();
            db.migrate().await.unwrap();
        })
        .await;
}

/// Connect to the test database (also ensures schema is set up).
pub async fn setup_test_db() -> Database {
    ensure_schema().await;
    let db = Database::connect(&test_db_url())
        .await
        .expect("Failed to connect to test database");
    truncate_all_tables(db.pool()).await;
    db
}

/// Truncate all tables to ensure test isolation.
pub async fn truncate_all_tables(pool: &sqlx::PgPool) {
    sqlx::raw_sql(
        "TRUNCATE TABLE rides, driver_presence, driver_locations, otp_records
         RESTART IDENTITY CASCADE",
    )
    .execute(pool)
    .await
    .unwrap();
}
