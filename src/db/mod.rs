//! # Database — PostgreSQL/PostGIS Storage Layer
//!
//! Implements the durable store traits over `sqlx::PgPool`.
//!
//! ## Schema
//!
//! - `rides`: ride rows with a generated `geography` pickup column (GiST)
//! - `driver_presence`: one row per driver, online flag and last ping
//! - `driver_locations`: driver points for radius queries (GiST)
//! - `otp_records`: durable OTP audit copies
//!
//! ## Module Structure
//!
//! - [`rides`] — [`RideStore`](crate::store::RideStore): insert, proximity
//!   query, conditional transitions
//! - [`presence`] — [`PresenceStore`](crate::store::PresenceStore) and the
//!   driver [`GeoIndex`](crate::geo::GeoIndex)
//! - [`otp`] — [`OtpAuditStore`](crate::store::OtpAuditStore)
//!
//! Every query takes `now` from the caller's clock rather than `NOW()`, so
//! freshness and expiry agree with the in-memory backend.

mod otp;
mod presence;
mod rides;

use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::info;

/// Schema migrations, applied in order and recorded in `schema_migrations`.
const MIGRATIONS: &[(&str, &str)] = &[
    ("001_rides", include_str!("../../migrations/001_rides.sql")),
    ("002_presence", include_str!("../../migrations/002_presence.sql")),
    ("003_otp", include_str!("../../migrations/003_otp.sql")),
];

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL using the provided database URL.
    ///
    /// Credentials are percent-decoded by hand so pooler usernames with
    /// dots and passwords with reserved characters survive intact.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let url = url::Url::parse(database_url).context("invalid database URL")?;
        let username = urlencoding::decode(url.username())?.into_owned();
        let password = url
            .password()
            .map(|p| urlencoding::decode(p).map(|s| s.into_owned()))
            .transpose()?;
        let mut opts = PgConnectOptions::new()
            .host(url.host_str().unwrap_or("localhost"))
            .port(url.port().unwrap_or(5432))
            .database(url.path().trim_start_matches('/'))
            .username(&username);
        if let Some(ref pw) = password {
            opts = opts.password(pw);
        }
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_with(opts)
            .await?;
        Ok(Database { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Database { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations. Returns the names of the ones applied now.
    pub async fn migrate(&self) -> Result<Vec<&'static str>> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
               version TEXT PRIMARY KEY,
               applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
             )",
        )
        .execute(&self.pool)
        .await?;

        let mut applied = Vec::new();
        for (version, sql) in MIGRATIONS {
            let mut tx = self.pool.begin().await?;
            let done: Option<String> =
                sqlx::query_scalar("SELECT version FROM schema_migrations WHERE version = $1")
                    .bind(version)
                    .fetch_optional(&mut *tx)
                    .await?;
            if done.is_some() {
                continue;
            }
            sqlx::raw_sql(sql)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("applying migration {}", version))?;
            sqlx::query("INSERT INTO schema_migrations (version) VALUES ($1)")
                .bind(version)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            info!(version, "applied migration");
            applied.push(*version);
        }
        Ok(applied)
    }

    /// Health check: execute `SELECT 1` to verify database connectivity.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

/// SQL for a `geography` point from `(lat, lng)` bind positions.
pub(crate) fn geog_point(lat_param: u8, lng_param: u8) -> String {
    format!(
        "ST_SetSRID(ST_MakePoint(${}, ${}), 4326)::geography",
        lng_param, lat_param
    )
}
