//! Driver presence rows and the driver location index.
//!
//! Presence rows are upserted on every ping; staleness is never written,
//! only computed by readers. `driver_locations` backs the [`GeoIndex`] used
//! for nearest-driver lookups.

use super::{geog_point, Database};
use crate::error::Result;
use crate::geo::{GeoFilter, GeoHit, GeoIndex, GeoPoint};
use crate::presence::DriverPresence;
use crate::store::PresenceStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

const PRESENCE_COLUMNS: &str = "driver_id, online, lat, lng, last_ping_at, went_online_at";

#[derive(sqlx::FromRow)]
struct PresenceRow {
    driver_id: i64,
    online: bool,
    lat: f64,
    lng: f64,
    last_ping_at: DateTime<Utc>,
    went_online_at: DateTime<Utc>,
}

impl From<PresenceRow> for DriverPresence {
    fn from(row: PresenceRow) -> Self {
        DriverPresence {
            driver_id: row.driver_id,
            online: row.online,
            point: GeoPoint {
                lat: row.lat,
                lng: row.lng,
            },
            last_ping_at: row.last_ping_at,
            went_online_at: row.went_online_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LocationRow {
    owner_id: i64,
    lat: f64,
    lng: f64,
    updated_at: DateTime<Utc>,
    distance_m: f64,
}

impl From<LocationRow> for GeoHit {
    fn from(row: LocationRow) -> Self {
        GeoHit {
            owner_id: row.owner_id,
            point: GeoPoint {
                lat: row.lat,
                lng: row.lng,
            },
            distance_m: row.distance_m,
            updated_at: row.updated_at,
        }
    }
}

#[async_trait]
impl PresenceStore for Database {
    async fn upsert_presence(&self, driver_id: i64, point: GeoPoint, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO driver_presence (driver_id, online, lat, lng, last_ping_at, went_online_at)
             VALUES ($1, TRUE, $2, $3, $4, $4)
             ON CONFLICT (driver_id) DO UPDATE SET
               went_online_at = CASE WHEN driver_presence.online
                                     THEN driver_presence.went_online_at
                                     ELSE EXCLUDED.went_online_at END,
               online = TRUE, lat = EXCLUDED.lat, lng = EXCLUDED.lng,
               last_ping_at = EXCLUDED.last_ping_at",
        )
        .bind(driver_id)
        .bind(point.lat)
        .bind(point.lng)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_offline(&self, driver_id: i64, _now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE driver_presence SET online = FALSE WHERE driver_id = $1")
            .bind(driver_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_presence(&self, driver_id: i64) -> Result<Option<DriverPresence>> {
        let sql = format!(
            "SELECT {} FROM driver_presence WHERE driver_id = $1",
            PRESENCE_COLUMNS
        );
        let row = sqlx::query_as::<_, PresenceRow>(&sql)
            .bind(driver_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(DriverPresence::from))
    }

    async fn get_presences(&self, driver_ids: &[i64]) -> Result<Vec<DriverPresence>> {
        let sql = format!(
            "SELECT {} FROM driver_presence WHERE driver_id = ANY($1)",
            PRESENCE_COLUMNS
        );
        let rows = sqlx::query_as::<_, PresenceRow>(&sql)
            .bind(driver_ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(DriverPresence::from).collect())
    }

    async fn delete_stale_presence(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM driver_presence WHERE last_ping_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl GeoIndex for Database {
    async fn upsert(&self, owner_id: i64, point: GeoPoint, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO driver_locations (owner_id, lat, lng, updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (owner_id) DO UPDATE SET
               lat = EXCLUDED.lat, lng = EXCLUDED.lng, updated_at = EXCLUDED.updated_at",
        )
        .bind(owner_id)
        .bind(point.lat)
        .bind(point.lng)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query(
        &self,
        center: GeoPoint,
        radius_m: f64,
        limit: usize,
        filter: GeoFilter,
    ) -> Result<Vec<GeoHit>> {
        let center_sql = geog_point(1, 2);
        let sql = format!(
            "SELECT owner_id, lat, lng, updated_at, ST_Distance(location, {c}) AS distance_m
             FROM driver_locations
             WHERE ST_DWithin(location, {c}, $3)
               AND ($5::timestamptz IS NULL OR updated_at >= $5)
             ORDER BY distance_m ASC, owner_id ASC
             LIMIT $4",
            c = center_sql
        );
        let rows = sqlx::query_as::<_, LocationRow>(&sql)
            .bind(center.lat)
            .bind(center.lng)
            .bind(radius_m)
            .bind(limit as i64)
            .bind(filter.fresh_since)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(GeoHit::from).collect())
    }

    async fn locate(&self, owner_id: i64) -> Result<Option<GeoHit>> {
        let row = sqlx::query_as::<_, LocationRow>(
            "SELECT owner_id, lat, lng, updated_at, 0::float8 AS distance_m
             FROM driver_locations WHERE owner_id = $1",
        )
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(GeoHit::from))
    }
}
