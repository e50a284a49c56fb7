//! # Geo — Points, Distances and the GeoIndex Seam
//!
//! `GeoPoint` is the validated lat/lng pair every core operation accepts.
//! `GeoIndex` is the contract consumed by presence tracking: upsert an owner's
//! point, then ask for owners within a radius, nearest first, optionally
//! restricted to points refreshed after a cutoff.
//!
//! The PostGIS implementation lives in [`crate::db`]; [`crate::memory`] has an
//! in-process one built on [`haversine_m`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters (same sphere PostGIS uses for `geography`
/// distance on the fast path).
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    /// Build a point, rejecting out-of-range or non-finite coordinates.
    pub fn new(lat: f64, lng: f64) -> Result<Self> {
        let p = GeoPoint { lat, lng };
        p.validate()?;
        Ok(p)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(Error::validation(format!(
                "latitude {} outside [-90, 90]",
                self.lat
            )));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(Error::validation(format!(
                "longitude {} outside [-180, 180]",
                self.lng
            )));
        }
        Ok(())
    }

    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        haversine_m(self, other)
    }
}

/// Great-circle distance between two points in meters.
pub fn haversine_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Radius must be a positive, finite number of meters.
pub fn validate_radius(radius_m: f64) -> Result<()> {
    if !radius_m.is_finite() || radius_m <= 0.0 {
        return Err(Error::validation(format!(
            "radius {} must be a positive number of meters",
            radius_m
        )));
    }
    Ok(())
}

/// Extra predicate combined with the radius search.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoFilter {
    /// Only points upserted at or after this instant.
    pub fresh_since: Option<DateTime<Utc>>,
}

/// One match from a radius query.
#[derive(Debug, Clone, Serialize)]
pub struct GeoHit {
    pub owner_id: i64,
    pub point: GeoPoint,
    pub distance_m: f64,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait GeoIndex: Send + Sync {
    /// Insert or move the owner's point.
    async fn upsert(&self, owner_id: i64, point: GeoPoint, at: DateTime<Utc>) -> Result<()>;

    /// Owners within `radius_m` of `center`, nearest first, at most `limit`.
    /// No match is an empty vector.
    async fn query(
        &self,
        center: GeoPoint,
        radius_m: f64,
        limit: usize,
        filter: GeoFilter,
    ) -> Result<Vec<GeoHit>>;

    /// Most recent point for one owner, if any (`distance_m` is 0).
    async fn locate(&self, owner_id: i64) -> Result<Option<GeoHit>>;
}
