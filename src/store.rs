//! # Store — Durable Storage Seams
//!
//! Traits consumed by the services. Each method is one round trip to the
//! store; anything that must be atomic is a single method here so the store
//! can evaluate it as one conditional write.
//!
//! - [`RideStore`] — ride rows with an indexed pickup point and the
//!   conditional transition write.
//! - [`PresenceStore`] — one presence row per driver.
//! - [`OtpAuditStore`] — durable OTP audit copies with predicate updates.
//!
//! Services wrap every call in [`bounded`] so a hung store surfaces as
//! `TransientStore` instead of blocking the caller.

use crate::error::{Error, Result};
use crate::geo::GeoPoint;
use crate::otp::{NewOtpRecord, OtpRecord};
use crate::presence::DriverPresence;
use crate::principal::Principal;
use crate::ride::{NewRide, Ride, Transition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

/// Run a store call with a deadline; an elapsed deadline is a transient error.
pub async fn bounded<T, F>(timeout: Duration, op: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::transient(format!(
            "{} timed out after {}ms",
            op,
            timeout.as_millis()
        ))),
    }
}

/// Query for open rides near a point.
#[derive(Debug, Clone, Copy)]
pub struct OpenRideQuery {
    pub center: GeoPoint,
    pub radius_m: f64,
    pub limit: usize,
    /// Rides last updated before this instant are excluded.
    pub updated_since: DateTime<Utc>,
}

#[async_trait]
pub trait RideStore: Send + Sync {
    async fn insert_ride(&self, ride: NewRide) -> Result<Ride>;

    async fn get_ride(&self, ride_id: i64) -> Result<Option<Ride>>;

    /// Open rides within the radius, fresh, nearest pickup first, paired with
    /// the pickup distance in meters.
    async fn nearby_open_rides(&self, query: OpenRideQuery) -> Result<Vec<(Ride, f64)>>;

    /// Apply `transition` for `actor` in one conditional write. Returns the
    /// updated ride, or `None` when the ride's current state did not satisfy
    /// the transition's precondition (including when it does not exist).
    async fn apply_transition(
        &self,
        ride_id: i64,
        transition: Transition,
        actor: &Principal,
        now: DateTime<Utc>,
    ) -> Result<Option<Ride>>;

    /// Rides where the principal is the customer or the assigned driver,
    /// newest first.
    async fn rides_for(&self, principal: &Principal, limit: usize) -> Result<Vec<Ride>>;
}

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Mark the driver online at `point` as of `now`, creating the row if needed.
    async fn upsert_presence(&self, driver_id: i64, point: GeoPoint, now: DateTime<Utc>)
        -> Result<()>;

    async fn set_offline(&self, driver_id: i64, now: DateTime<Utc>) -> Result<()>;

    async fn get_presence(&self, driver_id: i64) -> Result<Option<DriverPresence>>;

    /// Presence rows for the given ids; unknown ids are simply absent.
    async fn get_presences(&self, driver_ids: &[i64]) -> Result<Vec<DriverPresence>>;

    /// Delete rows whose last ping is older than `cutoff`; returns the count.
    async fn delete_stale_presence(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait OtpAuditStore: Send + Sync {
    async fn insert_otp(&self, record: NewOtpRecord) -> Result<OtpRecord>;

    /// Mark the most recent unverified, unexpired record for `phone` carrying
    /// `code` as verified. Returns whether a record matched.
    async fn mark_otp_verified(&self, phone: &str, code: &str, now: DateTime<Utc>)
        -> Result<bool>;

    /// Mark every outstanding (unverified, unexpired) record for `phone` as
    /// expired; returns the count.
    async fn expire_outstanding_otps(&self, phone: &str) -> Result<u64>;

    async fn otp_history(&self, phone: &str, limit: usize) -> Result<Vec<OtpRecord>>;

    /// Remove records whose expiry is before `older_than`; returns the count.
    async fn purge_expired_otps(&self, older_than: DateTime<Utc>) -> Result<u64>;
}
