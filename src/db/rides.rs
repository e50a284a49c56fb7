//! Ride rows: insert, proximity discovery, conditional transitions.
//!
//! Each transition is a single `UPDATE … WHERE <precondition> RETURNING`.
//! Postgres row locking serialises concurrent writers, and the loser's
//! re-evaluated predicate no longer matches, so it gets zero rows back.

use super::{geog_point, Database};
use crate::error::{Error, Result};
use crate::geo::GeoPoint;
use crate::principal::{Principal, Role};
use crate::ride::{NewRide, Ride, Transition};
use crate::store::{OpenRideQuery, RideStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

const RIDE_COLUMNS: &str = "id, customer_id, driver_id, pickup_lat, pickup_lng, \
     dropoff_lat, dropoff_lng, status, fare, requested_at, accepted_at, started_at, \
     completed_at, cancelled_at, updated_at";

#[derive(sqlx::FromRow)]
struct RideRow {
    id: i64,
    customer_id: i64,
    driver_id: Option<i64>,
    pickup_lat: f64,
    pickup_lng: f64,
    dropoff_lat: f64,
    dropoff_lng: f64,
    status: String,
    fare: Option<f64>,
    requested_at: DateTime<Utc>,
    accepted_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RideRow> for Ride {
    type Error = Error;

    fn try_from(row: RideRow) -> Result<Ride> {
        Ok(Ride {
            id: row.id,
            customer_id: row.customer_id,
            driver_id: row.driver_id,
            pickup: GeoPoint {
                lat: row.pickup_lat,
                lng: row.pickup_lng,
            },
            dropoff: GeoPoint {
                lat: row.dropoff_lat,
                lng: row.dropoff_lng,
            },
            status: row.status.parse()?,
            fare: row.fare,
            requested_at: row.requested_at,
            accepted_at: row.accepted_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            cancelled_at: row.cancelled_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct NearbyRow {
    #[sqlx(flatten)]
    ride: RideRow,
    distance_m: f64,
}

/// `SET` and extra `WHERE` clauses for a transition; `$1` is the ride id,
/// `$2` the actor id, `$3` the timestamp.
fn transition_sql(transition: Transition, actor: &Principal) -> (&'static str, &'static str) {
    match (transition, actor.role) {
        (Transition::Accept, _) => (
            "status = 'accepted', driver_id = $2, accepted_at = $3, updated_at = $3",
            "status IN ('requested', 'pending')",
        ),
        (Transition::Start, _) => (
            "status = 'started', started_at = $3, updated_at = $3",
            "status = 'accepted' AND driver_id = $2",
        ),
        (Transition::Complete, _) => (
            "status = 'completed', completed_at = $3, updated_at = $3",
            "status = 'started' AND driver_id = $2",
        ),
        (Transition::Cancel, Role::Customer) => (
            "status = 'cancelled', driver_id = NULL, cancelled_at = $3, updated_at = $3",
            "status NOT IN ('completed', 'cancelled') AND customer_id = $2",
        ),
        (Transition::Cancel, Role::Driver) => (
            "status = 'cancelled', driver_id = NULL, cancelled_at = $3, updated_at = $3",
            "status NOT IN ('completed', 'cancelled') AND driver_id = $2",
        ),
    }
}

#[async_trait]
impl RideStore for Database {
    async fn insert_ride(&self, ride: NewRide) -> Result<Ride> {
        let sql = format!(
            "INSERT INTO rides (customer_id, pickup_lat, pickup_lng, dropoff_lat, dropoff_lng,
                                status, requested_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, 'requested', $6, $6)
             RETURNING {}",
            RIDE_COLUMNS
        );
        let row = sqlx::query_as::<_, RideRow>(&sql)
            .bind(ride.customer_id)
            .bind(ride.pickup.lat)
            .bind(ride.pickup.lng)
            .bind(ride.dropoff.lat)
            .bind(ride.dropoff.lng)
            .bind(ride.requested_at)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn get_ride(&self, ride_id: i64) -> Result<Option<Ride>> {
        let sql = format!("SELECT {} FROM rides WHERE id = $1", RIDE_COLUMNS);
        let row = sqlx::query_as::<_, RideRow>(&sql)
            .bind(ride_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Ride::try_from).transpose()
    }

    async fn nearby_open_rides(&self, query: OpenRideQuery) -> Result<Vec<(Ride, f64)>> {
        let center = geog_point(1, 2);
        let sql = format!(
            "SELECT {cols}, ST_Distance(pickup, {center}) AS distance_m
             FROM rides
             WHERE status IN ('requested', 'pending')
               AND updated_at >= $4
               AND ST_DWithin(pickup, {center}, $3)
             ORDER BY distance_m ASC, id ASC
             LIMIT $5",
            cols = RIDE_COLUMNS,
            center = center
        );
        let rows = sqlx::query_as::<_, NearbyRow>(&sql)
            .bind(query.center.lat)
            .bind(query.center.lng)
            .bind(query.radius_m)
            .bind(query.updated_since)
            .bind(query.limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| Ok((Ride::try_from(r.ride)?, r.distance_m)))
            .collect()
    }

    async fn apply_transition(
        &self,
        ride_id: i64,
        transition: Transition,
        actor: &Principal,
        now: DateTime<Utc>,
    ) -> Result<Option<Ride>> {
        let (set, predicate) = transition_sql(transition, actor);
        let sql = format!(
            "UPDATE rides SET {} WHERE id = $1 AND {} RETURNING {}",
            set, predicate, RIDE_COLUMNS
        );
        let row = sqlx::query_as::<_, RideRow>(&sql)
            .bind(ride_id)
            .bind(actor.id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Ride::try_from).transpose()
    }

    async fn rides_for(&self, principal: &Principal, limit: usize) -> Result<Vec<Ride>> {
        let column = match principal.role {
            Role::Customer => "customer_id",
            Role::Driver => "driver_id",
        };
        let sql = format!(
            "SELECT {} FROM rides WHERE {} = $1 ORDER BY requested_at DESC, id DESC LIMIT $2",
            RIDE_COLUMNS, column
        );
        let rows = sqlx::query_as::<_, RideRow>(&sql)
            .bind(principal.id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Ride::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_predicate_only_matches_open_states() {
        let (set, predicate) = transition_sql(Transition::Accept, &Principal::driver(1));
        assert!(set.contains("driver_id = $2"));
        assert_eq!(predicate, "status IN ('requested', 'pending')");
    }

    #[test]
    fn driver_transitions_require_assignment() {
        for t in [Transition::Start, Transition::Complete] {
            let (_, predicate) = transition_sql(t, &Principal::driver(1));
            assert!(predicate.ends_with("driver_id = $2"));
        }
    }

    #[test]
    fn cancel_clears_driver_and_checks_owner_by_role() {
        let (set, customer) = transition_sql(Transition::Cancel, &Principal::customer(1));
        assert!(set.contains("driver_id = NULL"));
        assert!(customer.contains("customer_id = $2"));
        let (_, driver) = transition_sql(Transition::Cancel, &Principal::driver(1));
        assert!(driver.contains("driver_id = $2"));
    }
}
