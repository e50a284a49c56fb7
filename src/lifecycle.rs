//! # Lifecycle — Ride Requests, Discovery and Transitions
//!
//! ```text
//!   requested ─┐
//!              ├─ accept ─→ accepted ─ start ─→ started ─ complete ─→ completed
//!   pending ───┘                │                  │
//!        │                      │                  │
//!        └──────────── cancel ──┴──────────────────┴──→ cancelled
//! ```
//!
//! Every transition is one conditional write in the [`RideStore`]; the
//! lifecycle never reads a ride to decide whether to write it. Only when the
//! write matches nothing is the ride re-read, to tell the caller *why*
//! (unknown ride, wrong principal, illegal source state) or to recognise a
//! retry of a transition this principal already applied.

use crate::clock::Clock;
use crate::config::{NEARBY_DEFAULT_LIMIT, NEARBY_MAX_LIMIT};
use crate::error::{Error, Result};
use crate::geo::{validate_radius, GeoPoint};
use crate::metrics::Metrics;
use crate::presence::{DriverLocation, PresenceTracker};
use crate::principal::{Principal, Role};
use crate::ride::{Check, NewRide, Ride, Transition, TransitionOutcome};
use crate::store::{bounded, OpenRideQuery, RideStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// An open ride with its pickup distance from the query point.
#[derive(Debug, Clone, Serialize)]
pub struct NearbyRide {
    pub ride: Ride,
    pub distance_m: f64,
}

/// A ride as seen by one of its participants.
#[derive(Debug, Clone, Serialize)]
pub struct RideView {
    pub ride: Ride,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_location: Option<DriverLocation>,
}

pub struct RideLifecycle {
    rides: Arc<dyn RideStore>,
    presence: Arc<PresenceTracker>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    freshness: chrono::Duration,
    timeout: Duration,
}

impl RideLifecycle {
    pub fn new(
        rides: Arc<dyn RideStore>,
        presence: Arc<PresenceTracker>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        freshness: chrono::Duration,
        timeout: Duration,
    ) -> Self {
        RideLifecycle {
            rides,
            presence,
            clock,
            metrics,
            freshness,
            timeout,
        }
    }

    pub async fn request_ride(
        &self,
        principal: &Principal,
        pickup: GeoPoint,
        dropoff: GeoPoint,
    ) -> Result<Ride> {
        principal.require(Role::Customer)?;
        pickup.validate()?;
        dropoff.validate()?;

        let new = NewRide {
            customer_id: principal.id,
            pickup,
            dropoff,
            requested_at: self.clock.now(),
        };
        let ride = bounded(self.timeout, "insert_ride", self.rides.insert_ride(new)).await?;
        self.metrics.rides_requested.inc();
        info!(
            ride_id = ride.id,
            customer_id = ride.customer_id,
            pickup_lat = pickup.lat,
            pickup_lng = pickup.lng,
            "ride requested"
        );
        Ok(ride)
    }

    /// Open, recently updated rides whose pickup lies within `radius_m`,
    /// nearest first. Any driver may browse, online or not.
    pub async fn find_nearby_open_rides(
        &self,
        principal: &Principal,
        lat: f64,
        lng: f64,
        radius_m: f64,
        limit: Option<u32>,
    ) -> Result<Vec<NearbyRide>> {
        principal.require(Role::Driver)?;
        let center = GeoPoint::new(lat, lng)?;
        validate_radius(radius_m)?;
        let limit = limit
            .map(|l| (l as usize).clamp(1, NEARBY_MAX_LIMIT))
            .unwrap_or(NEARBY_DEFAULT_LIMIT);

        let query = OpenRideQuery {
            center,
            radius_m,
            limit,
            updated_since: self.clock.now() - self.freshness,
        };
        let hits = bounded(
            self.timeout,
            "nearby_open_rides",
            self.rides.nearby_open_rides(query),
        )
        .await?;
        self.metrics.nearby_queries.inc();
        debug!(
            driver_id = principal.id,
            lat,
            lng,
            radius_m,
            found = hits.len(),
            "nearby open rides"
        );
        Ok(hits
            .into_iter()
            .map(|(ride, distance_m)| NearbyRide { ride, distance_m })
            .collect())
    }

    pub async fn accept(&self, ride_id: i64, principal: &Principal) -> Result<TransitionOutcome> {
        self.transition(ride_id, Transition::Accept, principal).await
    }

    pub async fn start(&self, ride_id: i64, principal: &Principal) -> Result<TransitionOutcome> {
        self.transition(ride_id, Transition::Start, principal).await
    }

    pub async fn complete(&self, ride_id: i64, principal: &Principal) -> Result<TransitionOutcome> {
        self.transition(ride_id, Transition::Complete, principal).await
    }

    pub async fn cancel(&self, ride_id: i64, principal: &Principal) -> Result<TransitionOutcome> {
        self.transition(ride_id, Transition::Cancel, principal).await
    }

    async fn transition(
        &self,
        ride_id: i64,
        transition: Transition,
        principal: &Principal,
    ) -> Result<TransitionOutcome> {
        let result = self.try_transition(ride_id, transition, principal).await;
        let outcome = match &result {
            Ok(TransitionOutcome::Applied(_)) => "applied",
            Ok(TransitionOutcome::AlreadyInState(_)) => "already",
            Err(Error::Conflict { .. }) => "conflict",
            Err(Error::Forbidden(_)) => "forbidden",
            Err(Error::NotFound(_)) => "not_found",
            Err(_) => "error",
        };
        self.metrics.transition(transition.as_str(), outcome);
        result
    }

    async fn try_transition(
        &self,
        ride_id: i64,
        transition: Transition,
        principal: &Principal,
    ) -> Result<TransitionOutcome> {
        if transition != Transition::Cancel {
            principal.require(Role::Driver)?;
        }
        let now = self.clock.now();

        let written = bounded(
            self.timeout,
            "apply_transition",
            self.rides
                .apply_transition(ride_id, transition, principal, now),
        )
        .await?;
        if let Some(ride) = written {
            info!(
                ride_id,
                transition = transition.as_str(),
                actor_id = principal.id,
                role = %principal.role,
                "ride {}", ride.status
            );
            return Ok(TransitionOutcome::Applied(ride));
        }

        let current = bounded(self.timeout, "get_ride", self.rides.get_ride(ride_id))
            .await?
            .ok_or_else(|| Error::not_found(format!("ride {}", ride_id)))?;
        match transition.check(&current, principal) {
            Check::AlreadyInState => {
                debug!(ride_id, transition = transition.as_str(), "transition already applied");
                Ok(TransitionOutcome::AlreadyInState(current))
            }
            Check::Reject(e) => {
                if matches!(e, Error::Conflict { .. }) {
                    info!(
                        ride_id,
                        transition = transition.as_str(),
                        actor_id = principal.id,
                        current = %current.status,
                        "transition rejected"
                    );
                }
                Err(e)
            }
            // The row moved between the write and the re-read.
            Check::Proceed => Err(Error::transient(format!(
                "ride {} changed concurrently, retry {}",
                ride_id,
                transition.as_str()
            ))),
        }
    }

    /// The ride plus the assigned driver's last known location. Visible to
    /// the owning customer and the assigned driver.
    pub async fn get_status(&self, ride_id: i64, principal: &Principal) -> Result<RideView> {
        let ride = bounded(self.timeout, "get_ride", self.rides.get_ride(ride_id))
            .await?
            .ok_or_else(|| Error::not_found(format!("ride {}", ride_id)))?;

        let allowed = match principal.role {
            Role::Customer => ride.customer_id == principal.id,
            Role::Driver => ride.is_assigned_to(principal.id),
        };
        if !allowed {
            return Err(Error::forbidden(format!(
                "ride {} is not visible to {} {}",
                ride_id, principal.role, principal.id
            )));
        }

        let driver_location = match ride.driver_id {
            Some(driver_id) => match self.presence.last_known_location(driver_id).await {
                Ok(loc) => loc,
                Err(e) => {
                    warn!(ride_id, driver_id, error = %e, "driver location lookup failed");
                    None
                }
            },
            None => None,
        };
        Ok(RideView {
            ride,
            driver_location,
        })
    }

    /// Rides the principal took part in, newest first.
    pub async fn rides_for(&self, principal: &Principal, limit: usize) -> Result<Vec<Ride>> {
        let limit = limit.clamp(1, NEARBY_MAX_LIMIT);
        bounded(self.timeout, "rides_for", self.rides.rides_for(principal, limit)).await
    }
}
