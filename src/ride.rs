//! # Ride — Domain Model and Transition Rules
//!
//! The ride state machine is expressed as pure functions over a [`Ride`]
//! snapshot so that every store can evaluate the same rules:
//!
//! ```text
//! requested ─┐
//!            ├─ accept ─> accepted ─ start ─> started ─ complete ─> completed
//! pending ───┘
//!
//! any non-terminal ─ cancel ─> cancelled
//! ```
//!
//! `requested` and `pending` are interchangeable open states. Stores apply a
//! transition with a single conditional write whose predicate is exactly
//! [`Check::Proceed`]; when the write matches nothing the lifecycle re-reads
//! the ride and calls [`Transition::check`] again only to explain why.

use crate::error::Error;
use crate::geo::GeoPoint;
use crate::principal::{Principal, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RideStatus {
    Requested,
    Pending,
    Accepted,
    Started,
    Completed,
    Cancelled,
}

impl RideStatus {
    pub const OPEN: [RideStatus; 2] = [RideStatus::Requested, RideStatus::Pending];

    pub fn as_str(&self) -> &'static str {
        match self {
            RideStatus::Requested => "requested",
            RideStatus::Pending => "pending",
            RideStatus::Accepted => "accepted",
            RideStatus::Started => "started",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        }
    }

    /// Open rides are waiting for a driver.
    pub fn is_open(&self) -> bool {
        matches!(self, RideStatus::Requested | RideStatus::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    /// Statuses in which a driver must be assigned.
    pub fn requires_driver(&self) -> bool {
        matches!(
            self,
            RideStatus::Accepted | RideStatus::Started | RideStatus::Completed
        )
    }
}

impl std::fmt::Display for RideStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RideStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "requested" => Ok(RideStatus::Requested),
            "pending" => Ok(RideStatus::Pending),
            "accepted" => Ok(RideStatus::Accepted),
            "started" => Ok(RideStatus::Started),
            "completed" => Ok(RideStatus::Completed),
            "cancelled" => Ok(RideStatus::Cancelled),
            other => Err(Error::validation(format!("unknown ride status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ride {
    pub id: i64,
    pub customer_id: i64,
    pub driver_id: Option<i64>,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub status: RideStatus,
    pub fare: Option<f64>,
    pub requested_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Ride {
    /// Driver assignment matches status, and terminal rides carry exactly
    /// one terminal timestamp.
    pub fn invariants_hold(&self) -> bool {
        if self.status.requires_driver() != self.driver_id.is_some() {
            return false;
        }
        let terminal_stamps =
            self.completed_at.is_some() as u8 + self.cancelled_at.is_some() as u8;
        match self.status {
            RideStatus::Completed => terminal_stamps == 1 && self.completed_at.is_some(),
            RideStatus::Cancelled => terminal_stamps == 1 && self.cancelled_at.is_some(),
            _ => terminal_stamps == 0,
        }
    }

    pub fn is_assigned_to(&self, driver_id: i64) -> bool {
        self.driver_id == Some(driver_id)
    }
}

/// Fields the caller supplies when requesting a ride; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewRide {
    pub customer_id: i64,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub requested_at: DateTime<Utc>,
}

impl NewRide {
    pub fn into_ride(self, id: i64) -> Ride {
        Ride {
            id,
            customer_id: self.customer_id,
            driver_id: None,
            pickup: self.pickup,
            dropoff: self.dropoff,
            status: RideStatus::Requested,
            fare: None,
            requested_at: self.requested_at,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            updated_at: self.requested_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Accept,
    Start,
    Complete,
    Cancel,
}

/// What a transition would do to a given ride snapshot.
#[derive(Debug)]
pub enum Check {
    Proceed,
    /// Already applied by this principal; retrying must not write again.
    AlreadyInState,
    Reject(Error),
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Accept => "accept",
            Transition::Start => "start",
            Transition::Complete => "complete",
            Transition::Cancel => "cancel",
        }
    }

    pub fn target(&self) -> RideStatus {
        match self {
            Transition::Accept => RideStatus::Accepted,
            Transition::Start => RideStatus::Started,
            Transition::Complete => RideStatus::Completed,
            Transition::Cancel => RideStatus::Cancelled,
        }
    }

    fn conflict(&self, ride: &Ride) -> Check {
        Check::Reject(Error::Conflict {
            ride_id: ride.id,
            current: ride.status,
            attempted: self.target(),
        })
    }

    pub fn check(&self, ride: &Ride, actor: &Principal) -> Check {
        match self {
            Transition::Accept => {
                if !actor.is_driver() {
                    return Check::Reject(Error::forbidden("only drivers may accept rides"));
                }
                if ride.status.is_open() {
                    Check::Proceed
                } else if ride.status == RideStatus::Accepted && ride.is_assigned_to(actor.id) {
                    Check::AlreadyInState
                } else {
                    self.conflict(ride)
                }
            }
            Transition::Start | Transition::Complete => {
                if !actor.is_driver() {
                    return Check::Reject(Error::forbidden(format!(
                        "only the assigned driver may {} a ride",
                        self.as_str()
                    )));
                }
                if let Some(assigned) = ride.driver_id {
                    if assigned != actor.id {
                        return Check::Reject(Error::forbidden(format!(
                            "ride {} is assigned to another driver",
                            ride.id
                        )));
                    }
                }
                let (source, target) = match self {
                    Transition::Start => (RideStatus::Accepted, RideStatus::Started),
                    _ => (RideStatus::Started, RideStatus::Completed),
                };
                if ride.status == source {
                    Check::Proceed
                } else if ride.status == target {
                    Check::AlreadyInState
                } else {
                    self.conflict(ride)
                }
            }
            Transition::Cancel => {
                match actor.role {
                    Role::Customer if ride.customer_id != actor.id => {
                        return Check::Reject(Error::forbidden(format!(
                            "ride {} belongs to another customer",
                            ride.id
                        )));
                    }
                    Role::Driver
                        if ride.status != RideStatus::Cancelled
                            && !ride.is_assigned_to(actor.id) =>
                    {
                        return Check::Reject(Error::forbidden(format!(
                            "ride {} is not assigned to driver {}",
                            ride.id, actor.id
                        )));
                    }
                    _ => {}
                }
                match ride.status {
                    RideStatus::Cancelled => Check::AlreadyInState,
                    RideStatus::Completed => self.conflict(ride),
                    _ => Check::Proceed,
                }
            }
        }
    }

    /// Apply to an in-memory snapshot. Callers must have seen `Check::Proceed`.
    pub fn apply(&self, ride: &mut Ride, actor: &Principal, now: DateTime<Utc>) {
        match self {
            Transition::Accept => {
                ride.driver_id = Some(actor.id);
                ride.accepted_at = Some(now);
            }
            Transition::Start => ride.started_at = Some(now),
            Transition::Complete => ride.completed_at = Some(now),
            Transition::Cancel => {
                ride.driver_id = None;
                ride.cancelled_at = Some(now);
            }
        }
        ride.status = self.target();
        ride.updated_at = now;
    }
}

/// Result of a successful transition call.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "ride", rename_all = "snake_case")]
pub enum TransitionOutcome {
    Applied(Ride),
    AlreadyInState(Ride),
}

impl TransitionOutcome {
    pub fn ride(&self) -> &Ride {
        match self {
            TransitionOutcome::Applied(r) | TransitionOutcome::AlreadyInState(r) => r,
        }
    }

    pub fn into_ride(self) -> Ride {
        match self {
            TransitionOutcome::Applied(r) | TransitionOutcome::AlreadyInState(r) => r,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_ride() -> Ride {
        NewRide {
            customer_id: 123,
            pickup: GeoPoint { lat: 23.81, lng: 90.412 },
            dropoff: GeoPoint { lat: 23.78, lng: 90.40 },
            requested_at: Utc::now(),
        }
        .into_ride(1)
    }

    fn proceed(check: Check) -> bool {
        matches!(check, Check::Proceed)
    }

    #[test]
    fn new_ride_is_requested_and_consistent() {
        let ride = open_ride();
        assert_eq!(ride.status, RideStatus::Requested);
        assert!(ride.driver_id.is_none());
        assert_eq!(ride.updated_at, ride.requested_at);
        assert!(ride.invariants_hold());
    }

    #[test]
    fn accept_from_requested_and_pending() {
        let driver = Principal::driver(456);
        for status in RideStatus::OPEN {
            let mut ride = open_ride();
            ride.status = status;
            assert!(proceed(Transition::Accept.check(&ride, &driver)));
            Transition::Accept.apply(&mut ride, &driver, Utc::now());
            assert_eq!(ride.status, RideStatus::Accepted);
            assert_eq!(ride.driver_id, Some(456));
            assert!(ride.accepted_at.is_some());
            assert!(ride.invariants_hold());
        }
    }

    #[test]
    fn accept_by_other_driver_after_accept_conflicts() {
        let mut ride = open_ride();
        let first = Principal::driver(789);
        Transition::Accept.apply(&mut ride, &first, Utc::now());

        match Transition::Accept.check(&ride, &Principal::driver(456)) {
            Check::Reject(e) => {
                assert!(e.to_string().contains("not in requested or pending status"))
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert!(matches!(
            Transition::Accept.check(&ride, &first),
            Check::AlreadyInState
        ));
    }

    #[test]
    fn customers_cannot_accept() {
        let ride = open_ride();
        assert!(matches!(
            Transition::Accept.check(&ride, &Principal::customer(123)),
            Check::Reject(Error::Forbidden(_))
        ));
    }

    #[test]
    fn start_requires_accepted() {
        let driver = Principal::driver(456);
        let mut ride = open_ride();
        assert!(matches!(
            Transition::Start.check(&ride, &driver),
            Check::Reject(Error::Conflict { current: RideStatus::Requested, .. })
        ));

        Transition::Accept.apply(&mut ride, &driver, Utc::now());
        assert!(proceed(Transition::Start.check(&ride, &driver)));
        Transition::Start.apply(&mut ride, &driver, Utc::now());
        assert!(ride.started_at.is_some());
        assert!(matches!(
            Transition::Start.check(&ride, &driver),
            Check::AlreadyInState
        ));
    }

    #[test]
    fn start_by_unassigned_driver_is_forbidden() {
        let mut ride = open_ride();
        Transition::Accept.apply(&mut ride, &Principal::driver(1), Utc::now());
        assert!(matches!(
            Transition::Start.check(&ride, &Principal::driver(2)),
            Check::Reject(Error::Forbidden(_))
        ));
    }

    #[test]
    fn complete_requires_started() {
        let driver = Principal::driver(9);
        let mut ride = open_ride();
        Transition::Accept.apply(&mut ride, &driver, Utc::now());
        assert!(matches!(
            Transition::Complete.check(&ride, &driver),
            Check::Reject(Error::Conflict { .. })
        ));
        Transition::Start.apply(&mut ride, &driver, Utc::now());
        Transition::Complete.apply(&mut ride, &driver, Utc::now());
        assert_eq!(ride.status, RideStatus::Completed);
        assert!(ride.invariants_hold());
        assert!(matches!(
            Transition::Complete.check(&ride, &driver),
            Check::AlreadyInState
        ));
    }

    #[test]
    fn cancel_from_any_non_terminal_state_clears_driver() {
        let customer = Principal::customer(123);
        let driver = Principal::driver(5);
        let mut ride = open_ride();
        Transition::Accept.apply(&mut ride, &driver, Utc::now());
        Transition::Start.apply(&mut ride, &driver, Utc::now());
        assert!(proceed(Transition::Cancel.check(&ride, &customer)));
        Transition::Cancel.apply(&mut ride, &customer, Utc::now());
        assert_eq!(ride.status, RideStatus::Cancelled);
        assert!(ride.driver_id.is_none());
        assert!(ride.invariants_hold());
        assert!(matches!(
            Transition::Cancel.check(&ride, &customer),
            Check::AlreadyInState
        ));
    }

    #[test]
    fn cancel_completed_ride_conflicts() {
        let driver = Principal::driver(5);
        let mut ride = open_ride();
        for t in [Transition::Accept, Transition::Start, Transition::Complete] {
            t.apply(&mut ride, &driver, Utc::now());
        }
        assert!(matches!(
            Transition::Cancel.check(&ride, &Principal::customer(123)),
            Check::Reject(Error::Conflict { current: RideStatus::Completed, .. })
        ));
    }

    #[test]
    fn cancel_by_stranger_is_forbidden() {
        let ride = open_ride();
        assert!(matches!(
            Transition::Cancel.check(&ride, &Principal::customer(999)),
            Check::Reject(Error::Forbidden(_))
        ));
        assert!(matches!(
            Transition::Cancel.check(&ride, &Principal::driver(5)),
            Check::Reject(Error::Forbidden(_))
        ));
    }

    #[test]
    fn status_strings_roundtrip() {
        for s in [
            RideStatus::Requested,
            RideStatus::Pending,
            RideStatus::Accepted,
            RideStatus::Started,
            RideStatus::Completed,
            RideStatus::Cancelled,
        ] {
            assert_eq!(s.as_str().parse::<RideStatus>().unwrap(), s);
        }
        assert!("finished".parse::<RideStatus>().is_err());
    }
}
