//! # Memory — In-Process Store Backends
//!
//! [`MemoryStore`] implements every durable store trait plus [`GeoIndex`]
//! over a single mutex-guarded state, and [`MemoryKv`] implements [`FastKv`]
//! with clock-driven expiry. Each trait method holds the lock for its whole
//! body, which gives conditional writes the same all-or-nothing behaviour
//! the Postgres `UPDATE … WHERE … RETURNING` statements have.
//!
//! Used by the scenario tests and by embedders that want the core without
//! external services.

use crate::clock::Clock;
use crate::error::Result;
use crate::geo::{GeoFilter, GeoHit, GeoIndex, GeoPoint};
use crate::kv::FastKv;
use crate::otp::{NewOtpRecord, OtpRecord};
use crate::presence::DriverPresence;
use crate::principal::{Principal, Role};
use crate::ride::{Check, NewRide, Ride, Transition};
use crate::store::{OpenRideQuery, OtpAuditStore, PresenceStore, RideStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct State {
    rides: BTreeMap<i64, Ride>,
    last_ride_id: i64,
    presence: HashMap<i64, DriverPresence>,
    locations: HashMap<i64, (GeoPoint, DateTime<Utc>)>,
    otps: Vec<OtpRecord>,
    last_otp_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a ride verbatim, e.g. with a backdated `updated_at`. Later
    /// inserts get ids above the seeded one.
    pub fn seed(&self, ride: Ride) {
        let mut state = lock_or_recover(&self.state);
        state.last_ride_id = state.last_ride_id.max(ride.id);
        state.rides.insert(ride.id, ride);
    }

    pub fn ride_count(&self) -> usize {
        lock_or_recover(&self.state).rides.len()
    }
}

#[async_trait]
impl RideStore for MemoryStore {
    async fn insert_ride(&self, ride: NewRide) -> Result<Ride> {
        let mut state = lock_or_recover(&self.state);
        state.last_ride_id += 1;
        let ride = ride.into_ride(state.last_ride_id);
        state.rides.insert(ride.id, ride.clone());
        Ok(ride)
    }

    async fn get_ride(&self, ride_id: i64) -> Result<Option<Ride>> {
        Ok(lock_or_recover(&self.state).rides.get(&ride_id).cloned())
    }

    async fn nearby_open_rides(&self, query: OpenRideQuery) -> Result<Vec<(Ride, f64)>> {
        let state = lock_or_recover(&self.state);
        let mut hits: Vec<(Ride, f64)> = state
            .rides
            .values()
            .filter(|r| r.status.is_open() && r.updated_at >= query.updated_since)
            .map(|r| (r.clone(), query.center.distance_m(&r.pickup)))
            .filter(|(_, d)| *d <= query.radius_m)
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.id.cmp(&b.0.id)));
        hits.truncate(query.limit);
        Ok(hits)
    }

    async fn apply_transition(
        &self,
        ride_id: i64,
        transition: Transition,
        actor: &Principal,
        now: DateTime<Utc>,
    ) -> Result<Option<Ride>> {
        let mut state = lock_or_recover(&self.state);
        let Some(ride) = state.rides.get_mut(&ride_id) else {
            return Ok(None);
        };
        if !matches!(transition.check(ride, actor), Check::Proceed) {
            return Ok(None);
        }
        transition.apply(ride, actor, now);
        Ok(Some(ride.clone()))
    }

    async fn rides_for(&self, principal: &Principal, limit: usize) -> Result<Vec<Ride>> {
        let state = lock_or_recover(&self.state);
        let mut rides: Vec<Ride> = state
            .rides
            .values()
            .filter(|r| match principal.role {
                Role::Customer => r.customer_id == principal.id,
                Role::Driver => r.is_assigned_to(principal.id),
            })
            .cloned()
            .collect();
        rides.sort_by(|a, b| b.requested_at.cmp(&a.requested_at).then(b.id.cmp(&a.id)));
        rides.truncate(limit);
        Ok(rides)
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn upsert_presence(&self, driver_id: i64, point: GeoPoint, now: DateTime<Utc>) -> Result<()> {
        let mut state = lock_or_recover(&self.state);
        state
            .presence
            .entry(driver_id)
            .and_modify(|p| {
                if !p.online {
                    p.went_online_at = now;
                }
                p.online = true;
                p.point = point;
                p.last_ping_at = now;
            })
            .or_insert(DriverPresence {
                driver_id,
                online: true,
                point,
                last_ping_at: now,
                went_online_at: now,
            });
        Ok(())
    }

    async fn set_offline(&self, driver_id: i64, _now: DateTime<Utc>) -> Result<()> {
        if let Some(p) = lock_or_recover(&self.state).presence.get_mut(&driver_id) {
            p.online = false;
        }
        Ok(())
    }

    async fn get_presence(&self, driver_id: i64) -> Result<Option<DriverPresence>> {
        Ok(lock_or_recover(&self.state).presence.get(&driver_id).cloned())
    }

    async fn get_presences(&self, driver_ids: &[i64]) -> Result<Vec<DriverPresence>> {
        let state = lock_or_recover(&self.state);
        Ok(driver_ids
            .iter()
            .filter_map(|id| state.presence.get(id).cloned())
            .collect())
    }

    async fn delete_stale_presence(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = lock_or_recover(&self.state);
        let before = state.presence.len();
        state.presence.retain(|_, p| p.last_ping_at >= cutoff);
        Ok((before - state.presence.len()) as u64)
    }
}

#[async_trait]
impl GeoIndex for MemoryStore {
    async fn upsert(&self, owner_id: i64, point: GeoPoint, at: DateTime<Utc>) -> Result<()> {
        lock_or_recover(&self.state)
            .locations
            .insert(owner_id, (point, at));
        Ok(())
    }

    async fn query(
        &self,
        center: GeoPoint,
        radius_m: f64,
        limit: usize,
        filter: GeoFilter,
    ) -> Result<Vec<GeoHit>> {
        let state = lock_or_recover(&self.state);
        let mut hits: Vec<GeoHit> = state
            .locations
            .iter()
            .filter(|(_, (_, at))| filter.fresh_since.map_or(true, |since| *at >= since))
            .map(|(id, (point, at))| GeoHit {
                owner_id: *id,
                point: *point,
                distance_m: center.distance_m(point),
                updated_at: *at,
            })
            .filter(|h| h.distance_m <= radius_m)
            .collect();
        hits.sort_by(|a, b| {
            a.distance_m
                .total_cmp(&b.distance_m)
                .then(a.owner_id.cmp(&b.owner_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn locate(&self, owner_id: i64) -> Result<Option<GeoHit>> {
        Ok(lock_or_recover(&self.state)
            .locations
            .get(&owner_id)
            .map(|(point, at)| GeoHit {
                owner_id,
                point: *point,
                distance_m: 0.0,
                updated_at: *at,
            }))
    }
}

#[async_trait]
impl OtpAuditStore for MemoryStore {
    async fn insert_otp(&self, record: NewOtpRecord) -> Result<OtpRecord> {
        let mut state = lock_or_recover(&self.state);
        state.last_otp_id += 1;
        let record = record.into_record(state.last_otp_id);
        state.otps.push(record.clone());
        Ok(record)
    }

    async fn mark_otp_verified(&self, phone: &str, code: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut state = lock_or_recover(&self.state);
        // Records are appended in id order, so the last match is the newest.
        let newest = state
            .otps
            .iter_mut()
            .rev()
            .find(|r| r.phone == phone && r.code == code && r.is_outstanding(now));
        match newest {
            Some(r) => {
                r.verified = true;
                r.verified_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn expire_outstanding_otps(&self, phone: &str) -> Result<u64> {
        let mut state = lock_or_recover(&self.state);
        let mut n = 0;
        for r in state
            .otps
            .iter_mut()
            .filter(|r| r.phone == phone && !r.verified && !r.expired)
        {
            r.expired = true;
            n += 1;
        }
        Ok(n)
    }

    async fn otp_history(&self, phone: &str, limit: usize) -> Result<Vec<OtpRecord>> {
        let state = lock_or_recover(&self.state);
        Ok(state
            .otps
            .iter()
            .rev()
            .filter(|r| r.phone == phone)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn purge_expired_otps(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut state = lock_or_recover(&self.state);
        let before = state.otps.len();
        state.otps.retain(|r| r.expires_at >= older_than);
        Ok((before - state.otps.len()) as u64)
    }
}

/// [`FastKv`] with expiry evaluated against a [`Clock`].
pub struct MemoryKv {
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
    clock: Arc<dyn Clock>,
}

impl MemoryKv {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        MemoryKv {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Drop a key as if the cache had evicted it.
    pub fn evict(&self, key: &str) {
        lock_or_recover(&self.entries).remove(key);
    }
}

#[async_trait]
impl FastKv for MemoryKv {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = self.clock.now() + chrono::Duration::milliseconds(ttl.as_millis() as i64);
        lock_or_recover(&self.entries).insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let mut entries = lock_or_recover(&self.entries);
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(lock_or_recover(&self.entries)
            .remove(key)
            .is_some_and(|(_, expires_at)| expires_at > now))
    }
}
