//! # Presence — Driver Online Tracking
//!
//! Drivers ping their location periodically. Each ping upserts the driver's
//! presence row (online, last ping, point) and moves the driver's point in
//! the [`GeoIndex`]. Nothing ever has to flip a driver offline for
//! correctness: a driver is present only while
//!
//! ```text
//! online && now - last_ping_at <= window      (window = 2 minutes)
//! ```
//!
//! evaluated at read time. [`PresenceTracker::sweep`] deletes stale rows for
//! storage hygiene only.

use crate::clock::Clock;
use crate::config::{NEAREST_DRIVERS_DEFAULT_LIMIT, NEAREST_DRIVERS_DEFAULT_RADIUS_M};
use crate::error::Result;
use crate::geo::{validate_radius, GeoFilter, GeoHit, GeoIndex, GeoPoint};
use crate::metrics::Metrics;
use crate::principal::{Principal, Role};
use crate::store::{bounded, PresenceStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverPresence {
    pub driver_id: i64,
    pub online: bool,
    pub point: GeoPoint,
    pub last_ping_at: DateTime<Utc>,
    pub went_online_at: DateTime<Utc>,
}

impl DriverPresence {
    pub fn is_present(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        self.online && now - self.last_ping_at <= window
    }
}

/// Last known position of a driver, fresh or not.
#[derive(Debug, Clone, Serialize)]
pub struct DriverLocation {
    pub driver_id: i64,
    pub point: GeoPoint,
    pub last_ping_at: DateTime<Utc>,
}

pub struct PresenceTracker {
    store: Arc<dyn PresenceStore>,
    geo: Arc<dyn GeoIndex>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    window: chrono::Duration,
    timeout: Duration,
}

impl PresenceTracker {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        geo: Arc<dyn GeoIndex>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        window: chrono::Duration,
        timeout: Duration,
    ) -> Self {
        PresenceTracker {
            store,
            geo,
            clock,
            metrics,
            window,
            timeout,
        }
    }

    pub fn window(&self) -> chrono::Duration {
        self.window
    }

    /// Record a location ping from the calling driver. Unknown drivers get a
    /// fresh row.
    pub async fn ping(&self, principal: &Principal, lat: f64, lng: f64) -> Result<()> {
        principal.require(Role::Driver)?;
        let point = GeoPoint::new(lat, lng)?;
        let now = self.clock.now();

        bounded(
            self.timeout,
            "upsert_presence",
            self.store.upsert_presence(principal.id, point, now),
        )
        .await?;
        bounded(
            self.timeout,
            "geo_upsert",
            self.geo.upsert(principal.id, point, now),
        )
        .await?;

        self.metrics.presence_pings.inc();
        debug!(driver_id = principal.id, lat, lng, "driver ping");
        Ok(())
    }

    /// Explicitly go offline. The last point is kept for status views.
    pub async fn go_offline(&self, principal: &Principal) -> Result<()> {
        principal.require(Role::Driver)?;
        let now = self.clock.now();
        bounded(
            self.timeout,
            "set_offline",
            self.store.set_offline(principal.id, now),
        )
        .await?;
        info!(driver_id = principal.id, "driver went offline");
        Ok(())
    }

    pub async fn is_online(&self, driver_id: i64) -> Result<bool> {
        let presence = bounded(
            self.timeout,
            "get_presence",
            self.store.get_presence(driver_id),
        )
        .await?;
        let now = self.clock.now();
        Ok(presence.is_some_and(|p| p.is_present(now, self.window)))
    }

    /// Narrow `driver_ids` to the ones currently online, in one store call.
    pub async fn filter_online(&self, driver_ids: &[i64]) -> Result<BTreeSet<i64>> {
        if driver_ids.is_empty() {
            return Ok(BTreeSet::new());
        }
        let rows = bounded(
            self.timeout,
            "get_presences",
            self.store.get_presences(driver_ids),
        )
        .await?;
        let now = self.clock.now();
        Ok(rows
            .into_iter()
            .filter(|p| p.is_present(now, self.window))
            .map(|p| p.driver_id)
            .collect())
    }

    /// Online drivers near a point, nearest first.
    ///
    /// Drivers who went offline keep a fresh point in the index, so the
    /// index is over-fetched and the window widened until `limit` online
    /// drivers are found or the radius holds no more points.
    pub async fn nearest_online_drivers(
        &self,
        lat: f64,
        lng: f64,
        radius_m: Option<f64>,
        limit: Option<usize>,
    ) -> Result<Vec<GeoHit>> {
        let center = GeoPoint::new(lat, lng)?;
        let radius_m = radius_m.unwrap_or(NEAREST_DRIVERS_DEFAULT_RADIUS_M);
        validate_radius(radius_m)?;
        let limit = limit.unwrap_or(NEAREST_DRIVERS_DEFAULT_LIMIT).max(1);
        let now = self.clock.now();
        let filter = GeoFilter {
            fresh_since: Some(now - self.window),
        };

        let mut fetch = limit.saturating_mul(2);
        loop {
            let hits = bounded(
                self.timeout,
                "geo_query",
                self.geo.query(center, radius_m, fetch, filter),
            )
            .await?;
            let exhausted = hits.len() < fetch;

            let ids: Vec<i64> = hits.iter().map(|h| h.owner_id).collect();
            let online = self.filter_online(&ids).await?;
            let mut found: Vec<GeoHit> = hits
                .into_iter()
                .filter(|h| online.contains(&h.owner_id))
                .collect();

            if found.len() >= limit || exhausted {
                found.truncate(limit);
                return Ok(found);
            }
            debug!(fetch, online = found.len(), "widening nearest driver lookup");
            fetch = fetch.saturating_mul(2);
        }
    }

    /// Most recent known point for a driver, regardless of freshness.
    pub async fn last_known_location(&self, driver_id: i64) -> Result<Option<DriverLocation>> {
        let hit = bounded(self.timeout, "geo_locate", self.geo.locate(driver_id)).await?;
        Ok(hit.map(|h| DriverLocation {
            driver_id,
            point: h.point,
            last_ping_at: h.updated_at,
        }))
    }

    /// Delete presence rows older than the window.
    pub async fn sweep(&self) -> Result<u64> {
        let cutoff = self.clock.now() - self.window;
        let removed = bounded(
            self.timeout,
            "delete_stale_presence",
            self.store.delete_stale_presence(cutoff),
        )
        .await?;
        self.metrics.presence_swept.inc_by(removed);
        if removed > 0 {
            info!(removed, "swept stale presence rows");
        }
        Ok(removed)
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the handle is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep().await {
                    warn!(error = %e, "presence sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryStore;

    fn tracker() -> (PresenceTracker, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        let tracker = PresenceTracker::new(
            store.clone(),
            store.clone(),
            clock.clone(),
            Arc::new(Metrics::new()),
            chrono::Duration::minutes(2),
            Duration::from_secs(1),
        );
        (tracker, store, clock)
    }

    #[test]
    fn presence_window_is_inclusive() {
        let now = Utc::now();
        let p = DriverPresence {
            driver_id: 1,
            online: true,
            point: GeoPoint { lat: 0.0, lng: 0.0 },
            last_ping_at: now - chrono::Duration::minutes(2),
            went_online_at: now,
        };
        assert!(p.is_present(now, chrono::Duration::minutes(2)));
        assert!(!p.is_present(
            now + chrono::Duration::seconds(1),
            chrono::Duration::minutes(2)
        ));
        let offline = DriverPresence { online: false, ..p };
        assert!(!offline.is_present(now, chrono::Duration::minutes(2)));
    }

    #[tokio::test]
    async fn ping_makes_unknown_driver_online() {
        let (tracker, _, _) = tracker();
        assert!(!tracker.is_online(42).await.unwrap());
        tracker
            .ping(&Principal::driver(42), 23.8103, 90.4125)
            .await
            .unwrap();
        assert!(tracker.is_online(42).await.unwrap());
    }

    #[tokio::test]
    async fn driver_goes_stale_without_any_write() {
        let (tracker, _, clock) = tracker();
        tracker.ping(&Principal::driver(1), 23.81, 90.41).await.unwrap();
        clock.advance(chrono::Duration::seconds(119));
        assert!(tracker.is_online(1).await.unwrap());
        clock.advance(chrono::Duration::seconds(2));
        assert!(!tracker.is_online(1).await.unwrap());
    }

    #[tokio::test]
    async fn ping_rejects_customers_and_bad_coordinates() {
        let (tracker, _, _) = tracker();
        assert!(tracker.ping(&Principal::customer(1), 0.0, 0.0).await.is_err());
        assert!(tracker.ping(&Principal::driver(1), 91.0, 0.0).await.is_err());
    }

    #[tokio::test]
    async fn filter_online_keeps_only_fresh_drivers() {
        let (tracker, _, clock) = tracker();
        tracker.ping(&Principal::driver(1), 23.81, 90.41).await.unwrap();
        clock.advance(chrono::Duration::minutes(3));
        tracker.ping(&Principal::driver(2), 23.81, 90.41).await.unwrap();
        tracker.ping(&Principal::driver(3), 23.81, 90.41).await.unwrap();
        tracker.go_offline(&Principal::driver(3)).await.unwrap();

        let online = tracker.filter_online(&[1, 2, 3, 4]).await.unwrap();
        assert_eq!(online.into_iter().collect::<Vec<_>>(), vec![2]);
        assert!(tracker.filter_online(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_rows() {
        let (tracker, _, clock) = tracker();
        tracker.ping(&Principal::driver(1), 23.81, 90.41).await.unwrap();
        clock.advance(chrono::Duration::minutes(5));
        tracker.ping(&Principal::driver(2), 23.81, 90.41).await.unwrap();

        assert_eq!(tracker.sweep().await.unwrap(), 1);
        assert!(tracker.is_online(2).await.unwrap());
        assert_eq!(tracker.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn nearest_online_drivers_skips_stale_and_far() {
        let (tracker, _, clock) = tracker();
        tracker.ping(&Principal::driver(1), 23.8103, 90.4125).await.unwrap();
        clock.advance(chrono::Duration::minutes(3));
        tracker.ping(&Principal::driver(2), 23.8110, 90.4130).await.unwrap();
        tracker.ping(&Principal::driver(3), 23.9000, 90.5000).await.unwrap();

        let hits = tracker
            .nearest_online_drivers(23.8100, 90.4120, Some(1000.0), None)
            .await
            .unwrap();
        let ids: Vec<i64> = hits.iter().map(|h| h.owner_id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn background_sweeper_compacts_stale_rows() {
        let (tracker, store, clock) = tracker();
        tracker.ping(&Principal::driver(1), 23.81, 90.41).await.unwrap();
        clock.advance(chrono::Duration::minutes(5));

        let handle = Arc::new(tracker).spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();
        assert!(store.get_presence(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn offline_driver_does_not_take_a_nearest_slot() {
        let (tracker, _, _) = tracker();
        tracker.ping(&Principal::driver(1), 23.8101, 90.4121).await.unwrap();
        tracker.ping(&Principal::driver(2), 23.8130, 90.4150).await.unwrap();
        tracker.go_offline(&Principal::driver(1)).await.unwrap();
        assert!(tracker.is_online(2).await.unwrap());

        let hits = tracker
            .nearest_online_drivers(23.8100, 90.4120, Some(3000.0), Some(1))
            .await
            .unwrap();
        let ids: Vec<i64> = hits.iter().map(|h| h.owner_id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn nearest_lookup_pages_past_many_offline_drivers() {
        let (tracker, _, _) = tracker();
        for id in 1..=9 {
            let driver = Principal::driver(id);
            tracker
                .ping(&driver, 23.8100 + id as f64 * 0.0001, 90.4120)
                .await
                .unwrap();
            tracker.go_offline(&driver).await.unwrap();
        }
        tracker.ping(&Principal::driver(20), 23.8200, 90.4120).await.unwrap();
        tracker.ping(&Principal::driver(21), 23.8210, 90.4120).await.unwrap();

        let hits = tracker
            .nearest_online_drivers(23.8100, 90.4120, Some(3000.0), Some(2))
            .await
            .unwrap();
        let ids: Vec<i64> = hits.iter().map(|h| h.owner_id).collect();
        assert_eq!(ids, vec![20, 21]);
    }

    #[tokio::test]
    async fn last_known_location_survives_going_offline() {
        let (tracker, _, _) = tracker();
        let driver = Principal::driver(8);
        tracker.ping(&driver, 23.8103, 90.4125).await.unwrap();
        tracker.go_offline(&driver).await.unwrap();
        let loc = tracker.last_known_location(8).await.unwrap().unwrap();
        assert_eq!(loc.point, GeoPoint { lat: 23.8103, lng: 90.4125 });
        assert!(tracker.last_known_location(9).await.unwrap().is_none());
    }
}
