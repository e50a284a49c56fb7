//! # Metrics — Prometheus Counters for the Coordination Core
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `ride_engine_rides_requested_total` | Counter | — | Rides created |
//! | `ride_engine_ride_transitions_total` | Counter | `transition`, `outcome` | Transition attempts by result |
//! | `ride_engine_nearby_queries_total` | Counter | — | Proximity discovery calls |
//! | `ride_engine_presence_pings_total` | Counter | — | Driver location pings |
//! | `ride_engine_presence_swept_total` | Counter | — | Stale presence rows removed |
//! | `ride_engine_otp_verifications_total` | Counter | `path`, `outcome` | OTP checks by store path |
//! | `ride_engine_session_validations_total` | Counter | `outcome` | Session token checks |
//!
//! `outcome` for transitions is one of `applied`, `already`, `conflict`,
//! `forbidden`, `not_found`, `error`. The registry is rendered by whatever
//! surface embeds the core via [`Metrics::encode`].

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct TransitionLabel {
    pub transition: String,
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct OtpLabel {
    pub path: String,
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct OutcomeLabel {
    pub outcome: String,
}

/// Shared, atomic counters; safe to bump from any task.
pub struct Metrics {
    pub registry: Registry,
    pub rides_requested: Counter,
    pub ride_transitions: Family<TransitionLabel, Counter>,
    pub nearby_queries: Counter,
    pub presence_pings: Counter,
    pub presence_swept: Counter,
    pub otp_verifications: Family<OtpLabel, Counter>,
    pub session_validations: Family<OutcomeLabel, Counter>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let rides_requested = Counter::default();
        registry.register(
            "ride_engine_rides_requested",
            "Rides created",
            rides_requested.clone(),
        );

        let ride_transitions = Family::<TransitionLabel, Counter>::default();
        registry.register(
            "ride_engine_ride_transitions",
            "Ride transition attempts by transition and outcome",
            ride_transitions.clone(),
        );

        let nearby_queries = Counter::default();
        registry.register(
            "ride_engine_nearby_queries",
            "Proximity ride discovery queries",
            nearby_queries.clone(),
        );

        let presence_pings = Counter::default();
        registry.register(
            "ride_engine_presence_pings",
            "Driver location pings recorded",
            presence_pings.clone(),
        );

        let presence_swept = Counter::default();
        registry.register(
            "ride_engine_presence_swept",
            "Stale presence rows removed by compaction",
            presence_swept.clone(),
        );

        let otp_verifications = Family::<OtpLabel, Counter>::default();
        registry.register(
            "ride_engine_otp_verifications",
            "OTP verification attempts by store path and outcome",
            otp_verifications.clone(),
        );

        let session_validations = Family::<OutcomeLabel, Counter>::default();
        registry.register(
            "ride_engine_session_validations",
            "Session token validations by outcome",
            session_validations.clone(),
        );

        Self {
            registry,
            rides_requested,
            ride_transitions,
            nearby_queries,
            presence_pings,
            presence_swept,
            otp_verifications,
            session_validations,
        }
    }

    pub fn transition(&self, transition: &str, outcome: &str) {
        self.ride_transitions
            .get_or_create(&TransitionLabel {
                transition: transition.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub fn otp(&self, path: &str, outcome: &str) {
        self.otp_verifications
            .get_or_create(&OtpLabel {
                path: path.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub fn session(&self, outcome: &str) {
        self.session_validations
            .get_or_create(&OutcomeLabel {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        encode(&mut buf, &self.registry).expect("encoding metrics should not fail");
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
