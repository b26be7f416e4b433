//! Prometheus metrics for the relay
//!
//! Each relay owns its own [`Registry`], so independent relays (and tests)
//! never share counters. Gauges are refreshed from live state right before a
//! scrape; counters are bumped where the events happen.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::warn;

use crate::{Error, Result};

/// Call outcome label values
pub mod outcome {
    pub const CALLING: &str = "calling";
    pub const CONNECTED: &str = "connected";
    pub const REJECTED: &str = "rejected";
    pub const TIMEOUT: &str = "timeout";
    pub const ENDED: &str = "ended";
}

#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,
    pub open_connections: IntGauge,
    pub online_users: IntGauge,
    pub active_calls: IntGauge,
    pub connections_total: IntCounter,
    pub call_outcomes: IntCounterVec,
}

impl RelayMetrics {
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("chatrelay".to_string()), None)
            .expect("Failed to create metrics registry");

        let open_connections = IntGauge::new("open_connections", "Currently open relay connections")
            .expect("Failed to create open_connections");
        let online_users = IntGauge::new("online_users", "Users with a registered connection")
            .expect("Failed to create online_users");
        let active_calls = IntGauge::new("active_calls", "Call sessions currently tracked")
            .expect("Failed to create active_calls");
        let connections_total =
            IntCounter::new("connections_total", "Connections opened since startup")
                .expect("Failed to create connections_total");
        let call_outcomes = IntCounterVec::new(
            Opts::new("call_outcomes_total", "Call state changes by outcome"),
            &["outcome"],
        )
        .expect("Failed to create call_outcomes_total");

        let collectors: [(&str, Box<dyn prometheus::core::Collector>); 5] = [
            ("open_connections", Box::new(open_connections.clone())),
            ("online_users", Box::new(online_users.clone())),
            ("active_calls", Box::new(active_calls.clone())),
            ("connections_total", Box::new(connections_total.clone())),
            ("call_outcomes_total", Box::new(call_outcomes.clone())),
        ];
        for (name, collector) in collectors {
            if let Err(e) = registry.register(collector) {
                warn!(metric = name, error = %e, "Failed to register metric");
            }
        }

        Self {
            registry,
            open_connections,
            online_users,
            active_calls,
            connections_total,
            call_outcomes,
        }
    }

    pub fn record_call(&self, outcome: &str) {
        self.call_outcomes.with_label_values(&[outcome]).inc();
    }

    #[must_use]
    pub fn call_outcome_count(&self, outcome: &str) -> u64 {
        self.call_outcomes.with_label_values(&[outcome]).get()
    }

    /// Encode every registered metric in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| Error::Internal(format!("Failed to encode metrics: {e}")))?;
        String::from_utf8(buffer).map_err(|_| Error::Internal("Invalid UTF-8 in metrics".to_string()))
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
