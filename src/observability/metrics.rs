//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define the balancer's metric names and label sets
//! - Hand components an injected sink instead of a global registry
//! - Bridge the sink to the `metrics` facade for Prometheus scraping
//!
//! # Metrics
//! - `nlb_routed_connections_total` (counter): protocol, module
//! - `nlb_routing_errors_total` (counter): protocol, error_type
//! - `nlb_active_connections` (gauge): protocol, module
//! - `nlb_ratelimit_allowed_total` / `nlb_ratelimit_denied_total` (counter): protocol, bucket
//! - `nlb_ratelimit_tokens_available` (gauge): protocol, bucket
//! - `nlb_scale_operations_total` (counter): protocol, direction
//! - `nlb_current_replicas` (gauge): protocol
//! - `nlb_scale_decisions_total` (counter): protocol, decision
//! - `nlb_bluegreen_traffic_split` (gauge): protocol, version, color
//! - `nlb_bluegreen_deployments_total` (counter): protocol, status
//! - `nlb_bluegreen_rollbacks_total` (counter)

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use metrics::Label;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const ROUTED_CONNECTIONS: &str = "nlb_routed_connections_total";
pub const ROUTING_ERRORS: &str = "nlb_routing_errors_total";
pub const ACTIVE_CONNECTIONS: &str = "nlb_active_connections";
pub const RATELIMIT_ALLOWED: &str = "nlb_ratelimit_allowed_total";
pub const RATELIMIT_DENIED: &str = "nlb_ratelimit_denied_total";
pub const RATELIMIT_TOKENS: &str = "nlb_ratelimit_tokens_available";
pub const SCALE_OPERATIONS: &str = "nlb_scale_operations_total";
pub const CURRENT_REPLICAS: &str = "nlb_current_replicas";
pub const SCALE_DECISIONS: &str = "nlb_scale_decisions_total";
pub const BLUEGREEN_SPLIT: &str = "nlb_bluegreen_traffic_split";
pub const BLUEGREEN_DEPLOYMENTS: &str = "nlb_bluegreen_deployments_total";
pub const BLUEGREEN_ROLLBACKS: &str = "nlb_bluegreen_rollbacks_total";

/// Label pairs attached to a single observation.
pub type Labels<'a> = &'a [(&'static str, String)];

/// Destination for counters and gauges.
///
/// Injected into every component at construction and shared for the
/// lifetime of the process.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>);

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64);
}

/// Shared handle type passed to components.
pub type SharedSink = Arc<dyn MetricsSink>;

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn increment_counter(&self, _name: &'static str, _labels: Labels<'_>) {}

    fn set_gauge(&self, _name: &'static str, _labels: Labels<'_>, _value: f64) {}
}

/// Sink that forwards to whatever recorder the `metrics` facade has installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusSink;

fn to_labels(labels: Labels<'_>) -> Vec<Label> {
    labels
        .iter()
        .map(|(key, value)| Label::new(*key, value.clone()))
        .collect()
}

impl MetricsSink for PrometheusSink {
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>) {
        metrics::counter!(name, to_labels(labels)).increment(1);
    }

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        metrics::gauge!(name, to_labels(labels)).set(value);
    }
}

/// Install the global Prometheus recorder.
///
/// The returned handle renders the text exposition format; the admin
/// server serves it on `/metrics`.
pub fn install_prometheus() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Key identifying one series: metric name plus sorted labels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub name: String,
    pub labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(name: &str, labels: Labels<'_>) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }
}

/// In-memory sink that keeps every series it sees.
#[derive(Debug, Default)]
pub struct RecordingSink {
    counters: Mutex<HashMap<SeriesKey, u64>>,
    gauges: Mutex<HashMap<SeriesKey, f64>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, 0 if never incremented.
    pub fn counter(&self, name: &str, labels: &[(&'static str, &str)]) -> u64 {
        let labels: Vec<(&'static str, String)> =
            labels.iter().map(|(k, v)| (*k, v.to_string())).collect();
        let key = SeriesKey::new(name, &labels);
        self.counters
            .lock()
            .expect("recording sink mutex poisoned")
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    /// Last value set on a gauge.
    pub fn gauge(&self, name: &str, labels: &[(&'static str, &str)]) -> Option<f64> {
        let labels: Vec<(&'static str, String)> =
            labels.iter().map(|(k, v)| (*k, v.to_string())).collect();
        let key = SeriesKey::new(name, &labels);
        self.gauges
            .lock()
            .expect("recording sink mutex poisoned")
            .get(&key)
            .copied()
    }

    /// Sum of a counter across all label sets.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .expect("recording sink mutex poisoned")
            .iter()
            .filter(|(key, _)| key.name == name)
            .map(|(_, v)| *v)
            .sum()
    }
}

impl MetricsSink for RecordingSink {
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>) {
        let key = SeriesKey::new(name, labels);
        *self
            .counters
            .lock()
            .expect("recording sink mutex poisoned")
            .entry(key)
            .or_insert(0) += 1;
    }

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        let key = SeriesKey::new(name, labels);
        self.gauges
            .lock()
            .expect("recording sink mutex poisoned")
            .insert(key, value);
    }
}
