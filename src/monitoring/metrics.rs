use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Malformed inbound frames dropped by the signal pipeline
pub const FRAMES_MALFORMED: &str = "frames.malformed";
/// Market frames dropped because the ingress queue was full
pub const FRAMES_DROPPED: &str = "frames.dropped";
/// Events lost by lagging subscribers
pub const EVENTS_DROPPED: &str = "events.dropped";
pub const EVENTS_PUBLISHED: &str = "events.published";
pub const SESSION_RECONNECTS: &str = "session.reconnects";
pub const HEARTBEAT_TIMEOUTS: &str = "session.heartbeat_timeouts";
pub const ORDERS_SENT: &str = "orders.sent";
pub const ORDERS_RESENT: &str = "orders.resent";
pub const ORDERS_EXPIRED: &str = "orders.expired";
/// Gauge of orders not yet terminal
pub const ORDERS_OPEN: &str = "orders.open";

/// Metric value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    Counter(u64),
    Gauge(f64),
}

/// A single metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: MetricValue,
    /// Collection time in milliseconds since the Unix epoch
    pub timestamp: u64,
}

/// Counters and gauges shared by the engine tasks
///
/// Cloning is cheap; all clones record into the same maps.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    counters: Arc<RwLock<HashMap<String, u64>>>,
    gauges: Arc<RwLock<HashMap<String, f64>>>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter
    pub async fn increment_counter(&self, name: &str, value: u64) {
        let mut counters = self.counters.write().await;
        *counters.entry(name.to_string()).or_insert(0) += value;
    }

    /// Set a gauge value
    pub async fn set_gauge(&self, name: &str, value: f64) {
        let mut gauges = self.gauges.write().await;
        gauges.insert(name.to_string(), value);
    }

    /// Current value of a counter; zero when never incremented
    pub async fn counter(&self, name: &str) -> u64 {
        self.counters.read().await.get(name).copied().unwrap_or(0)
    }

    pub async fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.read().await.get(name).copied()
    }

    /// Snapshot of all metrics, sorted by name
    pub async fn get_metrics(&self) -> Vec<Metric> {
        let timestamp = crate::core::events::now_millis();
        let mut metrics = Vec::new();

        let counters = self.counters.read().await;
        for (name, value) in counters.iter() {
            metrics.push(Metric {
                name: format!("counter.{}", name),
                value: MetricValue::Counter(*value),
                timestamp,
            });
        }

        let gauges = self.gauges.read().await;
        for (name, value) in gauges.iter() {
            metrics.push(Metric {
                name: format!("gauge.{}", name),
                value: MetricValue::Gauge(*value),
                timestamp,
            });
        }

        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    /// Reset all metrics
    pub async fn reset(&self) {
        self.counters.write().await.clear();
        self.gauges.write().await.clear();
    }
}
