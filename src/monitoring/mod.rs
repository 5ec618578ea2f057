/// Counters and health reporting
pub mod health;
pub mod metrics;

pub use health::{ComponentHealth, HealthCheckResult, HealthChecker, HealthStatus};
pub use metrics::{Metric, MetricValue, MetricsCollector};
