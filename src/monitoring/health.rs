use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::core::events::{now_millis, Timestamp};
use crate::session::{ConnectionState, SessionStatus};

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl From<ConnectionState> for HealthStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Live => HealthStatus::Healthy,
            ConnectionState::Connecting | ConnectionState::Degraded => HealthStatus::Degraded,
            ConnectionState::Closed => HealthStatus::Unhealthy,
        }
    }
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub message: String,
    pub timestamp: Timestamp,
    pub checks: Vec<ComponentHealth>,
}

/// Component health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
}

/// Health checker
///
/// Components report in with `register_component`; the session reports
/// through `record_session`, which also judges how stale the last
/// heartbeat is.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    heartbeat_timeout: Duration,
    components: Arc<RwLock<Vec<ComponentHealth>>>,
}

impl HealthChecker {
    /// Create a new health checker
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            heartbeat_timeout,
            components: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register or update a component
    pub async fn register_component(
        &self,
        name: impl Into<String>,
        status: HealthStatus,
        message: impl Into<String>,
    ) {
        let name = name.into();
        let message = message.into();
        let mut components = self.components.write().await;
        if let Some(component) = components.iter_mut().find(|c| c.name == name) {
            component.status = status;
            component.message = message;
        } else {
            components.push(ComponentHealth {
                name,
                status,
                message,
            });
        }
    }

    /// Derive the `session` and `heartbeat` components from a status snapshot
    pub async fn record_session(&self, status: &SessionStatus) {
        let mut message = format!("{} (generation {})", status.state, status.generation);
        if let Some(error) = &status.last_error {
            message.push_str(&format!(", last error: {}", error));
        }
        self.register_component("session", status.state.into(), message)
            .await;

        let (heartbeat, message) = match status.last_heartbeat {
            _ if !status.is_live() => (HealthStatus::from(status.state), "not live".to_string()),
            None => (HealthStatus::Degraded, "no heartbeat yet".to_string()),
            Some(at) => {
                let age = (Utc::now() - at).to_std().unwrap_or_default();
                if age > self.heartbeat_timeout {
                    (HealthStatus::Degraded, format!("last heartbeat {:?} ago", age))
                } else {
                    (HealthStatus::Healthy, format!("last heartbeat {}ms ago", age.as_millis()))
                }
            }
        };
        self.register_component("heartbeat", heartbeat, message).await;
    }

    /// Perform health check
    pub async fn check(&self) -> HealthCheckResult {
        let components = self.components.read().await;
        let mut overall_status = HealthStatus::Healthy;
        let mut messages = Vec::new();

        for component in components.iter() {
            match component.status {
                HealthStatus::Unhealthy => {
                    overall_status = HealthStatus::Unhealthy;
                    messages.push(format!("{}: {}", component.name, component.message));
                }
                HealthStatus::Degraded => {
                    if overall_status == HealthStatus::Healthy {
                        overall_status = HealthStatus::Degraded;
                    }
                    messages.push(format!("{}: {}", component.name, component.message));
                }
                HealthStatus::Healthy => {}
            }
        }

        let message = if messages.is_empty() {
            "All systems operational".to_string()
        } else {
            messages.join("; ")
        };

        HealthCheckResult {
            status: overall_status,
            message,
            timestamp: now_millis(),
            checks: components.clone(),
        }
    }
}
