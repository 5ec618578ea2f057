use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Durations are written as integer milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Logging outputs used by `init_logging`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum level: "trace", "debug", "info", "warn", "error" or "off"
    pub level: String,
    /// Also log to stdout
    pub terminal: bool,
    /// Optional log file
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            terminal: false,
            file: None,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// WebSocket endpoints tried in order on every (re)connect
    pub urls: Vec<String>,
    /// Interval between heartbeat pings
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Missing heartbeat responses for this long degrades the session
    #[serde(with = "duration_ms")]
    pub heartbeat_timeout: Duration,
    /// First reconnect delay; doubled on each attempt
    #[serde(with = "duration_ms")]
    pub reconnect_backoff_base: Duration,
    /// Upper bound of the reconnect delay
    #[serde(with = "duration_ms")]
    pub reconnect_backoff_cap: Duration,
    /// Reconnect attempts before the session is closed
    pub max_reconnect_attempts: u32,
    /// Events buffered per subscriber before the oldest are dropped
    pub subscriber_buffer_size: usize,
    /// Frames queued between the transport and the signal pipeline
    ///
    /// When the queue is full the newest frame is dropped, never the
    /// session, and counted under `frames.dropped`.
    pub ingress_buffer_size: usize,
    /// Time allowed to open a link and authenticate
    #[serde(with = "duration_ms")]
    pub connection_timeout: Duration,
    /// Default timeout for raw requests
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Extra time after expiry for the broker to report an acknowledged order's result
    #[serde(with = "duration_ms")]
    pub settlement_grace: Duration,
    /// Time given to in-flight orders to finish on shutdown
    #[serde(with = "duration_ms")]
    pub shutdown_grace: Duration,
    /// Finished orders remembered for duplicate detection; the oldest are forgotten first
    pub max_retained_orders: usize,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(60),
            reconnect_backoff_base: Duration::from_millis(500),
            reconnect_backoff_cap: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            subscriber_buffer_size: 1024,
            ingress_buffer_size: 4096,
            connection_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            settlement_grace: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
            max_retained_orders: 10_000,
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing keys keep their defaults, unknown keys are ignored
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&contents)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn with_urls(mut self, urls: Vec<String>) -> Self {
        self.urls = urls;
        self
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "heartbeat_interval must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_timeout < self.heartbeat_interval {
            return Err(ConfigError::Invalid(
                "heartbeat_timeout must not be shorter than heartbeat_interval".to_string(),
            ));
        }
        if self.reconnect_backoff_cap < self.reconnect_backoff_base {
            return Err(ConfigError::Invalid(
                "reconnect_backoff_cap must not be below reconnect_backoff_base".to_string(),
            ));
        }
        if self.subscriber_buffer_size == 0 || self.ingress_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "buffer sizes must be greater than zero".to_string(),
            ));
        }
        if self.max_retained_orders == 0 {
            return Err(ConfigError::Invalid(
                "max_retained_orders must be greater than zero".to_string(),
            ));
        }
        if self.connection_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "connection_timeout must be greater than zero".to_string(),
            ));
        }
        if self
            .logging
            .level
            .parse::<log::LevelFilter>()
            .is_err()
        {
            return Err(ConfigError::Invalid(format!(
                "unknown log level '{}'",
                self.logging.level
            )));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "Config I/O error: {}", msg),
            ConfigError::Parse(msg) => write!(f, "Config parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
