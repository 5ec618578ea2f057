pub mod types;
pub mod core;
pub mod config;
pub mod security;
pub mod monitoring;
pub mod logging;
pub mod transport;
pub mod session;
pub mod signals;
pub mod oms;
pub mod client;

pub use types::{Amount, Asset, Price};
pub use crate::core::events::{
    Direction, EventPayload, IdempotencyKey, MarketEvent, OrderId, OrderRequest, OrderStatus,
    PriceTick, Timestamp, TradeSignal,
};
pub use config::{ConfigError, EngineConfig, LoggingConfig};
pub use security::{Credentials, CredentialsError, SessionToken};
pub use monitoring::{HealthCheckResult, HealthChecker, HealthStatus, MetricsCollector};
pub use logging::{init_logging, LogBuilder, LogStream, LoggingError};
pub use transport::{
    Connector, Frame, FrameError, Inbound, Link, MockBroker, MockConnector, Outbound,
    TransportError, Validator, WebSocketConnector,
};
pub use session::{Backoff, ConnectionState, SessionHandle, SessionNotice, SessionStatus};
pub use signals::{EventSubscription, PipelineError};
pub use oms::{OrderError, OrderState, OrderTicket};
pub use client::{Client, ClientError};
