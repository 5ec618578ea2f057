use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{ConfigError, EngineConfig};
use crate::core::events::{IdempotencyKey, OrderRequest, TradeSignal};
use crate::monitoring::{HealthCheckResult, HealthChecker, MetricsCollector};
use crate::oms::{OrderEngine, OrderEngineHandle, OrderError, OrderState, OrderTicket};
use crate::security::{Credentials, CredentialsError};
use crate::session::{SessionCoordinator, SessionHandle, SessionNotice, SessionRoutes, SessionStatus};
use crate::signals::{ingress_channel, EventSubscription, PipelineError, PipelineHandle, SignalPipeline};
use crate::transport::{Connector, TransportError, Validator, WebSocketConnector};
use crate::types::Amount;

/// Errors from connecting a client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    Config(ConfigError),
    Credentials(CredentialsError),
    Transport(TransportError),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Config(e) => write!(f, "{}", e),
            ClientError::Credentials(e) => write!(f, "{}", e),
            ClientError::Transport(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ConfigError> for ClientError {
    fn from(e: ConfigError) -> Self {
        ClientError::Config(e)
    }
}

impl From<CredentialsError> for ClientError {
    fn from(e: CredentialsError) -> Self {
        ClientError::Credentials(e)
    }
}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        ClientError::Transport(e)
    }
}

/// Entry point: one authenticated broker session with its pipeline and order engine
///
/// Cloning is cheap; all clones drive the same session.
#[derive(Clone)]
pub struct Client {
    session: SessionHandle,
    pipeline: PipelineHandle,
    engine: OrderEngineHandle,
    metrics: MetricsCollector,
    health: HealthChecker,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Client {
    /// Authenticate over `connector` and start the background tasks
    pub async fn connect(
        credentials: Credentials,
        config: EngineConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        credentials.validate()?;

        let metrics = MetricsCollector::new();
        let (ingress_tx, ingress_rx) = ingress_channel(&config);
        let (order_tx, order_rx) = mpsc::unbounded_channel();
        info!("Connecting to {}", connector.describe());

        let (session, session_task) = SessionCoordinator::connect(
            credentials,
            config.clone(),
            connector,
            SessionRoutes {
                ingress: ingress_tx.clone(),
                order_updates: order_tx,
            },
            metrics.clone(),
        )
        .await?;

        let (pipeline, pipeline_task) = SignalPipeline::spawn(
            &config,
            ingress_tx,
            ingress_rx,
            session.watch_status(),
            metrics.clone(),
        );
        let (engine, engine_task) =
            OrderEngine::spawn(&config, session.clone(), order_rx, metrics.clone());

        Ok(Self {
            session,
            pipeline,
            engine,
            metrics,
            health: HealthChecker::new(config.heartbeat_timeout),
            tasks: Arc::new(Mutex::new(vec![session_task, pipeline_task, engine_task])),
        })
    }

    /// Connect over WebSocket to the endpoints in `config.urls`, in order
    pub async fn connect_websocket(
        credentials: Credentials,
        config: EngineConfig,
    ) -> Result<Self, ClientError> {
        if config.urls.is_empty() {
            return Err(ConfigError::Invalid("no endpoint urls configured".to_string()).into());
        }
        let connector = WebSocketConnector::new(config.urls.clone(), config.connection_timeout);
        Self::connect(credentials, config, Arc::new(connector)).await
    }

    /// Subscribe to normalized market events
    pub async fn subscribe(&self) -> EventSubscription {
        self.pipeline.subscribe().await
    }

    /// Inject an externally generated signal into the event stream
    pub async fn publish_signal(&self, signal: TradeSignal) -> Result<(), PipelineError> {
        self.pipeline.publish(signal).await
    }

    /// Submit an order and wait for its terminal state
    pub async fn submit(&self, request: OrderRequest) -> Result<OrderState, OrderError> {
        self.engine.submit(request).await
    }

    /// Submit an order without waiting
    pub async fn place(&self, request: OrderRequest) -> Result<OrderTicket, OrderError> {
        self.engine.place(request).await
    }

    pub async fn cancel(&self, key: impl Into<IdempotencyKey>) -> Result<OrderState, OrderError> {
        self.engine.cancel(key).await
    }

    pub async fn order_state(
        &self,
        key: impl Into<IdempotencyKey>,
    ) -> Result<Option<OrderState>, OrderError> {
        self.engine.state(key).await
    }

    pub async fn orders(&self) -> Result<Vec<OrderState>, OrderError> {
        self.engine.orders().await
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.session.watch_status()
    }

    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.session.notices()
    }

    /// Last balance reported by the broker
    pub fn balance(&self) -> Option<Amount> {
        self.session.balance()
    }

    pub async fn send_raw(&self, payload: impl Into<String>) -> Result<(), TransportError> {
        self.session.send_raw(payload).await
    }

    /// Send `payload` and return the first inbound text accepted by `validator`
    pub async fn raw_request(
        &self,
        payload: impl Into<String>,
        validator: &Validator,
    ) -> Result<String, TransportError> {
        self.session.raw_request(payload, validator, None).await
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub async fn health(&self) -> HealthCheckResult {
        self.health.record_session(&self.session.status()).await;
        self.health.check().await
    }

    /// Drain the order engine, close the session and wait for all tasks
    pub async fn shutdown(&self) {
        info!("Shutting down client");
        self.engine.shutdown().await;
        self.session.shutdown().await;

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("Client stopped");
    }
}
