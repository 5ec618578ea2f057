use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backoff::Backoff;
use super::handle::{respond, SessionCommand, SessionHandle};
use super::state::{ConnectionState, SessionNotice, SessionStatus};
use crate::config::EngineConfig;
use crate::core::events::now_millis;
use crate::monitoring::metrics::{self, MetricsCollector};
use crate::security::Credentials;
use crate::signals::Ingress;
use crate::transport::{Connector, Frame, Inbound, Link, Outbound, TransportError};
use crate::types::Amount;

const NOTICE_CAPACITY: usize = 64;
const RAW_TAP_CAPACITY: usize = 256;

/// Where the session task delivers inbound traffic
#[derive(Debug, Clone)]
pub struct SessionRoutes {
    /// Market frames for the signal pipeline; fed with `try_send`
    pub ingress: mpsc::Sender<Ingress>,
    /// Order lifecycle updates for the order engine
    pub order_updates: mpsc::UnboundedSender<Inbound>,
}

enum LiveExit {
    Shutdown(Option<oneshot::Sender<()>>),
    Lost(TransportError),
}

enum ReconnectExit {
    Shutdown(Option<oneshot::Sender<()>>),
    Failed(TransportError),
}

/// State owned by the session task
///
/// Only this task touches the link; everyone else talks to it through a
/// `SessionHandle` and observes it through the status and notice channels.
pub struct SessionCoordinator {
    id: Uuid,
    credentials: Credentials,
    config: EngineConfig,
    backoff: Backoff,
    connector: Arc<dyn Connector>,
    routes: SessionRoutes,
    metrics: MetricsCollector,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    status_tx: watch::Sender<SessionStatus>,
    notice_tx: broadcast::Sender<SessionNotice>,
    raw_tx: broadcast::Sender<String>,
    balance_tx: watch::Sender<Option<Amount>>,
    ping_seq: u64,
    last_heartbeat: Instant,
}

impl SessionCoordinator {
    /// Open the first link, authenticate and spawn the session task
    ///
    /// The initial connect is a single attempt over the connector's
    /// endpoints; failures are returned to the caller instead of retried.
    pub async fn connect(
        credentials: Credentials,
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        routes: SessionRoutes,
        metrics: MetricsCollector,
    ) -> Result<(SessionHandle, JoinHandle<()>), TransportError> {
        let id = Uuid::new_v4();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (status_tx, status_rx) =
            watch::channel(SessionStatus::new(id, credentials.to_string()));
        let (notice_tx, _) = broadcast::channel(NOTICE_CAPACITY);
        let (raw_tx, _) = broadcast::channel(RAW_TAP_CAPACITY);
        let (balance_tx, balance_rx) = watch::channel(None);

        let handle = SessionHandle::new(
            command_tx,
            status_rx,
            notice_tx.clone(),
            raw_tx.clone(),
            balance_rx,
            config.request_timeout,
        );

        let mut coordinator = Self {
            id,
            credentials,
            backoff: Backoff::from_config(&config),
            config,
            connector,
            routes,
            metrics,
            commands,
            status_tx,
            notice_tx,
            raw_tx,
            balance_tx,
            ping_seq: 0,
            last_heartbeat: Instant::now(),
        };

        info!(
            "Connecting session {} ({}) to {}",
            id,
            coordinator.credentials,
            coordinator.connector.describe()
        );
        let link = match establish(
            coordinator.connector.as_ref(),
            &coordinator.credentials,
            coordinator.config.connection_timeout,
        )
        .await
        {
            Ok(link) => link,
            Err(e) => {
                error!("Session {} failed to connect: {}", id, e);
                coordinator.transition(ConnectionState::Closed, Some(e.clone()));
                return Err(e);
            }
        };
        coordinator.go_live();

        Ok((handle, tokio::spawn(coordinator.run(link))))
    }

    async fn run(mut self, mut link: Box<dyn Link>) {
        let shutdown_reply = loop {
            match self.run_live(link.as_mut()).await {
                LiveExit::Shutdown(reply) => {
                    release(link).await;
                    self.transition(ConnectionState::Closed, None);
                    break reply;
                }
                LiveExit::Lost(error) => {
                    warn!("Session {} lost its link: {}", self.id, error);
                    release(link).await;
                    self.transition(ConnectionState::Degraded, Some(error));

                    match self.reconnect().await {
                        Ok(next) => {
                            link = next;
                            self.metrics
                                .increment_counter(metrics::SESSION_RECONNECTS, 1)
                                .await;
                            self.go_live();
                        }
                        Err(ReconnectExit::Shutdown(reply)) => {
                            self.transition(ConnectionState::Closed, None);
                            break reply;
                        }
                        Err(ReconnectExit::Failed(error)) => {
                            error!("Session {} closed: {}", self.id, error);
                            self.transition(ConnectionState::Closed, Some(error));
                            break None;
                        }
                    }
                }
            }
        };

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                SessionCommand::Send { reply, .. } => {
                    respond(reply, Err(TransportError::NotConnected))
                }
                SessionCommand::Shutdown { reply } => {
                    let _ = reply.send(());
                }
            }
        }
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
        info!("Session {} stopped", self.id);
    }

    /// Serve the link until it fails or the caller shuts down
    async fn run_live(&mut self, link: &mut dyn Link) -> LiveExit {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let generation = self.status_tx.borrow().generation;

        loop {
            tokio::select! {
                inbound = link.recv() => match inbound {
                    Some(Ok(frame)) => {
                        if let Err(e) = self.on_frame(link, frame).await {
                            return LiveExit::Lost(e);
                        }
                    }
                    Some(Err(e)) => return LiveExit::Lost(e),
                    None => {
                        return LiveExit::Lost(TransportError::Network(
                            "link closed by peer".to_string(),
                        ))
                    }
                },
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Send { frame, generation: target, reply }) => {
                        if target != generation {
                            debug!(
                                "Discarding frame for generation {} (current {})",
                                target, generation
                            );
                            respond(reply, Err(TransportError::NotConnected));
                        } else if let Err(e) = link.send(frame).await {
                            respond(reply, Err(e.clone()));
                            return LiveExit::Lost(e);
                        } else {
                            respond(reply, Ok(()));
                        }
                    }
                    Some(SessionCommand::Shutdown { reply }) => {
                        return LiveExit::Shutdown(Some(reply));
                    }
                    // every handle is gone
                    None => return LiveExit::Shutdown(None),
                },
                _ = heartbeat.tick() => {
                    let silent_for = self.last_heartbeat.elapsed();
                    if silent_for >= self.config.heartbeat_timeout {
                        self.metrics
                            .increment_counter(metrics::HEARTBEAT_TIMEOUTS, 1)
                            .await;
                        return LiveExit::Lost(TransportError::Timeout(format!(
                            "no heartbeat response for {:?}",
                            silent_for
                        )));
                    }
                    if let Err(e) = self.send_ping(link).await {
                        return LiveExit::Lost(e);
                    }
                }
            }
        }
    }

    async fn send_ping(&mut self, link: &mut dyn Link) -> Result<(), TransportError> {
        self.ping_seq += 1;
        let frame = Outbound::Ping { seq: self.ping_seq }
            .encode()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        link.send(frame).await
    }

    async fn on_frame(&mut self, link: &mut dyn Link, frame: Frame) -> Result<(), TransportError> {
        match frame {
            Frame::Ping(data) => link.send(Frame::Pong(data)).await?,
            Frame::Pong(_) => self.heartbeat_received(),
            Frame::Close => {
                return Err(TransportError::Network("close frame received".to_string()));
            }
            Frame::Text(text) => self.on_text(text).await,
            Frame::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => self.on_text(text).await,
                Err(e) => {
                    self.forward(Ingress::Malformed {
                        error: crate::transport::FrameError::Malformed(e.to_string()),
                        raw: String::new(),
                    })
                    .await
                }
            },
        }
        Ok(())
    }

    async fn on_text(&mut self, text: String) {
        // no raw listeners is the common case
        let _ = self.raw_tx.send(text.clone());

        let decoded = match Inbound::decode(&text) {
            Ok(decoded) => decoded,
            Err(error) => {
                self.forward(Ingress::Malformed { error, raw: text }).await;
                return;
            }
        };

        if decoded.message.is_order_update() {
            if self.routes.order_updates.send(decoded.message).is_err() {
                debug!("Order engine stopped, dropping order update");
            }
            return;
        }

        let market = match &decoded.message {
            Inbound::Pong { .. } => {
                self.heartbeat_received();
                false
            }
            Inbound::Balance { balance } => {
                self.balance_tx.send_replace(Some(*balance));
                false
            }
            Inbound::AuthOk | Inbound::AuthFailed { .. } => {
                debug!("Ignoring handshake frame on a live session");
                false
            }
            _ => true,
        };
        if market {
            self.forward(Ingress::Frame {
                decoded,
                received_at: now_millis(),
            })
            .await;
        }
    }

    /// Hand a frame to the pipeline without ever blocking the link
    async fn forward(&self, ingress: Ingress) {
        match self.routes.ingress.try_send(ingress) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics
                    .increment_counter(metrics::FRAMES_DROPPED, 1)
                    .await;
                warn!("Ingress queue full, dropping market frame");
            }
            Err(TrySendError::Closed(_)) => debug!("Signal pipeline stopped, dropping frame"),
        }
    }

    fn heartbeat_received(&mut self) {
        self.last_heartbeat = Instant::now();
        self.status_tx
            .send_modify(|status| status.last_heartbeat = Some(Utc::now()));
    }

    /// Retry with bounded exponential backoff
    async fn reconnect(&mut self) -> Result<Box<dyn Link>, ReconnectExit> {
        let mut last_error = None;

        for attempt in 0..self.backoff.max_attempts {
            let delay = self.backoff.delay(attempt);
            self.status_tx
                .send_modify(|status| status.reconnect_attempt = attempt + 1);
            info!(
                "Session {} reconnecting in {:?} (attempt {}/{})",
                self.id,
                delay,
                attempt + 1,
                self.backoff.max_attempts
            );
            self.idle(delay).await?;

            let attempt_result = {
                let establishing = establish(
                    self.connector.as_ref(),
                    &self.credentials,
                    self.config.connection_timeout,
                );
                tokio::pin!(establishing);
                loop {
                    tokio::select! {
                        result = &mut establishing => break result,
                        command = self.commands.recv() => {
                            if let Some(exit) = reject_while_offline(command) {
                                return Err(exit);
                            }
                        }
                    }
                }
            };

            match attempt_result {
                Ok(link) => return Ok(link),
                Err(TransportError::Auth(reason)) => {
                    return Err(ReconnectExit::Failed(TransportError::Auth(reason)));
                }
                Err(e) => {
                    warn!(
                        "Session {} reconnect attempt {} failed: {}",
                        self.id,
                        attempt + 1,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        let detail = last_error
            .map(|e| format!(": {}", e))
            .unwrap_or_default();
        Err(ReconnectExit::Failed(TransportError::ConnectionLost(format!(
            "reconnect attempts exhausted after {} tries{}",
            self.backoff.max_attempts, detail
        ))))
    }

    /// Sleep through a backoff delay while still answering commands
    async fn idle(&mut self, delay: Duration) -> Result<(), ReconnectExit> {
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                command = self.commands.recv() => {
                    if let Some(exit) = reject_while_offline(command) {
                        return Err(exit);
                    }
                }
            }
        }
    }

    fn go_live(&mut self) {
        self.last_heartbeat = Instant::now();
        self.status_tx.send_modify(|status| {
            status.generation += 1;
            status.reconnect_attempt = 0;
            status.last_heartbeat = Some(Utc::now());
        });
        self.transition(ConnectionState::Live, None);
    }

    fn transition(&self, next: ConnectionState, error: Option<TransportError>) {
        let mut previous = next;
        let mut generation = 0;
        self.status_tx.send_modify(|status| {
            previous = status.state;
            generation = status.generation;
            status.state = next;
            if error.is_some() {
                status.last_error = error.clone();
            }
        });

        if !previous.can_transition_to(next) {
            warn!(
                "Session {} made an unexpected transition {} -> {}",
                self.id, previous, next
            );
        }
        info!(
            session = %self.id,
            generation,
            "Session state {} -> {}",
            previous,
            next
        );
        // nobody listening is fine
        let _ = self.notice_tx.send(SessionNotice {
            session_id: self.id,
            previous,
            state: next,
            generation,
            error,
            at: Utc::now(),
        });
    }
}

/// Answer a command received while no link is up; `Some` means stop reconnecting
fn reject_while_offline(command: Option<SessionCommand>) -> Option<ReconnectExit> {
    match command {
        Some(SessionCommand::Send { reply, .. }) => {
            respond(reply, Err(TransportError::NotConnected));
            None
        }
        Some(SessionCommand::Shutdown { reply }) => Some(ReconnectExit::Shutdown(Some(reply))),
        None => Some(ReconnectExit::Shutdown(None)),
    }
}

/// Open a link and authenticate on it within `timeout`
async fn establish(
    connector: &dyn Connector,
    credentials: &Credentials,
    timeout: Duration,
) -> Result<Box<dyn Link>, TransportError> {
    let mut link = connector.open().await?;
    match time::timeout(timeout, authenticate(link.as_mut(), credentials)).await {
        Ok(Ok(())) => Ok(link),
        Ok(Err(e)) => {
            release(link).await;
            Err(e)
        }
        Err(_) => {
            release(link).await;
            Err(TransportError::Timeout(
                "authentication handshake".to_string(),
            ))
        }
    }
}

async fn authenticate(link: &mut dyn Link, credentials: &Credentials) -> Result<(), TransportError> {
    let auth = Outbound::Auth {
        session: credentials.token.expose().to_string(),
        demo: credentials.demo,
    }
    .encode()
    .map_err(|e| TransportError::Protocol(e.to_string()))?;
    link.send(auth).await?;

    loop {
        let frame = match link.recv().await {
            Some(frame) => frame?,
            None => {
                return Err(TransportError::Network(
                    "link closed during authentication".to_string(),
                ))
            }
        };

        match frame {
            Frame::Ping(data) => link.send(Frame::Pong(data)).await?,
            Frame::Close => {
                return Err(TransportError::Network(
                    "link closed during authentication".to_string(),
                ))
            }
            other => {
                let Some(text) = other.as_text() else {
                    continue;
                };
                match Inbound::decode(text).map(|decoded| decoded.message) {
                    Ok(Inbound::AuthOk) => return Ok(()),
                    Ok(Inbound::AuthFailed { reason }) => return Err(TransportError::Auth(reason)),
                    Ok(_) => debug!("Skipping frame received before authentication"),
                    Err(e) => debug!("Skipping undecodable frame during handshake: {}", e),
                }
            }
        }
    }
}

async fn release(mut link: Box<dyn Link>) {
    if let Err(e) = link.close().await {
        debug!("Error while closing link: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockBroker;
    use serde_json::json;

    struct Fixture {
        broker: MockBroker,
        handle: SessionHandle,
        task: JoinHandle<()>,
        ingress: mpsc::Receiver<Ingress>,
        orders: mpsc::UnboundedReceiver<Inbound>,
        metrics: MetricsCollector,
    }

    fn config() -> EngineConfig {
        EngineConfig {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(3),
            reconnect_backoff_base: Duration::from_millis(100),
            reconnect_backoff_cap: Duration::from_millis(400),
            max_reconnect_attempts: 3,
            connection_timeout: Duration::from_secs(2),
            ingress_buffer_size: 4,
            ..EngineConfig::default()
        }
    }

    async fn start(broker: MockBroker, config: EngineConfig) -> Result<Fixture, TransportError> {
        let (ingress_tx, ingress) = mpsc::channel(config.ingress_buffer_size);
        let (order_tx, orders) = mpsc::unbounded_channel();
        let metrics = MetricsCollector::new();
        let (handle, task) = SessionCoordinator::connect(
            Credentials::demo("abcdefghijklmnopqrstuvwxyz"),
            config,
            Arc::new(broker.connector()),
            SessionRoutes {
                ingress: ingress_tx,
                order_updates: order_tx,
            },
            metrics.clone(),
        )
        .await?;
        Ok(Fixture {
            broker,
            handle,
            task,
            ingress,
            orders,
            metrics,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_authenticates() {
        let f = start(MockBroker::new(), config()).await.unwrap();
        let status = f.handle.status();
        assert_eq!(status.state, ConnectionState::Live);
        assert_eq!(status.generation, 1);

        let auth = f.broker.sent_of_type("auth");
        assert_eq!(auth[0]["session"], "abcdefghijklmnopqrstuvwxyz");
        assert_eq!(auth[0]["demo"], true);
        assert!(!status.account.contains("efgh"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_rejected_on_connect() {
        let broker = MockBroker::new();
        broker.reject_next_auth(1);
        let result = start(broker.clone(), config()).await;
        assert!(matches!(result, Err(TransportError::Auth(_))));
        assert_eq!(broker.closed_links(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failure_on_connect() {
        let broker = MockBroker::new();
        broker.fail_next_connects(1);
        let result = start(broker.clone(), config()).await;
        assert!(matches!(result, Err(TransportError::Network(_))));
        assert_eq!(broker.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let broker = MockBroker::new();
        broker.set_auto_auth(false);
        let result = start(broker, config()).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_routing() {
        let mut f = start(MockBroker::new(), config()).await.unwrap();

        f.broker
            .push_json(json!({"type": "price", "asset": "EURUSD", "price": "1.1"}));
        f.broker
            .push_json(json!({"type": "order_ack", "key": "k1", "order_id": "b-1"}));
        f.broker.push_json(json!({"type": "balance", "balance": "250.5"}));
        f.broker.push_text("not json");

        assert!(matches!(f.ingress.recv().await, Some(Ingress::Frame { .. })));
        assert!(matches!(
            f.orders.recv().await,
            Some(Inbound::OrderAck { .. })
        ));
        assert!(matches!(
            f.ingress.recv().await,
            Some(Ingress::Malformed { .. })
        ));
        assert_eq!(f.handle.balance().unwrap().to_string(), "250.5");
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_ingress_drops_frames() {
        let f = start(MockBroker::new(), config()).await.unwrap();
        for i in 0..10 {
            f.broker.push_json(json!({"type": "price", "asset": "EURUSD", "price": format!("1.{}", i + 1)}));
        }
        f.broker.push_json(json!({"type": "order_cancelled", "key": "k1"}));

        let mut orders = f.orders;
        orders.recv().await.unwrap();
        assert_eq!(f.metrics.counter(metrics::FRAMES_DROPPED).await, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pings_and_timeout() {
        let f = start(MockBroker::new(), config()).await.unwrap();
        f.broker.wait_for_sent("ping", 3).await;
        assert!(f.handle.status().is_live());

        f.broker.set_auto_pong(false);
        let mut notices = f.handle.notices();
        let notice = notices.recv().await.unwrap();
        assert_eq!(notice.state, ConnectionState::Degraded);
        assert!(matches!(notice.error, Some(TransportError::Timeout(_))));

        assert!(f.handle.wait_for_state(ConnectionState::Live).await);
        assert_eq!(f.handle.status().generation, 2);
        assert_eq!(f.metrics.counter(metrics::HEARTBEAT_TIMEOUTS).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_drop() {
        let f = start(MockBroker::new(), config()).await.unwrap();
        f.broker.fail_next_connects(2);
        f.broker.drop_link();

        assert!(f.handle.wait_for_state(ConnectionState::Degraded).await);
        assert!(f.handle.wait_for_state(ConnectionState::Live).await);
        let status = f.handle.status();
        assert_eq!(status.generation, 2);
        assert_eq!(status.reconnect_attempt, 0);
        // initial connect, two refused attempts, one success
        assert_eq!(f.broker.connects(), 4);
        assert_eq!(f.metrics.counter(metrics::SESSION_RECONNECTS).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_closes_session() {
        let f = start(MockBroker::new(), config()).await.unwrap();
        f.broker.fail_next_connects(u32::MAX);
        f.broker.drop_link();

        f.task.await.unwrap();
        let status = f.handle.status();
        assert_eq!(status.state, ConnectionState::Closed);
        assert!(matches!(
            status.last_error,
            Some(TransportError::ConnectionLost(_))
        ));
        assert_eq!(f.broker.connects(), 1 + 3);
        assert_eq!(
            f.handle.send_raw("{}").await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reauth_failure_is_fatal() {
        let f = start(MockBroker::new(), config()).await.unwrap();
        f.broker.reject_next_auth(1);
        f.broker.drop_link();

        f.task.await.unwrap();
        let status = f.handle.status();
        assert_eq!(status.state, ConnectionState::Closed);
        assert!(matches!(status.last_error, Some(TransportError::Auth(_))));
        assert_eq!(f.broker.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff() {
        let mut config = config();
        config.reconnect_backoff_base = Duration::from_secs(60);
        config.reconnect_backoff_cap = Duration::from_secs(60);
        let f = start(MockBroker::new(), config).await.unwrap();
        f.broker.drop_link();
        assert!(f.handle.wait_for_state(ConnectionState::Degraded).await);

        f.handle.shutdown().await;
        assert_eq!(f.handle.state(), ConnectionState::Closed);
        assert_eq!(f.handle.status().last_error.map(|e| e.is_retryable()), Some(true));
        // no reconnect was attempted
        assert_eq!(f.broker.connects(), 1);
        f.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_link() {
        let f = start(MockBroker::new(), config()).await.unwrap();
        f.handle.shutdown().await;
        assert_eq!(f.handle.state(), ConnectionState::Closed);
        assert_eq!(f.broker.closed_links(), 1);
        f.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_frames_are_discarded() {
        let f = start(MockBroker::new(), config()).await.unwrap();
        f.broker.drop_link();
        assert!(f.handle.wait_for_state(ConnectionState::Degraded).await);
        assert!(f.handle.wait_for_state(ConnectionState::Live).await);

        f.handle.queue(1, Frame::text(r#"{"type":"stale"}"#)).unwrap();
        f.handle.send_raw(r#"{"type":"fresh"}"#).await.unwrap();

        assert!(f.broker.sent_of_type("stale").is_empty());
        assert_eq!(f.broker.sent_of_type("fresh").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_request() {
        let f = start(MockBroker::new(), config()).await.unwrap();
        let broker = f.broker.clone();
        let responder = tokio::spawn(async move {
            broker.wait_for_sent("get_balance", 1).await;
            broker.push_text(r#"{"type":"noise"}"#);
            broker.push_text(r#"{"type":"balance","balance":"9"}"#);
        });

        let reply = f
            .handle
            .raw_request(
                r#"{"type":"get_balance"}"#,
                &crate::transport::Validator::contains("\"balance\""),
                Some(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(reply, r#"{"type":"balance","balance":"9"}"#);
        responder.await.unwrap();

        let timed_out = f
            .handle
            .raw_request(
                r#"{"type":"get_balance"}"#,
                &crate::transport::Validator::contains("never"),
                Some(Duration::from_secs(1)),
            )
            .await;
        assert!(matches!(timed_out, Err(TransportError::Timeout(_))));
    }
}
