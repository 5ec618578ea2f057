use futures_util::stream::{self, Stream};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::normalizer::Normalizer;
use crate::config::EngineConfig;
use crate::core::events::{now_millis, MarketEvent, Timestamp, TradeSignal};
use crate::monitoring::metrics::{self, MetricsCollector};
use crate::session::SessionStatus;
use crate::transport::{Decoded, FrameError};

/// Work item entering the pipeline, in arrival order
#[derive(Debug)]
pub enum Ingress {
    /// Market frame decoded by the session task
    Frame {
        decoded: Decoded,
        received_at: Timestamp,
    },
    /// Inbound frame that failed to decode
    Malformed { error: FrameError, raw: String },
    /// Signal published by an external producer
    Signal(TradeSignal),
}

/// Create the bounded queue between the session task and the pipeline
pub fn ingress_channel(config: &EngineConfig) -> (mpsc::Sender<Ingress>, mpsc::Receiver<Ingress>) {
    mpsc::channel(config.ingress_buffer_size)
}

#[derive(Debug)]
enum PipelineCommand {
    Subscribe(oneshot::Sender<broadcast::Receiver<MarketEvent>>),
}

/// Signal pipeline errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The pipeline has stopped
    Closed,
    InvalidSignal(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Closed => write!(f, "Signal pipeline is closed"),
            PipelineError::InvalidSignal(msg) => write!(f, "Invalid signal: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}

/// Normalizes ingress and fans events out to subscribers
pub struct SignalPipeline {
    ingress: mpsc::Receiver<Ingress>,
    commands: mpsc::UnboundedReceiver<PipelineCommand>,
    status: watch::Receiver<SessionStatus>,
    events: broadcast::Sender<MarketEvent>,
    normalizer: Normalizer,
    metrics: MetricsCollector,
    sequence: u64,
}

impl SignalPipeline {
    /// Spawn the pipeline task
    ///
    /// The task runs until the session reaches `Closed`, then drains the
    /// ingress queue and ends every subscription.
    pub fn spawn(
        config: &EngineConfig,
        ingress_tx: mpsc::Sender<Ingress>,
        ingress: mpsc::Receiver<Ingress>,
        status: watch::Receiver<SessionStatus>,
        metrics: MetricsCollector,
    ) -> (PipelineHandle, JoinHandle<()>) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        // broadcast rounds its capacity up; subscriptions enforce the exact bound
        let (events, _) = broadcast::channel(config.subscriber_buffer_size);

        let pipeline = Self {
            ingress,
            commands,
            status,
            events,
            normalizer: Normalizer::new(),
            metrics: metrics.clone(),
            sequence: 0,
        };
        let handle = PipelineHandle {
            ingress: ingress_tx,
            commands: command_tx,
            normalizer: Normalizer::new(),
            metrics,
            buffer_size: config.subscriber_buffer_size,
        };

        (handle, tokio::spawn(pipeline.run()))
    }

    async fn run(mut self) {
        if self.status.borrow_and_update().is_closed() {
            self.finish().await;
            return;
        }
        let mut commands_open = true;
        loop {
            tokio::select! {
                ingress = self.ingress.recv() => match ingress {
                    Some(ingress) => self.process(ingress).await,
                    None => break,
                },
                command = self.commands.recv(), if commands_open => match command {
                    Some(PipelineCommand::Subscribe(reply)) => {
                        let _ = reply.send(self.events.subscribe());
                    }
                    None => commands_open = false,
                },
                changed = self.status.changed() => {
                    if changed.is_err() || self.status.borrow().is_closed() {
                        break;
                    }
                }
            }
        }
        self.finish().await;
    }

    /// Deliver whatever the session forwarded before it closed
    async fn finish(&mut self) {
        while let Ok(ingress) = self.ingress.try_recv() {
            self.process(ingress).await;
        }
        info!("Signal pipeline stopped after {} events", self.sequence);
    }

    async fn process(&mut self, ingress: Ingress) {
        let result = match ingress {
            Ingress::Frame {
                decoded,
                received_at,
            } => self.normalizer.normalize(decoded, received_at),
            Ingress::Malformed { error, raw } => {
                debug!("Malformed frame body: {}", truncate(&raw, 256));
                Err(error)
            }
            Ingress::Signal(signal) => self
                .normalizer
                .normalize_signal(signal, now_millis())
                .map(Some),
        };

        match result {
            Ok(Some(mut event)) => {
                self.sequence += 1;
                event.sequence = self.sequence;
                // no subscribers is not an error
                let _ = self.events.send(event);
                self.metrics
                    .increment_counter(metrics::EVENTS_PUBLISHED, 1)
                    .await;
            }
            Ok(None) => {}
            Err(error) => {
                self.metrics
                    .increment_counter(metrics::FRAMES_MALFORMED, 1)
                    .await;
                warn!("Dropping frame: {}", error);
            }
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

/// Cloneable handle to the pipeline task
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    ingress: mpsc::Sender<Ingress>,
    commands: mpsc::UnboundedSender<PipelineCommand>,
    normalizer: Normalizer,
    metrics: MetricsCollector,
    buffer_size: usize,
}

impl PipelineHandle {
    /// Subscribe to every event published from now on
    ///
    /// Once the pipeline has stopped the returned subscription is already
    /// terminated.
    pub async fn subscribe(&self) -> EventSubscription {
        let (reply, receiver) = oneshot::channel();
        let receiver = match self.commands.send(PipelineCommand::Subscribe(reply)) {
            Ok(()) => receiver.await.ok(),
            Err(_) => None,
        };
        EventSubscription {
            receiver,
            pending: VecDeque::with_capacity(self.buffer_size),
            capacity: self.buffer_size,
            dropped: 0,
            metrics: self.metrics.clone(),
        }
    }

    /// Feed an external signal into the pipeline
    pub async fn publish(&self, signal: TradeSignal) -> Result<(), PipelineError> {
        self.normalizer
            .normalize_signal(signal.clone(), now_millis())
            .map_err(|e| PipelineError::InvalidSignal(e.to_string()))?;
        self.ingress
            .send(Ingress::Signal(signal))
            .await
            .map_err(|_| PipelineError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// A subscriber's view of the event stream
///
/// The buffer is bounded; a subscriber that falls behind loses its oldest
/// events and `dropped()` counts them.
#[derive(Debug)]
pub struct EventSubscription {
    receiver: Option<broadcast::Receiver<MarketEvent>>,
    /// Events taken off the channel, never more than `capacity`
    pending: VecDeque<MarketEvent>,
    capacity: usize,
    dropped: u64,
    metrics: MetricsCollector,
}

impl EventSubscription {
    /// Next event; `None` once the pipeline has stopped and the buffer is drained
    pub async fn next(&mut self) -> Option<MarketEvent> {
        loop {
            let skipped = self.fill();
            self.record_dropped(skipped).await;
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            let receiver = self.receiver.as_mut()?;
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.record_dropped(skipped).await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    /// Move every ready event into `pending`, evicting the oldest past
    /// `capacity`. Returns how many events were lost.
    fn fill(&mut self) -> u64 {
        let Some(receiver) = self.receiver.as_mut() else {
            return 0;
        };
        let mut skipped = 0;
        loop {
            match receiver.try_recv() {
                Ok(event) => {
                    if self.pending.len() >= self.capacity {
                        self.pending.pop_front();
                        skipped += 1;
                    }
                    self.pending.push_back(event);
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => skipped += n,
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Closed) => {
                    self.receiver = None;
                    break;
                }
            }
        }
        skipped
    }

    async fn record_dropped(&mut self, skipped: u64) {
        if skipped == 0 {
            return;
        }
        self.dropped += skipped;
        self.metrics
            .increment_counter(metrics::EVENTS_DROPPED, skipped)
            .await;
        warn!("Subscriber lagged, {} events dropped", skipped);
    }

    /// Events this subscriber lost to overflow
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_terminated(&self) -> bool {
        self.receiver.is_none() && self.pending.is_empty()
    }

    /// Adapt the subscription into a `Stream`
    pub fn into_stream(self) -> impl Stream<Item = MarketEvent> + Send + 'static {
        stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|event| (event, subscription))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::Direction;
    use crate::session::ConnectionState;
    use crate::transport::Inbound;
    use futures_util::StreamExt;
    use uuid::Uuid;

    struct Harness {
        ingress: mpsc::Sender<Ingress>,
        status: watch::Sender<SessionStatus>,
        handle: PipelineHandle,
        task: JoinHandle<()>,
        metrics: MetricsCollector,
    }

    fn harness(subscriber_buffer_size: usize) -> Harness {
        let config = EngineConfig {
            subscriber_buffer_size,
            ..EngineConfig::default()
        };
        let mut initial = SessionStatus::new(Uuid::new_v4(), "test");
        initial.state = ConnectionState::Live;
        let (status, status_rx) = watch::channel(initial);
        let (ingress, ingress_rx) = ingress_channel(&config);
        let metrics = MetricsCollector::new();
        let (handle, task) =
            SignalPipeline::spawn(&config, ingress.clone(), ingress_rx, status_rx, metrics.clone());
        Harness {
            ingress,
            status,
            handle,
            task,
            metrics,
        }
    }

    fn price_frame(asset: &str, price: &str) -> Ingress {
        let text = format!(
            r#"{{"type":"price","asset":"{}","price":"{}"}}"#,
            asset, price
        );
        Ingress::Frame {
            decoded: Inbound::decode(&text).unwrap(),
            received_at: 1,
        }
    }

    fn close(status: &watch::Sender<SessionStatus>) {
        status.send_modify(|s| s.state = ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_events_keep_arrival_order() {
        let h = harness(64);
        let mut subscription = h.handle.subscribe().await;

        for i in 1..=5 {
            h.ingress
                .send(price_frame("EURUSD", &format!("1.{}", i)))
                .await
                .unwrap();
        }

        for expected in 1..=5u64 {
            let event = subscription.next().await.unwrap();
            assert_eq!(event.sequence, expected);
            assert_eq!(event.price().unwrap().to_string(), format!("1.{}", expected));
        }
    }

    #[tokio::test]
    async fn test_malformed_frames_are_counted_not_fatal() {
        let h = harness(64);
        let mut subscription = h.handle.subscribe().await;

        h.ingress
            .send(Ingress::Malformed {
                error: FrameError::Malformed("expected value".to_string()),
                raw: "garbage".to_string(),
            })
            .await
            .unwrap();
        h.ingress.send(price_frame("EURUSD", "0")).await.unwrap();
        h.ingress.send(price_frame("EURUSD", "1.5")).await.unwrap();

        let event = subscription.next().await.unwrap();
        assert_eq!(event.sequence, 1);
        assert_eq!(h.metrics.counter(metrics::FRAMES_MALFORMED).await, 2);
    }

    #[tokio::test]
    async fn test_published_signals_are_delivered() {
        let h = harness(64);
        let mut subscription = h.handle.subscribe().await;

        h.handle
            .publish(TradeSignal::new("BTCUSD", Direction::Put).with_source("ext"))
            .await
            .unwrap();
        let event = subscription.next().await.unwrap();
        assert!(event.is_signal());

        let invalid = TradeSignal::new("BTCUSD", Direction::Put).with_strength(-1.0);
        assert!(matches!(
            h.handle.publish(invalid).await,
            Err(PipelineError::InvalidSignal(_))
        ));
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let h = harness(4);
        let mut slow = h.handle.subscribe().await;

        for i in 1..=10 {
            h.ingress
                .send(price_frame("EURUSD", &format!("1.{}", i)))
                .await
                .unwrap();
        }
        close(&h.status);
        h.task.await.unwrap();

        let mut received = Vec::new();
        while let Some(event) = slow.next().await {
            received.push(event.sequence);
        }
        assert_eq!(received, vec![7, 8, 9, 10]);
        assert_eq!(slow.dropped(), 6);
        assert_eq!(h.metrics.counter(metrics::EVENTS_DROPPED).await, 6);
    }

    #[tokio::test]
    async fn test_subscriber_bound_is_exact() {
        let h = harness(5);
        let mut slow = h.handle.subscribe().await;

        for i in 1..=20 {
            h.ingress
                .send(price_frame("EURUSD", &format!("1.{}", i)))
                .await
                .unwrap();
        }
        close(&h.status);
        h.task.await.unwrap();

        let mut received = Vec::new();
        while let Some(event) = slow.next().await {
            received.push(event.sequence);
        }
        assert_eq!(received, (16..=20).collect::<Vec<u64>>());
        assert_eq!(slow.dropped(), 15);
        assert_eq!(h.metrics.counter(metrics::EVENTS_DROPPED).await, 15);
    }

    #[tokio::test]
    async fn test_bound_holds_while_reading() {
        let h = harness(3);
        let mut slow = h.handle.subscribe().await;

        for i in 1..=2 {
            h.ingress
                .send(price_frame("EURUSD", &format!("1.{}", i)))
                .await
                .unwrap();
        }
        assert_eq!(slow.next().await.unwrap().sequence, 1);

        for i in 3..=7 {
            h.ingress
                .send(price_frame("EURUSD", &format!("1.{}", i)))
                .await
                .unwrap();
        }
        close(&h.status);
        h.task.await.unwrap();

        let mut received = Vec::new();
        while let Some(event) = slow.next().await {
            received.push(event.sequence);
        }
        assert_eq!(received, vec![5, 6, 7]);
        assert_eq!(slow.dropped(), 3);
    }

    #[tokio::test]
    async fn test_starts_closed_session_stops_at_once() {
        let config = EngineConfig::default();
        let mut initial = SessionStatus::new(Uuid::new_v4(), "test");
        initial.state = ConnectionState::Closed;
        let (_status, status_rx) = watch::channel(initial);
        let (ingress, ingress_rx) = ingress_channel(&config);
        ingress.send(price_frame("EURUSD", "1.1")).await.unwrap();

        let metrics = MetricsCollector::new();
        let (handle, task) =
            SignalPipeline::spawn(&config, ingress.clone(), ingress_rx, status_rx, metrics.clone());
        task.await.unwrap();

        assert!(handle.is_closed());
        assert!(handle.subscribe().await.is_terminated());
        assert_eq!(metrics.counter(metrics::EVENTS_PUBLISHED).await, 1);
    }

    #[tokio::test]
    async fn test_close_drains_then_terminates() {
        let h = harness(64);
        let subscription = h.handle.subscribe().await;

        h.ingress.send(price_frame("EURUSD", "1.1")).await.unwrap();
        h.ingress.send(price_frame("GBPUSD", "1.2")).await.unwrap();
        close(&h.status);

        let events: Vec<_> = subscription.into_stream().collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].sequence, 2);

        h.task.await.unwrap();
        let late = h.handle.subscribe().await;
        assert!(late.is_terminated());
        assert!(h.handle.is_closed());
    }
}
