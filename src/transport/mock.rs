use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};

use super::error::TransportError;
use super::frame::Frame;
use super::link::{Connector, Link};

/// What a mock link yields next
#[derive(Debug)]
enum LinkInput {
    Frame(Frame),
    /// Abrupt failure of the link
    Fail(String),
    /// Orderly close by the peer
    Close,
}

#[derive(Debug)]
struct BrokerState {
    connects: u32,
    fail_connects: u32,
    reject_auth: u32,
    auto_auth: bool,
    auto_pong: bool,
    current: Option<mpsc::UnboundedSender<LinkInput>>,
    /// Frames written by the engine, tagged with the link index they went out on
    sent: Vec<(u32, Frame)>,
    closed_links: u32,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BrokerState>,
    sent_notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-process broker double that tests script and inspect
///
/// Authentication and heartbeats are answered automatically unless disabled,
/// everything else is pushed explicitly.
#[derive(Debug, Clone)]
pub struct MockBroker {
    shared: Arc<Shared>,
}

impl MockBroker {
    /// Create a new mock broker
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState {
                    connects: 0,
                    fail_connects: 0,
                    reject_auth: 0,
                    auto_auth: true,
                    auto_pong: true,
                    current: None,
                    sent: Vec::new(),
                    closed_links: 0,
                }),
                sent_notify: Notify::new(),
            }),
        }
    }

    /// Connector whose links talk to this broker
    pub fn connector(&self) -> MockConnector {
        MockConnector {
            shared: self.shared.clone(),
        }
    }

    /// Deliver a frame on the current link
    pub fn push(&self, frame: Frame) -> bool {
        let state = self.shared.lock();
        match &state.current {
            Some(tx) => tx.send(LinkInput::Frame(frame)).is_ok(),
            None => false,
        }
    }

    /// Deliver a text frame on the current link
    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.push(Frame::Text(text.into()))
    }

    /// Deliver a JSON document on the current link
    pub fn push_json(&self, value: serde_json::Value) -> bool {
        self.push_text(value.to_string())
    }

    /// Make the current link fail as if the network dropped
    pub fn drop_link(&self) -> bool {
        let mut state = self.shared.lock();
        match state.current.take() {
            Some(tx) => tx.send(LinkInput::Fail("connection reset".to_string())).is_ok(),
            None => false,
        }
    }

    /// Close the current link from the broker side
    pub fn close_link(&self) -> bool {
        let mut state = self.shared.lock();
        match state.current.take() {
            Some(tx) => tx.send(LinkInput::Close).is_ok(),
            None => false,
        }
    }

    /// Refuse the next `count` connection attempts
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.lock().fail_connects = count;
    }

    /// Answer the next `count` auth frames with `auth_failed`
    pub fn reject_next_auth(&self, count: u32) {
        self.shared.lock().reject_auth = count;
    }

    /// Stop answering auth frames (the handshake then times out)
    pub fn set_auto_auth(&self, enabled: bool) {
        self.shared.lock().auto_auth = enabled;
    }

    /// Stop answering heartbeat pings
    pub fn set_auto_pong(&self, enabled: bool) {
        self.shared.lock().auto_pong = enabled;
    }

    /// Successful and failed connection attempts so far
    pub fn connects(&self) -> u32 {
        self.shared.lock().connects
    }

    /// Links closed by the engine
    pub fn closed_links(&self) -> u32 {
        self.shared.lock().closed_links
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().current.is_some()
    }

    /// Every frame written by the engine
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.shared
            .lock()
            .sent
            .iter()
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    /// JSON text frames of the given `type`, in send order
    pub fn sent_of_type(&self, kind: &str) -> Vec<serde_json::Value> {
        self.sent_messages()
            .into_iter()
            .filter(|(_, value)| value["type"] == kind)
            .map(|(_, value)| value)
            .collect()
    }

    /// JSON text frames of the given `type` with the link index they were sent on
    pub fn sent_of_type_by_link(&self, kind: &str) -> Vec<(u32, serde_json::Value)> {
        self.sent_messages()
            .into_iter()
            .filter(|(_, value)| value["type"] == kind)
            .collect()
    }

    fn sent_messages(&self) -> Vec<(u32, serde_json::Value)> {
        self.shared
            .lock()
            .sent
            .iter()
            .filter_map(|(link, frame)| {
                frame
                    .as_text()
                    .and_then(|text| serde_json::from_str(text).ok())
                    .map(|value| (*link, value))
            })
            .collect()
    }

    /// Wait until at least `count` frames of `kind` were sent
    pub async fn wait_for_sent(&self, kind: &str, count: usize) -> Vec<serde_json::Value> {
        loop {
            let notified = self.shared.sent_notify.notified();
            let found = self.sent_of_type(kind);
            if found.len() >= count {
                return found;
            }
            notified.await;
        }
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Connector half of a `MockBroker`
#[derive(Debug, Clone)]
pub struct MockConnector {
    shared: Arc<Shared>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self) -> Result<Box<dyn Link>, TransportError> {
        let mut state = self.shared.lock();
        state.connects += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(TransportError::Network("mock connect refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.current = Some(tx.clone());
        Ok(Box::new(MockLink {
            index: state.connects,
            shared: self.shared.clone(),
            own_tx: tx,
            inbound: rx,
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        "mock broker".to_string()
    }
}

/// Link half of a `MockBroker`
pub struct MockLink {
    index: u32,
    shared: Arc<Shared>,
    own_tx: mpsc::UnboundedSender<LinkInput>,
    inbound: mpsc::UnboundedReceiver<LinkInput>,
    closed: bool,
}

impl MockLink {
    fn auto_reply(&self, state: &mut BrokerState, frame: &Frame) -> Option<Frame> {
        if let Frame::Ping(data) = frame {
            return state.auto_pong.then(|| Frame::Pong(data.clone()));
        }
        let value: serde_json::Value = serde_json::from_str(frame.as_text()?).ok()?;
        match value["type"].as_str()? {
            "auth" if state.auto_auth => {
                if state.reject_auth > 0 {
                    state.reject_auth -= 1;
                    Some(Frame::text(
                        r#"{"type":"auth_failed","reason":"invalid session"}"#,
                    ))
                } else {
                    Some(Frame::text(r#"{"type":"auth_ok"}"#))
                }
            }
            "ping" if state.auto_pong => {
                let seq = value["seq"].as_u64().unwrap_or_default();
                Some(Frame::Text(format!(r#"{{"type":"pong","seq":{}}}"#, seq)))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Link for MockLink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::NotConnected);
        }
        let reply = {
            let mut state = self.shared.lock();
            let is_current = state
                .current
                .as_ref()
                .map(|tx| tx.same_channel(&self.own_tx))
                .unwrap_or(false);
            if !is_current {
                return Err(TransportError::Network("connection reset".to_string()));
            }
            state.sent.push((self.index, frame.clone()));
            self.auto_reply(&mut state, &frame)
        };
        self.shared.sent_notify.notify_waiters();

        if let Some(reply) = reply {
            let _ = self.own_tx.send(LinkInput::Frame(reply));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        if self.closed {
            return None;
        }
        match self.inbound.recv().await? {
            LinkInput::Frame(frame) => Some(Ok(frame)),
            LinkInput::Fail(reason) => {
                self.closed = true;
                Some(Err(TransportError::Network(reason)))
            }
            LinkInput::Close => {
                self.closed = true;
                None
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut state = self.shared.lock();
        state.closed_links += 1;
        let is_current = state
            .current
            .as_ref()
            .map(|tx| tx.same_channel(&self.own_tx))
            .unwrap_or(false);
        if is_current {
            state.current = None;
        }
        Ok(())
    }
}
