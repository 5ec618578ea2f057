use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use super::state::{ConnectionState, SessionNotice, SessionStatus};
use crate::transport::{Frame, Outbound, TransportError, Validator};
use crate::types::Amount;

/// Requests served by the session task
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Write a frame if the session is still on `generation`
    Send {
        frame: Frame,
        generation: u64,
        reply: Option<oneshot::Sender<Result<(), TransportError>>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Reply to a send command if anyone is waiting for it
pub(crate) fn respond(
    reply: Option<oneshot::Sender<Result<(), TransportError>>>,
    result: Result<(), TransportError>,
) {
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}

/// Cloneable handle to a running session task
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
    notices: broadcast::Sender<SessionNotice>,
    raw: broadcast::Sender<String>,
    balance: watch::Receiver<Option<Amount>>,
    request_timeout: Duration,
}

impl SessionHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<SessionCommand>,
        status: watch::Receiver<SessionStatus>,
        notices: broadcast::Sender<SessionNotice>,
        raw: broadcast::Sender<String>,
        balance: watch::Receiver<Option<Amount>>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            commands,
            status,
            notices,
            raw,
            balance,
            request_timeout,
        }
    }

    /// Latest status snapshot
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Every state transition from now on
    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    /// Last balance reported by the broker
    pub fn balance(&self) -> Option<Amount> {
        *self.balance.borrow()
    }

    pub fn watch_balance(&self) -> watch::Receiver<Option<Amount>> {
        self.balance.clone()
    }

    /// Queue a frame for `generation` without waiting for the write
    ///
    /// The session task drops the frame if the connection has moved on to
    /// another generation by the time it is dequeued.
    pub fn queue(&self, generation: u64, frame: Frame) -> Result<(), TransportError> {
        self.commands
            .send(SessionCommand::Send {
                frame,
                generation,
                reply: None,
            })
            .map_err(|_| TransportError::NotConnected)
    }

    /// Write a frame on the current connection
    pub async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        let generation = {
            let status = self.status.borrow();
            if !status.is_live() {
                return Err(TransportError::NotConnected);
            }
            status.generation
        };

        let (reply, written) = oneshot::channel();
        self.commands
            .send(SessionCommand::Send {
                frame,
                generation,
                reply: Some(reply),
            })
            .map_err(|_| TransportError::NotConnected)?;
        written.await.map_err(|_| TransportError::NotConnected)?
    }

    /// Encode and write an envelope message
    pub async fn send(&self, message: &Outbound) -> Result<(), TransportError> {
        let frame = message
            .encode()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.send_frame(frame).await
    }

    /// Write a raw text frame
    pub async fn send_raw(&self, payload: impl Into<String>) -> Result<(), TransportError> {
        self.send_frame(Frame::Text(payload.into())).await
    }

    /// Write `payload` and wait for the first inbound text frame accepted by `validator`
    pub async fn raw_request(
        &self,
        payload: impl Into<String>,
        validator: &Validator,
        timeout: Option<Duration>,
    ) -> Result<String, TransportError> {
        // subscribe before writing so a fast reply is not missed
        let mut replies = self.raw.subscribe();
        self.send_raw(payload).await?;

        let timeout = timeout.unwrap_or(self.request_timeout);
        let wait = async {
            loop {
                match replies.recv().await {
                    Ok(message) if validator.check(&message) => return Ok(message),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Raw request lagged, {} frames skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(TransportError::ConnectionLost(
                            "session closed while waiting for a reply".to_string(),
                        ));
                    }
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| TransportError::Timeout(format!("no matching reply within {:?}", timeout)))?
    }

    /// Wait until the session reaches `state`; returns false if it closed first
    pub async fn wait_for_state(&self, state: ConnectionState) -> bool {
        let mut status = self.status.clone();
        loop {
            let current = status.borrow_and_update().state;
            if current == state {
                return true;
            }
            if current.is_closed() {
                return false;
            }
            if status.changed().await.is_err() {
                return status.borrow().state == state;
            }
        }
    }

    /// Ask the session task to close the link and stop
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(SessionCommand::Shutdown { reply })
            .is_ok()
        {
            let _ = done.await;
        }
    }
}
