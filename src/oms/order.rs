use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::core::events::{IdempotencyKey, OrderId, OrderRequest, OrderStatus};
use crate::types::Amount;

/// Snapshot of one logical order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderState {
    pub key: IdempotencyKey,
    pub request: OrderRequest,
    pub status: OrderStatus,
    /// Broker-side id, known once acknowledged
    pub order_id: Option<OrderId>,
    /// Number of times the order was written to a transport
    pub sends: u32,
    /// Payout reported with the fill
    pub payout: Option<Amount>,
    /// Why the order ended the way it did
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderState {
    /// Create a new pending order
    pub fn new(request: OrderRequest) -> Self {
        let now = Utc::now();
        Self {
            key: request.key.clone(),
            request,
            status: OrderStatus::Pending,
            order_id: None,
            sends: 0,
            payout: None,
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} [{}]",
            self.key, self.request.direction, self.request.amount, self.request.asset, self.status
        )?;
        if let Some(reason) = &self.reason {
            write!(f, " ({})", reason)?;
        }
        Ok(())
    }
}

/// Order errors
#[derive(Debug, Clone, PartialEq)]
pub enum OrderError {
    /// The order already reached a terminal state
    AlreadyTerminal {
        key: IdempotencyKey,
        status: OrderStatus,
    },
    UnknownOrder(IdempotencyKey),
    InvalidRequest(String),
    /// The session closed; no new work is accepted
    ConnectionLost,
    /// The engine was shut down
    EngineStopped,
}

impl fmt::Display for OrderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderError::AlreadyTerminal { key, status } => {
                write!(f, "Order {} is already {}", key, status)
            }
            OrderError::UnknownOrder(key) => write!(f, "Unknown order: {}", key),
            OrderError::InvalidRequest(msg) => write!(f, "Invalid order request: {}", msg),
            OrderError::ConnectionLost => write!(f, "Connection lost"),
            OrderError::EngineStopped => write!(f, "Order engine stopped"),
        }
    }
}

impl std::error::Error for OrderError {}

/// Handle to an accepted order
#[derive(Debug, Clone)]
pub struct OrderTicket {
    key: IdempotencyKey,
    state: watch::Receiver<OrderState>,
}

impl OrderTicket {
    pub(crate) fn new(key: IdempotencyKey, state: watch::Receiver<OrderState>) -> Self {
        Self { key, state }
    }

    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    /// Latest state
    pub fn state(&self) -> OrderState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> OrderStatus {
        self.state.borrow().status
    }

    /// Receiver notified on every transition
    pub fn watch(&self) -> watch::Receiver<OrderState> {
        self.state.clone()
    }

    /// Wait for the terminal state
    pub async fn wait(&mut self) -> OrderState {
        loop {
            let state = self.state.borrow_and_update().clone();
            if state.is_terminal() {
                return state;
            }
            if self.state.changed().await.is_err() {
                return self.state.borrow().clone();
            }
        }
    }
}

/// Engine-side bookkeeping for one order
#[derive(Debug)]
pub(crate) struct TrackedOrder {
    state: OrderState,
    publisher: watch::Sender<OrderState>,
    created: Instant,
    /// Generation the open frame was last queued on
    pub(crate) sent_generation: Option<u64>,
    pub(crate) cancel_requested: bool,
    /// Generation the cancel frame was last queued on
    pub(crate) cancel_generation: Option<u64>,
    /// Terminal and queued for eviction
    pub(crate) retired: bool,
}

impl TrackedOrder {
    pub(crate) fn new(request: OrderRequest, created: Instant) -> Self {
        let state = OrderState::new(request);
        let (publisher, _) = watch::channel(state.clone());
        Self {
            state,
            publisher,
            created,
            sent_generation: None,
            cancel_requested: false,
            cancel_generation: None,
            retired: false,
        }
    }

    pub(crate) fn state(&self) -> &OrderState {
        &self.state
    }

    pub(crate) fn status(&self) -> OrderStatus {
        self.state.status
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub(crate) fn ticket(&self) -> OrderTicket {
        OrderTicket::new(self.state.key.clone(), self.publisher.subscribe())
    }

    /// When the engine gives up on the order; `None` if it lies beyond what
    /// the clock can represent
    ///
    /// Unacknowledged orders expire with the option itself; acknowledged ones
    /// get `settlement_grace` on top for the broker to report the result.
    pub(crate) fn deadline(&self, settlement_grace: Duration) -> Option<Instant> {
        let expiry = self.created.checked_add(self.state.request.expiry)?;
        if self.state.status == OrderStatus::Acknowledged {
            expiry.checked_add(settlement_grace)
        } else {
            Some(expiry)
        }
    }

    /// Record a transport write without changing the status
    pub(crate) fn record_send(&mut self, generation: u64) -> bool {
        let resent = self.state.sends > 0;
        self.state.sends += 1;
        self.sent_generation = Some(generation);
        resent
    }

    /// Move to `next` if the lifecycle allows it, applying `update` first
    pub(crate) fn transition_with<F>(&mut self, next: OrderStatus, update: F) -> bool
    where
        F: FnOnce(&mut OrderState),
    {
        if !self.state.status.can_transition_to(next) {
            debug!(
                "Ignoring transition of {} from {} to {}",
                self.state.key, self.state.status, next
            );
            return false;
        }
        update(&mut self.state);
        self.state.status = next;
        self.state.updated_at = Utc::now();
        self.publisher.send_replace(self.state.clone());
        true
    }

    pub(crate) fn transition(&mut self, next: OrderStatus) -> bool {
        self.transition_with(next, |_| {})
    }

    /// Move to a terminal status with a reason
    pub(crate) fn finish(&mut self, next: OrderStatus, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.transition_with(next, |state| state.reason = Some(reason))
    }
}
