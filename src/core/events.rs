use crate::types::{Amount, Asset, Price};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Timestamp in milliseconds since the Unix epoch
pub type Timestamp = u64;

/// Broker-side order identifier, known once the order is acknowledged
pub type OrderId = String;

/// Current wall-clock time in milliseconds
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}

/// Direction of a binary option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Price expected to finish above the strike
    Call,
    /// Price expected to finish below the strike
    Put,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Call => write!(f, "call"),
            Direction::Put => write!(f, "put"),
        }
    }
}

/// Caller-assigned idempotency key of a logical order
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Generate a fresh random key
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IdempotencyKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for IdempotencyKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Longest option expiry an order may request
pub const MAX_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A caller-issued intent to trade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub key: IdempotencyKey,
    pub asset: Asset,
    pub direction: Direction,
    pub amount: Amount,
    /// Duration of the option; also bounds how long the order may wait for an acknowledgement
    pub expiry: Duration,
}

impl OrderRequest {
    /// Create a new call (buy) order
    pub fn call(
        key: impl Into<IdempotencyKey>,
        asset: impl Into<Asset>,
        amount: Amount,
        expiry: Duration,
    ) -> Self {
        Self {
            key: key.into(),
            asset: asset.into(),
            direction: Direction::Call,
            amount,
            expiry,
        }
    }

    /// Create a new put (sell) order
    pub fn put(
        key: impl Into<IdempotencyKey>,
        asset: impl Into<Asset>,
        amount: Amount,
        expiry: Duration,
    ) -> Self {
        Self {
            key: key.into(),
            asset: asset.into(),
            direction: Direction::Put,
            amount,
            expiry,
        }
    }

    /// Check the request before it is accepted by the engine
    pub fn validate(&self) -> Result<(), String> {
        if self.key.as_str().is_empty() {
            return Err("idempotency key must not be empty".to_string());
        }
        if !self.asset.is_valid() {
            return Err(format!("invalid asset '{}'", self.asset));
        }
        if !self.amount.is_valid_stake() {
            return Err(format!("stake must be positive, got {}", self.amount));
        }
        if self.expiry.is_zero() {
            return Err("expiry must be greater than zero".to_string());
        }
        if self.expiry > MAX_EXPIRY {
            return Err(format!(
                "expiry {:?} exceeds the maximum of {:?}",
                self.expiry, MAX_EXPIRY
            ));
        }
        Ok(())
    }
}

/// Lifecycle status of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Accepted by the engine, not on the wire for the current connection
    Pending,
    /// Written to the transport, no acknowledgement yet
    Submitted,
    /// Broker accepted the order
    Acknowledged,
    Filled,
    Rejected,
    Cancelled,
    Expired,
    Failed,
}

impl OrderStatus {
    /// Terminal statuses never transition further
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Rejected
                | OrderStatus::Cancelled
                | OrderStatus::Expired
                | OrderStatus::Failed
        )
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Pending, Submitted) => true,
            // the connection carrying the order was lost
            (Submitted, Pending) => true,
            // a late ack for a resend-pending order still counts
            (Pending | Submitted, Acknowledged) => true,
            (Acknowledged, Filled) => true,
            (_, Rejected | Cancelled | Expired | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Quote update for an asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTick {
    pub price: Price,
}

/// Externally generated trading signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub asset: Asset,
    pub direction: Direction,
    /// Confidence in [0, 1] when the producer supplies one
    #[serde(default)]
    pub strength: Option<f64>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

impl TradeSignal {
    pub fn new(asset: impl Into<Asset>, direction: Direction) -> Self {
        Self {
            asset: asset.into(),
            direction,
            strength: None,
            source: None,
            timestamp: None,
        }
    }

    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = Some(strength);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Normalized payload of a market event
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Price(PriceTick),
    Signal(TradeSignal),
    /// Frame with a tag the engine does not understand
    Unknown {
        kind: String,
        raw: serde_json::Value,
    },
}

/// Normalized tick, quote or signal notification
#[derive(Debug, Clone, PartialEq)]
pub struct MarketEvent {
    /// Arrival order assigned by the signal pipeline
    pub sequence: u64,
    pub asset: Option<Asset>,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl MarketEvent {
    pub fn is_price(&self) -> bool {
        matches!(self.payload, EventPayload::Price(_))
    }

    pub fn is_signal(&self) -> bool {
        matches!(self.payload, EventPayload::Signal(_))
    }

    /// Quote carried by a price event
    pub fn price(&self) -> Option<Price> {
        match &self.payload {
            EventPayload::Price(tick) => Some(tick.price),
            _ => None,
        }
    }
}
