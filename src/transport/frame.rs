use crate::core::events::{Direction, IdempotencyKey, OrderRequest, Timestamp, TradeSignal};
use crate::types::{Amount, Asset, Price};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unit of data carried by a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl Frame {
    pub fn text(payload: impl Into<String>) -> Self {
        Frame::Text(payload.into())
    }

    /// Text content of a data frame; binary frames are read as UTF-8
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(text) => Some(text),
            Frame::Binary(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }
}

/// Messages the engine writes to the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Auth {
        session: String,
        demo: bool,
    },
    Ping {
        seq: u64,
    },
    OpenOrder {
        key: IdempotencyKey,
        asset: Asset,
        direction: Direction,
        amount: Amount,
        expiry_secs: u64,
    },
    CancelOrder {
        key: IdempotencyKey,
    },
}

impl Outbound {
    pub fn open_order(request: &OrderRequest) -> Self {
        Outbound::OpenOrder {
            key: request.key.clone(),
            asset: request.asset.clone(),
            direction: request.direction,
            amount: request.amount,
            expiry_secs: request.expiry.as_secs().max(1),
        }
    }

    pub fn encode(&self) -> Result<Frame, FrameError> {
        serde_json::to_string(self)
            .map(Frame::Text)
            .map_err(|e| FrameError::Malformed(e.to_string()))
    }
}

/// Messages the broker writes to the engine
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    AuthOk,
    AuthFailed {
        #[serde(default)]
        reason: String,
    },
    Pong {
        #[serde(default)]
        seq: u64,
    },
    Price {
        asset: Asset,
        price: Price,
        #[serde(default)]
        timestamp: Option<Timestamp>,
    },
    Signal(TradeSignal),
    OrderAck {
        key: IdempotencyKey,
        #[serde(default)]
        order_id: Option<String>,
    },
    OrderFilled {
        key: IdempotencyKey,
        #[serde(default)]
        payout: Option<Amount>,
    },
    OrderRejected {
        key: IdempotencyKey,
        #[serde(default)]
        reason: String,
    },
    OrderCancelled {
        key: IdempotencyKey,
    },
    Balance {
        balance: Amount,
    },
    /// Any tag not listed above
    #[serde(other)]
    Unknown,
}

/// Minimal view used to recover the tag of an unknown frame
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    asset: Option<Asset>,
}

/// Decoded inbound frame plus the raw document for unknown tags
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub message: Inbound,
    /// Tag and asset of an `Unknown` frame
    pub unknown: Option<(String, Option<Asset>, serde_json::Value)>,
}

impl Inbound {
    /// Decode a text frame
    pub fn decode(text: &str) -> Result<Decoded, FrameError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;
        if !value.is_object() {
            return Err(FrameError::Malformed("frame is not a JSON object".to_string()));
        }

        let message = Inbound::deserialize(&value)
            .map_err(|e| FrameError::Malformed(e.to_string()))?;

        let unknown = if message == Inbound::Unknown {
            let envelope =
                Envelope::deserialize(&value).map_err(|e| FrameError::Malformed(e.to_string()))?;
            Some((envelope.kind, envelope.asset, value))
        } else {
            None
        };

        Ok(Decoded { message, unknown })
    }

    /// Order lifecycle updates are routed to the order engine
    pub fn is_order_update(&self) -> bool {
        matches!(
            self,
            Inbound::OrderAck { .. }
                | Inbound::OrderFilled { .. }
                | Inbound::OrderRejected { .. }
                | Inbound::OrderCancelled { .. }
        )
    }

    /// Market data goes to the signal pipeline
    pub fn is_market_data(&self) -> bool {
        matches!(
            self,
            Inbound::Price { .. } | Inbound::Signal(_) | Inbound::Unknown
        )
    }
}

/// Frame decoding errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    Malformed(String),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Malformed(msg) => write!(f, "Malformed frame: {}", msg),
        }
    }
}

impl std::error::Error for FrameError {}
