use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

use crate::transport::TransportError;

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Initial connect and authentication in progress
    Connecting,
    /// Authenticated and heartbeating
    Live,
    /// Link lost or heartbeats missed; reconnecting
    Degraded,
    /// Terminal; the session never reconnects again
    Closed,
}

impl ConnectionState {
    pub fn is_live(&self) -> bool {
        *self == ConnectionState::Live
    }

    pub fn is_closed(&self) -> bool {
        *self == ConnectionState::Closed
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Connecting, Live)
                | (Connecting, Closed)
                | (Live, Degraded)
                | (Live, Closed)
                | (Degraded, Live)
                | (Degraded, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Live => write!(f, "live"),
            ConnectionState::Degraded => write!(f, "degraded"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Latest snapshot of a session, published on a `watch` channel
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub session_id: Uuid,
    /// Masked credentials, safe to log
    pub account: String,
    pub state: ConnectionState,
    /// Incremented on every successful (re)connect; zero before the first one
    pub generation: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Reconnect attempt in progress, zero while live
    pub reconnect_attempt: u32,
    pub last_error: Option<TransportError>,
}

impl SessionStatus {
    /// Create a new status in the `Connecting` state
    pub fn new(session_id: Uuid, account: impl Into<String>) -> Self {
        Self {
            session_id,
            account: account.into(),
            state: ConnectionState::Connecting,
            generation: 0,
            last_heartbeat: None,
            reconnect_attempt: 0,
            last_error: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

/// One state transition, published on a `broadcast` channel
#[derive(Debug, Clone, PartialEq)]
pub struct SessionNotice {
    pub session_id: Uuid,
    pub previous: ConnectionState,
    pub state: ConnectionState,
    pub generation: u64,
    pub error: Option<TransportError>,
    pub at: DateTime<Utc>,
}

impl fmt::Display for SessionNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session {} {} -> {} (generation {})",
            self.session_id, self.previous, self.state, self.generation
        )?;
        if let Some(error) = &self.error {
            write!(f, ": {}", error)?;
        }
        Ok(())
    }
}
