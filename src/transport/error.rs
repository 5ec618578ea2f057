use std::fmt;

/// Transport-level error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Broker refused the credentials; never retried
    Auth(String),
    /// Link could not be opened or failed while in use
    Network(String),
    /// The session is not live
    NotConnected,
    /// Reconnection attempts exhausted or the session was closed
    ConnectionLost(String),
    /// An operation did not complete in time
    Timeout(String),
    /// Peer violated the handshake or envelope format
    Protocol(String),
}

impl TransportError {
    /// Errors the coordinator absorbs and retries with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Network(_) | TransportError::Timeout(_) | TransportError::Protocol(_)
        )
    }

    /// Errors that end the session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Auth(_) | TransportError::ConnectionLost(_)
        )
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            TransportError::Network(msg) => write!(f, "Network error: {}", msg),
            TransportError::NotConnected => write!(f, "Not connected"),
            TransportError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            TransportError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            TransportError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match error {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                TransportError::Network("connection closed".to_string())
            }
            WsError::Http(response) if response.status().as_u16() == 401 => {
                TransportError::Auth(format!("handshake rejected: {}", response.status()))
            }
            other => TransportError::Network(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(TransportError::Network("reset".to_string()).is_retryable());
        assert!(TransportError::Timeout("auth".to_string()).is_retryable());
        assert!(!TransportError::Auth("bad ssid".to_string()).is_retryable());
        assert!(TransportError::Auth("bad ssid".to_string()).is_fatal());
        assert!(TransportError::ConnectionLost("gone".to_string()).is_fatal());
        assert!(!TransportError::NotConnected.is_fatal());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            TransportError::Auth("bad ssid".to_string()).to_string(),
            "Authentication error: bad ssid"
        );
        assert_eq!(TransportError::NotConnected.to_string(), "Not connected");
    }

    #[test]
    fn test_from_tungstenite_error() {
        let error: TransportError = tokio_tungstenite::tungstenite::Error::ConnectionClosed.into();
        assert!(matches!(error, TransportError::Network(_)));
    }
}
