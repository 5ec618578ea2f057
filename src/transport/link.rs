use async_trait::async_trait;

use super::error::TransportError;
use super::frame::Frame;

/// A single bidirectional, ordered, message-framed connection
///
/// Owned by exactly one session task; never shared.
#[async_trait]
pub trait Link: Send {
    /// Write one frame
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Read the next frame; `None` once the peer has closed the link
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;

    /// Close the link; further sends fail
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens links to the broker
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh link, trying each endpoint in order
    async fn open(&self) -> Result<Box<dyn Link>, TransportError>;

    /// Endpoint label used in logs
    fn describe(&self) -> String {
        "broker".to_string()
    }
}
