use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::error::TransportError;
use super::frame::Frame;
use super::link::{Connector, Link};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket link backed by tokio-tungstenite
pub struct WebSocketLink {
    url: String,
    stream: WsStream,
    closed: bool,
}

impl WebSocketLink {
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Link for WebSocketLink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::NotConnected);
        }
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
            Frame::Ping(bytes) => Message::Ping(bytes),
            Frame::Pong(bytes) => Message::Pong(bytes),
            Frame::Close => Message::Close(None),
        };
        self.stream.send(message).await.map_err(TransportError::from)
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(e.into())),
            };
            let frame = match message {
                Message::Text(text) => Frame::Text(text),
                Message::Binary(bytes) => Frame::Binary(bytes),
                Message::Ping(bytes) => Frame::Ping(bytes),
                Message::Pong(bytes) => Frame::Pong(bytes),
                Message::Close(reason) => {
                    debug!("Peer closed {}: {:?}", self.url, reason);
                    self.closed = true;
                    return None;
                }
                // raw frames are never surfaced by the reader
                Message::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Connects to the first reachable endpoint of a list
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    urls: Vec<String>,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Create a new connector
    pub fn new(urls: Vec<String>, connect_timeout: Duration) -> Self {
        Self {
            urls,
            connect_timeout,
        }
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    async fn open_url(&self, url: &str) -> Result<WebSocketLink, TransportError> {
        let (stream, response) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::Timeout(format!("connecting to {}", url)))??;
        debug!("Handshake with {} returned {}", url, response.status());
        Ok(WebSocketLink {
            url: url.to_string(),
            stream,
            closed: false,
        })
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self) -> Result<Box<dyn Link>, TransportError> {
        if self.urls.is_empty() {
            return Err(TransportError::Network(
                "no endpoints configured".to_string(),
            ));
        }

        let mut last_error = None;
        for url in &self.urls {
            match self.open_url(url).await {
                Ok(link) => {
                    info!("Connected to {}", url);
                    return Ok(Box::new(link));
                }
                Err(e) => {
                    warn!("Failed to connect to {}: {}", url, e);
                    // the broker answered; another endpoint would answer the same
                    if matches!(e, TransportError::Auth(_)) {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| TransportError::Network("no endpoints configured".to_string())))
    }

    fn describe(&self) -> String {
        self.urls.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::accept_async;

    /// One-connection server that echoes data, answers pings and closes on "bye"
    async fn echo_server() -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Text(text) if text == "bye" => {
                        let _ = ws.close(None).await;
                    }
                    Message::Text(_) | Message::Binary(_) => {
                        let _ = ws.send(message).await;
                    }
                    Message::Ping(data) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    _ => {}
                }
            }
        });
        (format!("ws://{}", addr), task)
    }

    async fn connect(url: &str) -> Box<dyn Link> {
        WebSocketConnector::new(vec![url.to_string()], Duration::from_secs(2))
            .open()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_link_round_trip_and_peer_close() {
        let (url, server) = echo_server().await;
        let mut link = connect(&url).await;

        link.send(Frame::text(r#"{"type":"ping"}"#)).await.unwrap();
        let echoed = link.recv().await.unwrap().unwrap();
        assert_eq!(echoed, Frame::text(r#"{"type":"ping"}"#));

        link.send(Frame::Ping(b"hb".to_vec())).await.unwrap();
        let pong = link.recv().await.unwrap().unwrap();
        assert_eq!(pong, Frame::Pong(b"hb".to_vec()));

        link.send(Frame::text("bye")).await.unwrap();
        // the library may answer the ping a second time
        loop {
            match link.recv().await {
                Some(Ok(Frame::Pong(_))) => continue,
                other => {
                    assert!(other.is_none(), "expected close, got {:?}", other);
                    break;
                }
            }
        }

        assert!(link.close().await.is_ok());
        assert!(link.close().await.is_ok());
        assert!(matches!(
            link.send(Frame::text("late")).await,
            Err(TransportError::NotConnected)
        ));
        drop(link);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_local_close_is_idempotent() {
        let (url, server) = echo_server().await;
        let mut link = connect(&url).await;

        link.send(Frame::Binary(vec![1, 2, 3])).await.unwrap();
        assert_eq!(link.recv().await.unwrap().unwrap(), Frame::Binary(vec![1, 2, 3]));

        assert!(link.close().await.is_ok());
        assert!(link.close().await.is_ok());
        assert!(matches!(
            link.send(Frame::text("late")).await,
            Err(TransportError::NotConnected)
        ));
        drop(link);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connector_without_urls_fails() {
        let connector = WebSocketConnector::new(Vec::new(), Duration::from_secs(1));
        let result = connector.open().await;
        assert!(matches!(result, Err(TransportError::Network(_))));
    }

    #[tokio::test]
    async fn test_connector_reports_last_failure() {
        // nothing listens on port 9 of the loopback interface
        let connector = WebSocketConnector::new(
            vec!["ws://127.0.0.1:9/a".to_string(), "ws://127.0.0.1:9/b".to_string()],
            Duration::from_secs(2),
        );
        let result = connector.open().await;
        assert!(result.is_err());
        assert_eq!(connector.describe(), "ws://127.0.0.1:9/a, ws://127.0.0.1:9/b");
    }
}
