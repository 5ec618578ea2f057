/// Broker link abstraction, wire envelope and link implementations
pub mod error;
pub mod frame;
pub mod link;
pub mod mock;
pub mod validator;
pub mod websocket;

pub use error::TransportError;
pub use frame::{Decoded, Frame, FrameError, Inbound, Outbound};
pub use link::{Connector, Link};
pub use mock::{MockBroker, MockConnector};
pub use validator::Validator;
pub use websocket::{WebSocketConnector, WebSocketLink};
