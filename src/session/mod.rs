/// Session lifecycle: authentication, heartbeats and reconnection
pub mod backoff;
pub mod coordinator;
pub mod handle;
pub mod state;

pub use backoff::Backoff;
pub use coordinator::{SessionCoordinator, SessionRoutes};
pub use handle::SessionHandle;
pub use state::{ConnectionState, SessionNotice, SessionStatus};
