/// Order execution: submission, tracking and terminal outcomes
pub mod engine;
pub mod order;

pub use engine::{OrderEngine, OrderEngineHandle};
pub use order::{OrderError, OrderState, OrderTicket};
