//! Connection lifecycle: client retry policy and server session states.

pub mod reconnect;
pub mod state;

pub use reconnect::{connect_with_retry, ExponentialBackoff, RetryPolicy};
pub use state::{SessionMachine, SessionState};
