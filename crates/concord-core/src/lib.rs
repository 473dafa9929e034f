//! Runtime-free synchronization logic for Concord.
//!
//! Everything in this crate is deterministic given its inputs: time and
//! randomness come from an [`Environment`], locks and I/O live in
//! `concord-server`.

pub mod breaker;
pub mod connection;
pub mod env;
pub mod error;
pub mod state;

pub use breaker::{Admission, BreakerConfig, BreakerState, CircuitBreaker, CircuitOpen};
pub use connection::{Connection, ConnectionConfig, ConnectionState};
pub use env::Environment;
pub use error::SyncError;
pub use state::{ABSENT_VERSION, Proposal, SessionRules, StateRecord, StrictRules};
