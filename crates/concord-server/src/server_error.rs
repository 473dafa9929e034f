//! Driver error types.
//!
//! Provides strongly-typed errors for driver operations:
//! - Connection admission (authentication, connection limit)
//! - Synchronization (proposals, rooms, storage)
//! - Bus setup for clustered nodes

use std::fmt;

use concord_core::SyncError;
use concord_proto::{ErrorPayload, ProtocolError};

use crate::bus::BusError;

/// Errors that can occur during driver operations.
#[derive(Debug)]
pub enum DriverError {
    /// Synchronization layer rejected the operation.
    ///
    /// Wraps `SyncError`. See `SyncError::is_retryable` and
    /// `SyncError::is_degraded` for how callers should react.
    Sync(SyncError),

    /// Frame encoding/decoding error.
    ///
    /// Invalid frame format received from client or failed to encode response.
    /// Fatal for that frame/connection - indicates protocol violation or bug.
    Protocol(String),

    /// Bus subscription or publish setup failed.
    ///
    /// Only surfaces while starting a clustered node; publish failures at
    /// runtime are absorbed by the propagator.
    Bus(BusError),

    /// The node is at its connection limit.
    ///
    /// Transient - the client should try another node or back off.
    ConnectionLimit(usize),

    /// The driver is shutting down and accepts no new work.
    ShuttingDown,
}

impl DriverError {
    /// Client-facing error payload.
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            Self::Sync(err) => err.to_payload(),
            Self::Protocol(msg) => ErrorPayload::invalid_payload(msg.clone()),
            Self::ConnectionLimit(_) => {
                ErrorPayload::new(ErrorPayload::CONNECTION_LIMIT, self.to_string())
            },
            Self::Bus(_) | Self::ShuttingDown => {
                ErrorPayload::new(ErrorPayload::INTERNAL, self.to_string())
            },
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(err) => write!(f, "{err}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Bus(err) => write!(f, "bus error: {err}"),
            Self::ConnectionLimit(max) => write!(f, "connection limit reached ({max})"),
            Self::ShuttingDown => write!(f, "server shutting down"),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sync(err) => Some(err),
            Self::Bus(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SyncError> for DriverError {
    fn from(err: SyncError) -> Self {
        Self::Sync(err)
    }
}

impl From<BusError> for DriverError {
    fn from(err: BusError) -> Self {
        Self::Bus(err)
    }
}

impl From<ProtocolError> for DriverError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}
