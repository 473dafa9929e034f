//! Connection lifecycle payloads.

use serde::{Deserialize, Serialize};

use crate::{ConnectionId, IdentityId};

/// Client handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version the client speaks.
    pub version: u8,
    /// Opaque credential checked by the authorization collaborator.
    pub credential: String,
}

/// Server handshake confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    /// Identifier assigned to this connection.
    pub connection_id: ConnectionId,
    /// Identity the credential resolved to.
    pub identity: IdentityId,
    /// Whether a continuity snapshot is about to be restored.
    pub resuming: bool,
}

/// Graceful disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goodbye {
    /// Free-form reason, logged by the receiver.
    pub reason: String,
}
