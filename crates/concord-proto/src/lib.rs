//! Concord wire protocol.
//!
//! Every message on the wire is a [`Frame`]: a fixed 16-byte big-endian
//! [`FrameHeader`] followed by a CBOR-encoded payload. The header carries the
//! [`Opcode`] that identifies the payload type, so routing never has to look
//! inside the payload.
//!
//! The crate also owns the identifier newtypes shared by every layer
//! ([`ConnectionId`], [`IdentityId`], [`RoomId`], [`SessionId`], [`NodeId`])
//! and the room taxonomy ([`RoomKind`], [`Persistence`]).

mod errors;
mod flags;
mod frame;
mod header;
mod ids;
mod opcode;
pub mod payloads;

pub use errors::{ProtocolError, Result};
pub use flags::FrameFlags;
pub use frame::Frame;
pub use header::FrameHeader;
pub use ids::{ConnectionId, IdentityId, NodeId, Persistence, Role, RoomId, RoomKind, SessionId};
pub use opcode::Opcode;
pub use payloads::{ErrorPayload, Event, Payload};

/// ALPN identifier negotiated on QUIC connections.
pub const ALPN_PROTOCOL: &[u8] = b"concord/1";
