//! CBOR-encoded protocol messages.
//!
//! Frame headers are raw binary; payloads use CBOR for type safety and
//! forward compatibility. The payload type is determined by the header's
//! opcode, so only the inner struct is serialized (no variant tag).
//!
//! # Invariants
//!
//! Each payload variant maps to exactly one opcode (enforced by match
//! exhaustiveness).

pub mod room;
pub mod session;
pub mod state;

use bytes::BufMut;
pub use room::Event;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    Frame, FrameFlags, FrameHeader, Opcode,
    errors::{ProtocolError, Result},
};

/// All possible frame payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    // Connection lifecycle
    /// Initial handshake
    Hello(session::Hello),
    /// Server response to Hello
    HelloReply(session::HelloReply),
    /// Graceful disconnect
    Goodbye(session::Goodbye),
    /// Keepalive ping
    Ping,
    /// Keepalive answer
    Pong,

    // Client requests
    /// Join a room
    JoinRoom(room::JoinRoom),
    /// Leave a room
    LeaveRoom(room::LeaveRoom),
    /// Create a room explicitly
    CreateRoom(room::CreateRoom),
    /// Propose a state transition
    Propose(state::Propose),
    /// Read session state
    FetchState(state::FetchState),
    /// Publish an event to a room
    Publish(room::Publish),

    // Server envelopes
    /// Join acknowledgement
    Joined(room::Joined),
    /// Single event
    Deliver(room::Deliver),
    /// Coalesced non-critical events
    Batch(room::Batch),
    /// Authoritative state transition
    StateChanged(state::StateSnapshot),
    /// Proposal outcome
    ProposalResult(state::ProposalResult),
    /// Missed transitions after reconnect
    CatchUp(state::CatchUp),
    /// Reconnection finished
    ContinuityRestored(state::ContinuityRestored),
    /// Ephemeral room deleted
    RoomClosed(room::RoomClosed),
    /// Presence transition
    Presence(room::Presence),

    /// Error response
    Error(ErrorPayload),
}

/// Error payload for error frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code identifying the type of error.
    pub code: u16,
    /// Human-readable error message.
    pub message: String,
    /// Optional retry-after hint in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub retry_after_ms: Option<u64>,
}

impl ErrorPayload {
    /// Credential missing or rejected.
    pub const UNAUTHENTICATED: u16 = 0x0001;
    /// Room does not exist.
    pub const ROOM_NOT_FOUND: u16 = 0x0002;
    /// Proposal based on an outdated version.
    pub const STALE_PROPOSAL: u16 = 0x0003;
    /// Session critical section contended.
    pub const BUSY: u16 = 0x0004;
    /// External dependency failing; degraded service.
    pub const DEPENDENCY_UNAVAILABLE: u16 = 0x0005;
    /// Payload malformed or not allowed from a client.
    pub const INVALID_PAYLOAD: u16 = 0x0006;
    /// Session has no state.
    pub const SESSION_NOT_FOUND: u16 = 0x0007;
    /// Node refuses further connections.
    pub const CONNECTION_LIMIT: u16 = 0x0008;
    /// Unexpected server failure.
    pub const INTERNAL: u16 = 0x00FF;

    /// Create an error payload.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), retry_after_ms: None }
    }

    /// Create an invalid payload error.
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PAYLOAD, msg)
    }

    /// Attach a retry hint.
    #[must_use]
    pub fn with_retry_after_ms(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }
}

fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}

impl Payload {
    /// Opcode corresponding to this payload type.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Hello(_) => Opcode::Hello,
            Self::HelloReply(_) => Opcode::HelloReply,
            Self::Goodbye(_) => Opcode::Goodbye,
            Self::Ping => Opcode::Ping,
            Self::Pong => Opcode::Pong,
            Self::JoinRoom(_) => Opcode::JoinRoom,
            Self::LeaveRoom(_) => Opcode::LeaveRoom,
            Self::CreateRoom(_) => Opcode::CreateRoom,
            Self::Propose(_) => Opcode::Propose,
            Self::FetchState(_) => Opcode::FetchState,
            Self::Publish(_) => Opcode::Publish,
            Self::Joined(_) => Opcode::Joined,
            Self::Deliver(_) => Opcode::Deliver,
            Self::Batch(_) => Opcode::Batch,
            Self::StateChanged(_) => Opcode::StateChanged,
            Self::ProposalResult(_) => Opcode::ProposalResult,
            Self::CatchUp(_) => Opcode::CatchUp,
            Self::ContinuityRestored(_) => Opcode::ContinuityRestored,
            Self::RoomClosed(_) => Opcode::RoomClosed,
            Self::Presence(_) => Opcode::Presence,
            Self::Error(_) => Opcode::Error,
        }
    }

    /// Header flags describing how the server classified this envelope.
    #[must_use]
    pub fn flags(&self) -> FrameFlags {
        match self {
            Self::StateChanged(_) | Self::RoomClosed(_) | Self::Presence(_) => {
                FrameFlags::CRITICAL
            },
            Self::Deliver(deliver) if deliver.event.critical => FrameFlags::CRITICAL,
            Self::Batch(_) => FrameFlags::BATCHED,
            _ => FrameFlags::empty(),
        }
    }

    /// Encode payload to buffer.
    ///
    /// Serializes only the inner struct, NOT the variant tag. Size limits are
    /// enforced later by [`Frame::encode`].
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut writer = dst.writer();

        match self {
            Self::Hello(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::HelloReply(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Goodbye(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Ping | Self::Pong => Ok(()), // Zero-byte payloads
            Self::JoinRoom(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::LeaveRoom(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::CreateRoom(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Propose(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::FetchState(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Publish(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Joined(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Deliver(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Batch(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::StateChanged(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ProposalResult(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::CatchUp(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ContinuityRestored(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::RoomClosed(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Presence(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Error(inner) => ciborium::ser::into_writer(inner, &mut writer),
        }
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))
    }

    /// Decode payload from bytes based on opcode
    ///
    /// The size check runs before CBOR parsing so the parser never sees an
    /// oversized input.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if bytes exceed `MAX_PAYLOAD_SIZE`
    /// - `ProtocolError::CborDecode` if CBOR deserialization fails
    pub fn decode(opcode: Opcode, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        let payload = match opcode {
            Opcode::Hello => Self::Hello(decode_cbor(bytes)?),
            Opcode::HelloReply => Self::HelloReply(decode_cbor(bytes)?),
            Opcode::Goodbye => Self::Goodbye(decode_cbor(bytes)?),
            Opcode::Ping => Self::Ping,
            Opcode::Pong => Self::Pong,
            Opcode::JoinRoom => Self::JoinRoom(decode_cbor(bytes)?),
            Opcode::LeaveRoom => Self::LeaveRoom(decode_cbor(bytes)?),
            Opcode::CreateRoom => Self::CreateRoom(decode_cbor(bytes)?),
            Opcode::Propose => Self::Propose(decode_cbor(bytes)?),
            Opcode::FetchState => Self::FetchState(decode_cbor(bytes)?),
            Opcode::Publish => Self::Publish(decode_cbor(bytes)?),
            Opcode::Joined => Self::Joined(decode_cbor(bytes)?),
            Opcode::Deliver => Self::Deliver(decode_cbor(bytes)?),
            Opcode::Batch => Self::Batch(decode_cbor(bytes)?),
            Opcode::StateChanged => Self::StateChanged(decode_cbor(bytes)?),
            Opcode::ProposalResult => Self::ProposalResult(decode_cbor(bytes)?),
            Opcode::CatchUp => Self::CatchUp(decode_cbor(bytes)?),
            Opcode::ContinuityRestored => Self::ContinuityRestored(decode_cbor(bytes)?),
            Opcode::RoomClosed => Self::RoomClosed(decode_cbor(bytes)?),
            Opcode::Presence => Self::Presence(decode_cbor(bytes)?),
            Opcode::Error => Self::Error(decode_cbor(bytes)?),
        };

        Ok(payload)
    }

    /// Convert payload into a transport frame
    ///
    /// Encodes the payload, sets opcode and flags in the header, and creates a
    /// Frame with automatic `payload_size` calculation.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn into_frame(self, mut header: FrameHeader) -> Result<Frame> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        header.opcode = self.opcode().to_u16().to_be_bytes();
        header.set_flags(header.flags().with(self.flags()));
        Ok(Frame::new(header, buf))
    }

    /// Convert payload into a frame with a fresh header.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn to_frame(&self) -> Result<Frame> {
        self.clone().into_frame(FrameHeader::new(self.opcode()))
    }

    /// Parse payload from a raw transport frame
    ///
    /// # Errors
    ///
    /// - `ProtocolError::UnknownOpcode` if the header opcode is unrecognized
    /// - `ProtocolError::CborDecode` if CBOR deserialization fails
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let opcode = frame
            .header
            .opcode_enum()
            .ok_or_else(|| ProtocolError::UnknownOpcode(frame.header.opcode()))?;

        Self::decode(opcode, &frame.payload)
    }

    /// Whether a client may send this payload.
    #[must_use]
    pub const fn is_client_originated(&self) -> bool {
        self.opcode().is_client_originated()
    }
}
