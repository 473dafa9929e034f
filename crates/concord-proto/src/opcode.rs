//! Operation codes carried in the frame header.

/// Identifies the payload type of a frame.
///
/// Client-originated opcodes live in `0x00xx`, room and state operations in
/// `0x01xx`, server-originated envelopes in `0x02xx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Client handshake carrying a credential.
    Hello = 0x0001,
    /// Server handshake confirmation.
    HelloReply = 0x0002,
    /// Graceful disconnect.
    Goodbye = 0x0003,
    /// Keepalive ping.
    Ping = 0x0004,
    /// Keepalive answer.
    Pong = 0x0005,

    /// Join a room.
    JoinRoom = 0x0101,
    /// Leave a room.
    LeaveRoom = 0x0102,
    /// Explicitly create a room.
    CreateRoom = 0x0103,
    /// Propose a state transition.
    Propose = 0x0104,
    /// Read the authoritative state of a session.
    FetchState = 0x0105,
    /// Publish an application event to a room.
    Publish = 0x0106,

    /// Join acknowledgement.
    Joined = 0x0201,
    /// Single event delivery.
    Deliver = 0x0202,
    /// Coalesced batch of non-critical events.
    Batch = 0x0203,
    /// Authoritative state transition.
    StateChanged = 0x0204,
    /// Outcome of a proposal.
    ProposalResult = 0x0205,
    /// Missed transitions after reconnection.
    CatchUp = 0x0206,
    /// Reconnection finished restoring context.
    ContinuityRestored = 0x0207,
    /// An ephemeral room was deleted.
    RoomClosed = 0x0208,
    /// Identity went online or offline.
    Presence = 0x0209,

    /// Error response.
    Error = 0x02FF,
}

impl Opcode {
    /// Raw wire value.
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    /// Parse a raw wire value. `None` for unknown opcodes.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        let opcode = match value {
            0x0001 => Self::Hello,
            0x0002 => Self::HelloReply,
            0x0003 => Self::Goodbye,
            0x0004 => Self::Ping,
            0x0005 => Self::Pong,
            0x0101 => Self::JoinRoom,
            0x0102 => Self::LeaveRoom,
            0x0103 => Self::CreateRoom,
            0x0104 => Self::Propose,
            0x0105 => Self::FetchState,
            0x0106 => Self::Publish,
            0x0201 => Self::Joined,
            0x0202 => Self::Deliver,
            0x0203 => Self::Batch,
            0x0204 => Self::StateChanged,
            0x0205 => Self::ProposalResult,
            0x0206 => Self::CatchUp,
            0x0207 => Self::ContinuityRestored,
            0x0208 => Self::RoomClosed,
            0x0209 => Self::Presence,
            0x02FF => Self::Error,
            _ => return None,
        };
        Some(opcode)
    }

    /// Whether a client is allowed to send this opcode.
    #[must_use]
    pub const fn is_client_originated(self) -> bool {
        (self as u16) < 0x0200 && !matches!(self, Self::HelloReply)
    }
}
