//! Protocol-level errors.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while parsing or producing frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer is shorter than a frame header.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Minimum number of bytes required.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// Header claims more payload bytes than were received.
    #[error("frame truncated: header claims {expected} payload bytes, got {actual}")]
    FrameTruncated {
        /// Payload size claimed by the header.
        expected: usize,
        /// Payload bytes actually available.
        actual: usize,
    },

    /// Magic number does not match `CNCD`.
    #[error("invalid magic number")]
    InvalidMagic,

    /// Peer speaks a protocol version we do not.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Payload exceeds [`crate::FrameHeader::MAX_PAYLOAD_SIZE`].
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Size of the offending payload.
        size: usize,
        /// Maximum permitted size.
        max: usize,
    },

    /// Opcode is not part of this protocol version.
    #[error("unknown opcode: {0:#06x}")]
    UnknownOpcode(u16),

    /// Payload could not be serialized.
    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    /// Payload could not be deserialized.
    #[error("CBOR decode error: {0}")]
    CborDecode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        insta::assert_snapshot!(
            ProtocolError::UnknownOpcode(0x42).to_string(),
            @"unknown opcode: 0x0042"
        );
        insta::assert_snapshot!(
            ProtocolError::PayloadTooLarge { size: 10, max: 4 }.to_string(),
            @"payload too large: 10 bytes (max 4)"
        );
    }
}
