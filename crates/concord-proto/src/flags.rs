//! Frame flag bitfield.

/// Per-frame processing hints.
///
/// Flags never change how a payload is decoded; they tell the receiver how
/// the server classified the envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Envelope bypassed batching (state transitions, game endings).
    pub const CRITICAL: Self = Self(0b0000_0001);

    /// Envelope is a coalesced batch of non-critical events.
    pub const BATCHED: Self = Self(0b0000_0010);

    /// No flags set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Reconstruct flags from the raw header byte. Unknown bits are kept.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Raw header byte.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        self.0
    }

    /// Whether every bit in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Flags with the bits of `other` added.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_and_query() {
        let flags = FrameFlags::empty().with(FrameFlags::CRITICAL);
        assert!(flags.contains(FrameFlags::CRITICAL));
        assert!(!flags.contains(FrameFlags::BATCHED));
        assert_eq!(FrameFlags::from_byte(flags.to_byte()), flags);
    }
}
