//! Fuzz target for frame header boundary conditions
//!
//! Prevent DoS attacks via malformed frame headers.
//!
//! # Strategy
//!
//! - Magic bytes: Valid, off-by-one, all-zeros, all-ones, random
//! - Payload size: Zero, small, at-max, just-over-max, way-over-max, u32::MAX
//! - Version: Valid (0x01), zero, max, random
//! - Flags and request id: arbitrary bits
//!
//! # Invariants
//!
//! - `payload_size > MAX_PAYLOAD_SIZE` (4 MiB) MUST return
//!   `ProtocolError::PayloadTooLarge`
//! - Invalid magic bytes MUST return `ProtocolError::InvalidMagic`
//! - Unknown opcodes decode as frames; only payload parsing rejects them
//! - All decode errors MUST be structured (never panic)
//! - Encoded size MUST equal 16 + payload_size

#![no_main]

use arbitrary::Arbitrary;
use concord_proto::{Frame, FrameFlags, FrameHeader, Opcode, Payload, ProtocolError};
use libfuzzer_sys::fuzz_target;

const MAGIC: [u8; 4] = FrameHeader::MAGIC.to_be_bytes();
const MAX_PAYLOAD_SIZE: u32 = FrameHeader::MAX_PAYLOAD_SIZE;

#[derive(Debug, Clone, Arbitrary)]
struct BoundaryFrame {
    magic: MagicBytes,
    version: VersionBytes,
    flags: u8,
    opcode: u16,
    request_id: u32,
    payload_size: PayloadSize,
}

#[derive(Debug, Clone, Arbitrary)]
enum MagicBytes {
    Valid,
    OffByOne(u8),
    AllZeros,
    AllOnes,
    Random([u8; 4]),
}

#[derive(Debug, Clone, Arbitrary)]
enum VersionBytes {
    Valid,
    Zero,
    Max,
    Random(u8),
}

#[derive(Debug, Clone, Arbitrary)]
enum PayloadSize {
    Zero,
    Small(u8),
    AtMaxBoundary,
    JustOverMax,
    WayOverMax,
    MaxU32,
    Random(u32),
}

fuzz_target!(|boundary: BoundaryFrame| {
    let payload_size_value = match boundary.payload_size {
        PayloadSize::Zero => 0,
        PayloadSize::Small(s) => u32::from(s),
        PayloadSize::AtMaxBoundary => MAX_PAYLOAD_SIZE,
        PayloadSize::JustOverMax => MAX_PAYLOAD_SIZE.saturating_add(1),
        PayloadSize::WayOverMax => MAX_PAYLOAD_SIZE.saturating_add(1_000_000),
        PayloadSize::MaxU32 => u32::MAX,
        PayloadSize::Random(r) => r,
    };

    let actual_payload_size = payload_size_value.min(100_000) as usize;
    let mut buffer = vec![0u8; FrameHeader::SIZE + actual_payload_size];

    let magic_valid = match boundary.magic {
        MagicBytes::Valid => {
            buffer[0..4].copy_from_slice(&MAGIC);
            true
        },
        MagicBytes::OffByOne(offset) => {
            buffer[0..4].copy_from_slice(&MAGIC);
            let idx = (offset % 4) as usize;
            buffer[idx] = buffer[idx].wrapping_add(1);
            false
        },
        MagicBytes::AllZeros => {
            buffer[0..4].fill(0);
            false
        },
        MagicBytes::AllOnes => {
            buffer[0..4].fill(0xFF);
            false
        },
        MagicBytes::Random(bytes) => {
            buffer[0..4].copy_from_slice(&bytes);
            bytes == MAGIC
        },
    };

    let version_value: u8 = match boundary.version {
        VersionBytes::Valid => FrameHeader::VERSION,
        VersionBytes::Zero => 0,
        VersionBytes::Max => u8::MAX,
        VersionBytes::Random(v) => v,
    };
    buffer[4] = version_value;
    buffer[5] = boundary.flags;
    buffer[6..8].copy_from_slice(&boundary.opcode.to_be_bytes());
    buffer[8..12].copy_from_slice(&boundary.request_id.to_be_bytes());
    buffer[12..16].copy_from_slice(&payload_size_value.to_be_bytes());

    match Frame::decode(&buffer) {
        Ok(frame) => {
            assert!(magic_valid);
            assert_eq!(version_value, FrameHeader::VERSION);
            assert!(payload_size_value <= MAX_PAYLOAD_SIZE);
            assert_eq!(frame.payload.len(), payload_size_value as usize);
            assert_eq!(frame.header.opcode(), boundary.opcode);
            assert_eq!(frame.header.request_id(), boundary.request_id);
            assert_eq!(frame.header.flags(), FrameFlags::from_byte(boundary.flags));

            if frame.header.opcode_enum().is_none() {
                assert!(matches!(
                    Payload::from_frame(&frame),
                    Err(ProtocolError::UnknownOpcode(op)) if op == boundary.opcode
                ));
            }
        },
        Err(ProtocolError::InvalidMagic) => assert!(!magic_valid),
        Err(ProtocolError::PayloadTooLarge { size, max }) => {
            assert_eq!(size, payload_size_value as usize);
            assert_eq!(max, MAX_PAYLOAD_SIZE as usize);
        },
        Err(_) => {},
    }

    if let Some(opcode) = Opcode::from_u16(boundary.opcode) {
        let mut header = FrameHeader::new(opcode);
        header.set_request_id(boundary.request_id);
        header.set_flags(FrameFlags::from_byte(boundary.flags));

        let small_payload = vec![0xAA; actual_payload_size.min(1000)];
        let frame = Frame::new(header, small_payload);

        let mut encoded = Vec::new();
        if frame.encode(&mut encoded).is_err() {
            return;
        }
        assert_eq!(encoded.len(), FrameHeader::SIZE + frame.payload.len());

        let decoded = Frame::decode(&encoded).expect("encoded frame must decode");
        assert_eq!(decoded, frame);
    }
});
