//! Fuzz target for CBOR deserialization attacks
//!
//! Harden CBOR payload deserialization against hostile clients.
//!
//! # Strategy
//!
//! - Deeply nested: Arrays/maps nested to arbitrary depth (stack overflow)
//! - Huge lengths: CBOR claiming massive byte/string/array lengths (memory)
//! - Random bytes: Completely arbitrary CBOR data (general malformation)
//! - Type confusion: Payload bytes that don't match frame opcode
//! - Duplicate keys: CBOR maps with repeated key names
//!
//! # Invariants
//!
//! - Deserialization completes quickly (no infinite loops)
//! - Deeply nested structures handled gracefully
//! - Huge claimed lengths rejected (not allocated)
//! - Type confusion (wrong payload for opcode) returns error
//! - NEVER panic on malformed CBOR

#![no_main]

use arbitrary::Arbitrary;
use concord_proto::{Frame, FrameHeader, Opcode, Payload};
use libfuzzer_sys::fuzz_target;

/// Opcodes whose payloads carry strings, byte buffers, maps or nested
/// records: the shapes an attacker has the most room to abuse.
const STRUCTURED: [Opcode; 8] = [
    Opcode::Hello,
    Opcode::JoinRoom,
    Opcode::CreateRoom,
    Opcode::Propose,
    Opcode::Publish,
    Opcode::Batch,
    Opcode::CatchUp,
    Opcode::ContinuityRestored,
];

#[derive(Debug, Clone, Arbitrary)]
enum CborAttack {
    DeeplyNested { depth: u8, payload_type: PayloadType },
    HugeLength { claimed_len_exponent: u8 },
    RandomBytes { bytes: Vec<u8> },
    TypeConfusion { opcode: u16, wrong_payload_bytes: Vec<u8> },
    DuplicateKeys { count: u8 },
}

#[derive(Debug, Clone, Arbitrary)]
enum PayloadType {
    Array,
    Map,
    Bytes,
    String,
}

fn try_decode(opcode: Opcode, cbor_bytes: Vec<u8>) {
    let frame = Frame::new(FrameHeader::new(opcode), cbor_bytes);
    let _ = Payload::from_frame(&frame);
}

fuzz_target!(|attack: CborAttack| {
    match attack {
        CborAttack::DeeplyNested { depth, payload_type } => {
            let actual_depth = (depth % 50) as usize;
            let cbor_bytes = create_nested_cbor(actual_depth, &payload_type);

            for opcode in STRUCTURED {
                try_decode(opcode, cbor_bytes.clone());
            }
        },

        CborAttack::HugeLength { claimed_len_exponent } => {
            let exponent = u32::from(claimed_len_exponent % 21);
            let claimed_length = if exponent < 20 { 1u32 << exponent } else { u32::MAX };

            let attacks = [
                create_huge_byte_string(claimed_length),
                create_huge_text_string(claimed_length),
                create_huge_array(claimed_length),
            ];

            for cbor_bytes in attacks {
                for opcode in STRUCTURED {
                    try_decode(opcode, cbor_bytes.clone());
                }
            }
        },

        CborAttack::RandomBytes { bytes } => {
            for opcode in STRUCTURED {
                try_decode(opcode, bytes.clone());
            }
        },

        CborAttack::TypeConfusion { opcode, wrong_payload_bytes } => {
            let opcode_enum = Opcode::from_u16(opcode).unwrap_or(Opcode::Publish);
            try_decode(opcode_enum, wrong_payload_bytes);
        },

        CborAttack::DuplicateKeys { count } => {
            let actual_count = (count % 10).max(2);
            let mut cbor_bytes = vec![0xA0 | actual_count];

            for _ in 0..actual_count {
                cbor_bytes.push(0x6A);
                cbor_bytes.extend_from_slice(b"credential");
                cbor_bytes.push(0x61);
                cbor_bytes.push(b'x');
            }

            try_decode(Opcode::Hello, cbor_bytes);
        },
    }
});

fn create_nested_cbor(depth: usize, payload_type: &PayloadType) -> Vec<u8> {
    let mut bytes = Vec::new();

    match payload_type {
        PayloadType::Array => {
            bytes.extend(std::iter::repeat_n(0x81, depth));
            bytes.push(0x01);
        },
        PayloadType::Map => {
            for _ in 0..depth {
                bytes.extend_from_slice(&[0xA1, 0x61, b'a']);
            }
            bytes.push(0x01);
        },
        PayloadType::Bytes => {
            bytes.extend(std::iter::repeat_n(0x81, depth));
            bytes.extend_from_slice(&[0x41, 0x00]);
        },
        PayloadType::String => {
            bytes.extend(std::iter::repeat_n(0x81, depth));
            bytes.extend_from_slice(&[0x61, b'x']);
        },
    }

    bytes
}

fn create_huge_byte_string(claimed_length: u32) -> Vec<u8> {
    let mut bytes = vec![0x5A];
    bytes.extend_from_slice(&claimed_length.to_be_bytes());
    bytes.extend(vec![0xAA; (claimed_length as usize).min(10)]);
    bytes
}

fn create_huge_text_string(claimed_length: u32) -> Vec<u8> {
    let mut bytes = vec![0x7A];
    bytes.extend_from_slice(&claimed_length.to_be_bytes());
    bytes.extend(vec![b'x'; (claimed_length as usize).min(10)]);
    bytes
}

fn create_huge_array(claimed_length: u32) -> Vec<u8> {
    let mut bytes = vec![0x9A];
    bytes.extend_from_slice(&claimed_length.to_be_bytes());
    bytes.extend(std::iter::repeat_n(0x01, (claimed_length as usize).min(5)));
    bytes
}
