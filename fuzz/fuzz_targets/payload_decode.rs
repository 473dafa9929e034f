//! Fuzz target for Payload::from_frame
//!
//! This fuzzer tests payload deserialization (CBOR decoding) with:
//! - Malformed CBOR data
//! - Type confusion attacks (wrong payload type for opcode)
//! - Oversized strings or collections
//! - Nested structures exceeding depth limits
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an error.

#![no_main]

use bytes::Bytes;
use concord_proto::{Frame, FrameHeader, Opcode, Payload};
use libfuzzer_sys::fuzz_target;

const OPCODES: [Opcode; 21] = [
    Opcode::Hello,
    Opcode::HelloReply,
    Opcode::Goodbye,
    Opcode::Ping,
    Opcode::Pong,
    Opcode::JoinRoom,
    Opcode::LeaveRoom,
    Opcode::CreateRoom,
    Opcode::Propose,
    Opcode::FetchState,
    Opcode::Publish,
    Opcode::Joined,
    Opcode::Deliver,
    Opcode::Batch,
    Opcode::StateChanged,
    Opcode::ProposalResult,
    Opcode::CatchUp,
    Opcode::ContinuityRestored,
    Opcode::RoomClosed,
    Opcode::Presence,
    Opcode::Error,
];

fuzz_target!(|data: &[u8]| {
    for opcode in OPCODES {
        let frame = Frame::new(FrameHeader::new(opcode), Bytes::copy_from_slice(data));

        // Whatever decodes must carry the opcode it was decoded under
        if let Ok(payload) = Payload::from_frame(&frame) {
            assert_eq!(payload.opcode(), opcode);
        }
    }
});
