//! Fuzz target for Frame::decode
//!
//! This fuzzer tests frame decoding with arbitrary byte sequences to find:
//! - Parser crashes or panics
//! - Integer overflows in size calculations
//! - Buffer over-reads
//! - Malformed headers that bypass validation
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an error.

#![no_main]

use concord_proto::{Frame, FrameHeader};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = Frame::decode(data) {
        // A decoded frame re-encodes to exactly the bytes it was read from
        let mut encoded = Vec::with_capacity(frame.encoded_len());
        frame.encode(&mut encoded).expect("decoded frame must re-encode");
        assert_eq!(encoded.as_slice(), &data[..FrameHeader::SIZE + frame.payload.len()]);
    }
});
