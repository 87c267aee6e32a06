//! Fuzz target for the kernel record decoder.
//!
//! Decode is specified to panic on short buffers, so the harness only
//! feeds full-length ones; on those it must never panic and every
//! accessor must stay in bounds.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mapsync::event::{MutationEvent, EVENT_RECORD_LEN, MAX_KEY_SIZE, MAX_VALUE_SIZE};

fuzz_target!(|data: &[u8]| {
    if data.len() < EVENT_RECORD_LEN {
        return;
    }

    let event = MutationEvent::decode(data);
    assert!(event.key_bytes().len() <= MAX_KEY_SIZE);
    assert!(event.value_bytes().len() <= MAX_VALUE_SIZE);
    let _ = event.map_name();
    let _ = event.origin();
    let _ = event.key_as_i32();
    let _ = event.value_as_i32();
});
