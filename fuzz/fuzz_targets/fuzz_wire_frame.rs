//! Fuzz target for the inbound frame parser.
//!
//! Network bytes are fully untrusted: parsing must never panic, and the
//! only errors it may produce are nonfatal wire violations.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mapsync::wire::{read_request, ReplicationRequest};

fuzz_target!(|data: &[u8]| {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let result = rt.block_on(async {
        let mut reader = data;
        read_request(&mut reader).await
    });
    if let Err(e) = result {
        assert!(!e.is_fatal());
    }

    // The body decoder on its own, for exact-length slices.
    if data.len() >= 16 {
        let _ = ReplicationRequest::from_body(&data[..16]);
    }
});
