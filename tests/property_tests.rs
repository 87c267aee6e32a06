//! Property-based tests for the codec boundaries.
//!
//! The decoders sit on untrusted input (kernel records after buffer
//! corruption, arbitrary bytes from the network), so their totality
//! properties are checked over generated input rather than examples.

mod common;

use mapsync::event::{
    EventOrigin, MutationEvent, EVENT_RECORD_LEN, MAX_KEY_SIZE, MAX_VALUE_SIZE,
};
use mapsync::wire::{self, ReplicationRequest};
use proptest::prelude::*;

proptest! {
    /// Any full-length buffer decodes without panicking, and every accessor
    /// stays within the fixed buffers regardless of the declared sizes.
    #[test]
    fn decode_is_total_on_full_length_buffers(
        buf in proptest::collection::vec(any::<u8>(), EVENT_RECORD_LEN..EVENT_RECORD_LEN + 64)
    ) {
        let event = MutationEvent::decode(&buf);
        prop_assert!(event.key_bytes().len() <= MAX_KEY_SIZE);
        prop_assert!(event.value_bytes().len() <= MAX_VALUE_SIZE);
        prop_assert!(event.map_name().len() <= 64); // lossy UTF-8 can expand
        let _ = event.origin();
        let _ = event.key_as_i32();
        let _ = event.value_as_i32();
    }

    /// Origin parsing accepts exactly the eight defined discriminants, and
    /// every accepted origin has a defined replication disposition.
    #[test]
    fn origin_mapping_is_total(raw in any::<i32>()) {
        match EventOrigin::from_raw(raw) {
            Some(origin) => {
                prop_assert!((0..=7).contains(&raw));
                let _ = origin.replication_kind();
            }
            None => prop_assert!(!(0..=7).contains(&raw)),
        }
    }

    /// Narrowing accepts a key iff the record declares exactly four bytes.
    #[test]
    fn key_narrowing_accepts_only_width_four(declared in any::<u32>(), key in any::<i32>()) {
        let mut buf = common::build_record(1, "m", 0, 1, &key.to_ne_bytes(), &[]);
        buf[28..32].copy_from_slice(&declared.to_ne_bytes());
        let event = MutationEvent::decode(&buf);
        prop_assert_eq!(event.key_as_i32().is_ok(), declared == 4);
    }

    /// The wire body codec is a bijection over all i32 quads, including
    /// kinds no agent generation defines.
    #[test]
    fn request_body_round_trips(
        key in any::<i32>(),
        value in any::<i32>(),
        kind in any::<i32>(),
        map_id in any::<i32>(),
    ) {
        let req = ReplicationRequest { key, value, kind, map_id };
        let decoded = ReplicationRequest::from_body(&req.encode_body()).unwrap();
        prop_assert_eq!(decoded, req);
    }

    /// The frame parser returns clean EOF, a frame, or a nonfatal wire
    /// error on arbitrary bytes. It must never panic and never produce a
    /// fatal error from network input.
    #[test]
    fn frame_parser_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let result = rt.block_on(async {
            let mut reader = bytes.as_slice();
            wire::read_request(&mut reader).await
        });
        if let Err(e) = result {
            prop_assert!(!e.is_fatal());
        }
    }

    /// Well-formed records with i32 keys and values always make it through
    /// decode and narrowing unchanged.
    #[test]
    fn well_formed_records_narrow_losslessly(key in any::<i32>(), value in any::<i32>()) {
        let buf = common::build_record(
            7,
            "hash_map",
            0,
            1,
            &key.to_ne_bytes(),
            &value.to_ne_bytes(),
        );
        let event = MutationEvent::decode(&buf);
        prop_assert_eq!(event.key_as_i32(), Ok(key));
        prop_assert_eq!(event.value_as_i32(), Ok(value));
    }
}
