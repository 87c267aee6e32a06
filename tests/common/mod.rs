//! Shared helpers for the integration suites.

#![allow(dead_code)]

pub mod mock_gateway;

use mapsync::event::EVENT_RECORD_LEN;

/// Build one kernel mutation record the way the instrumentation lays it
/// out: map_id at 0, NUL-padded name at 4, origin at 20, pid at 24, sizes
/// at 28/32, key at 36, value at 100. Native-endian scalars.
pub fn build_record(
    map_id: u32,
    name: &str,
    origin: i32,
    pid: u32,
    key: &[u8],
    value: &[u8],
) -> Vec<u8> {
    assert!(name.len() <= 16);
    assert!(key.len() <= 64);
    assert!(value.len() <= 280);

    let mut buf = vec![0u8; EVENT_RECORD_LEN];
    buf[0..4].copy_from_slice(&map_id.to_ne_bytes());
    buf[4..4 + name.len()].copy_from_slice(name.as_bytes());
    buf[20..24].copy_from_slice(&origin.to_ne_bytes());
    buf[24..28].copy_from_slice(&pid.to_ne_bytes());
    buf[28..32].copy_from_slice(&(key.len() as u32).to_ne_bytes());
    buf[32..36].copy_from_slice(&(value.len() as u32).to_ne_bytes());
    buf[36..36 + key.len()].copy_from_slice(key);
    buf[100..100 + value.len()].copy_from_slice(value);
    buf
}

/// An update record with i32 key and value, as the replication path
/// expects.
pub fn update_record(key: i32, value: i32) -> Vec<u8> {
    build_record(7, "hash_map", 0, 4242, &key.to_ne_bytes(), &value.to_ne_bytes())
}

/// A delete record: i32 key, no value bytes.
pub fn delete_record(key: i32) -> Vec<u8> {
    build_record(7, "hash_map", 1, 4242, &key.to_ne_bytes(), &[])
}
