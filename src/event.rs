// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Decoder for kernel-emitted map mutation records.
//!
//! The BPF side reports every observed map update/delete as one fixed-layout
//! record on the event ring buffer. The layout is a byte-exact contract with
//! the instrumentation; this module decodes it with explicit per-field byte
//! ranges rather than aliasing the buffer as a struct, so no language-level
//! padding rule can silently shift a field.
//!
//! # Record Layout
//!
//! | field      | offset | len | type                         |
//! |------------|--------|-----|------------------------------|
//! | map_id     | 0      | 4   | u32                          |
//! | name       | 4      | 16  | NUL-padded map name          |
//! | origin     | 20     | 4   | i32 discriminant             |
//! | pid        | 24     | 4   | u32 (triggering thread)      |
//! | key_size   | 28     | 4   | u32 (bytes used in `key`)    |
//! | value_size | 32     | 4   | u32 (bytes used in `value`)  |
//! | key        | 36     | 64  | raw key bytes                |
//! | value      | 100    | 280 | raw value bytes              |
//!
//! Total length is [`EVENT_RECORD_LEN`] (380 bytes). Scalars are read with
//! native endianness: records are produced and consumed on the same host.
//!
//! Delete records carry `value_size = 0` and a zeroed value buffer (the
//! kernel hook has no value pointer to read on the delete path).
//!
//! # Integer Narrowing
//!
//! The peer wire protocol replicates 32-bit integer keys and values only.
//! [`MutationEvent::key_as_i32`] and [`MutationEvent::value_as_i32`] reject
//! any other declared width instead of truncating: replicating a truncated
//! key would corrupt the peer's map silently, dropping the event is visible
//! in logs and metrics.

use thiserror::Error;

/// Capacity of the NUL-padded map name field.
pub const MAP_NAME_LEN: usize = 16;
/// Capacity of the raw key buffer.
pub const MAX_KEY_SIZE: usize = 64;
/// Capacity of the raw value buffer.
pub const MAX_VALUE_SIZE: usize = 280;

const MAP_ID_OFFSET: usize = 0;
const NAME_OFFSET: usize = 4;
const ORIGIN_OFFSET: usize = 20;
const PID_OFFSET: usize = 24;
const KEY_SIZE_OFFSET: usize = 28;
const VALUE_SIZE_OFFSET: usize = 32;
const KEY_OFFSET: usize = 36;
const VALUE_OFFSET: usize = 100;

/// Exact length of one kernel mutation record.
pub const EVENT_RECORD_LEN: usize = VALUE_OFFSET + MAX_VALUE_SIZE;

/// What triggered an observed map mutation.
///
/// Discriminants are part of the contract with the BPF side and must not be
/// reordered. The first two match the original two-member generation of the
/// instrumentation, so older objects stay decodable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum EventOrigin {
    /// In-kernel update of a hashtab map (fentry on `htab_map_update_elem`).
    KernelUpdate = 0,
    /// In-kernel delete of a hashtab map (fentry on `htab_map_delete_elem`).
    KernelDelete = 1,
    /// Update issued through a user-space map reference.
    UserUpdate = 2,
    /// Delete issued through a user-space map reference.
    UserDelete = 3,
    /// `bpf(2)` syscall map lookup. Observed but never replicated.
    SyscallGet = 4,
    /// `bpf(2)` syscall map update.
    SyscallUpdate = 5,
    /// `bpf(2)` syscall map delete.
    SyscallDelete = 6,
    /// Mutation attributed to user mode without a classified operation.
    Usermode = 7,
}

impl EventOrigin {
    /// Parse a raw discriminant from a decoded record.
    ///
    /// Returns `None` for discriminants this agent generation does not
    /// define; callers drop such events (they are not an error).
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(EventOrigin::KernelUpdate),
            1 => Some(EventOrigin::KernelDelete),
            2 => Some(EventOrigin::UserUpdate),
            3 => Some(EventOrigin::UserDelete),
            4 => Some(EventOrigin::SyscallGet),
            5 => Some(EventOrigin::SyscallUpdate),
            6 => Some(EventOrigin::SyscallDelete),
            7 => Some(EventOrigin::Usermode),
            _ => None,
        }
    }

    /// Map this origin to the wire kind it replicates as.
    ///
    /// `None` means the origin is observed but not replicated (reads, and
    /// triggers that do not classify the operation). The mapping is total:
    /// every defined origin yields exactly one of Update, Delete, or `None`.
    pub fn replication_kind(self) -> Option<MutationKind> {
        match self {
            EventOrigin::KernelUpdate => Some(MutationKind::Update),
            EventOrigin::UserUpdate => Some(MutationKind::Update),
            EventOrigin::SyscallUpdate => Some(MutationKind::Update),
            EventOrigin::KernelDelete => Some(MutationKind::Delete),
            EventOrigin::UserDelete => Some(MutationKind::Delete),
            EventOrigin::SyscallDelete => Some(MutationKind::Delete),
            EventOrigin::SyscallGet => None,
            EventOrigin::Usermode => None,
        }
    }
}

impl std::fmt::Display for EventOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventOrigin::KernelUpdate => "KernelUpdate",
            EventOrigin::KernelDelete => "KernelDelete",
            EventOrigin::UserUpdate => "UserUpdate",
            EventOrigin::UserDelete => "UserDelete",
            EventOrigin::SyscallGet => "SyscallGet",
            EventOrigin::SyscallUpdate => "SyscallUpdate",
            EventOrigin::SyscallDelete => "SyscallDelete",
            EventOrigin::Usermode => "Usermode",
        };
        write!(f, "{}", name)
    }
}

/// Mutation kind carried on the peer wire.
///
/// Discriminants are the wire encoding; order matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MutationKind {
    Update = 0,
    Delete = 1,
}

impl MutationKind {
    /// Wire encoding of this kind.
    pub fn as_wire(self) -> i32 {
        self as i32
    }

    /// Parse a wire kind.
    ///
    /// Returns `None` for unknown values; the receiver treats those as a
    /// no-op and still acknowledges.
    pub fn from_wire(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(MutationKind::Update),
            1 => Some(MutationKind::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationKind::Update => write!(f, "UPDATE"),
            MutationKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// Rejected integer narrowing of a key or value field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field} is {size} bytes, the wire protocol replicates exactly 4-byte integers")]
pub struct NarrowError {
    pub field: &'static str,
    pub size: u32,
}

/// One decoded kernel map mutation record.
///
/// Fields mirror the record layout; the raw key/value buffers keep their
/// fixed capacity with only the first `key_size`/`value_size` bytes
/// meaningful. `origin_raw` keeps the undecoded discriminant so records from
/// unknown instrumentation generations still decode (and get dropped later
/// with their raw value in the log).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationEvent {
    pub map_id: u32,
    pub name: [u8; MAP_NAME_LEN],
    pub origin_raw: i32,
    pub pid: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub key: [u8; MAX_KEY_SIZE],
    pub value: [u8; MAX_VALUE_SIZE],
}

impl MutationEvent {
    /// Decode one record from the event ring buffer.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`EVENT_RECORD_LEN`]. The kernel
    /// boundary never legitimately emits short records, so this is an
    /// integrity violation of the instrumentation contract and takes the
    /// ingestion loop down rather than limping on with garbage.
    pub fn decode(buf: &[u8]) -> Self {
        assert!(
            buf.len() >= EVENT_RECORD_LEN,
            "mutation record too short: {} bytes, need {}",
            buf.len(),
            EVENT_RECORD_LEN
        );

        let mut name = [0u8; MAP_NAME_LEN];
        name.copy_from_slice(&buf[NAME_OFFSET..NAME_OFFSET + MAP_NAME_LEN]);
        let mut key = [0u8; MAX_KEY_SIZE];
        key.copy_from_slice(&buf[KEY_OFFSET..KEY_OFFSET + MAX_KEY_SIZE]);
        let mut value = [0u8; MAX_VALUE_SIZE];
        value.copy_from_slice(&buf[VALUE_OFFSET..VALUE_OFFSET + MAX_VALUE_SIZE]);

        MutationEvent {
            map_id: read_u32(buf, MAP_ID_OFFSET),
            name,
            origin_raw: read_i32(buf, ORIGIN_OFFSET),
            pid: read_u32(buf, PID_OFFSET),
            key_size: read_u32(buf, KEY_SIZE_OFFSET),
            value_size: read_u32(buf, VALUE_SIZE_OFFSET),
            key,
            value,
        }
    }

    /// Map name up to the first NUL, lossily decoded.
    pub fn map_name(&self) -> String {
        let end = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(MAP_NAME_LEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Origin of the mutation, if this generation defines the discriminant.
    pub fn origin(&self) -> Option<EventOrigin> {
        EventOrigin::from_raw(self.origin_raw)
    }

    /// The meaningful prefix of the key buffer.
    ///
    /// The declared size is clamped to the buffer capacity so a corrupt
    /// record cannot index out of bounds.
    pub fn key_bytes(&self) -> &[u8] {
        &self.key[..(self.key_size as usize).min(MAX_KEY_SIZE)]
    }

    /// The meaningful prefix of the value buffer.
    pub fn value_bytes(&self) -> &[u8] {
        &self.value[..(self.value_size as usize).min(MAX_VALUE_SIZE)]
    }

    /// Narrow the key to the wire's i32 domain.
    ///
    /// Errors unless the record declares exactly 4 key bytes.
    pub fn key_as_i32(&self) -> std::result::Result<i32, NarrowError> {
        if self.key_size != 4 {
            return Err(NarrowError {
                field: "key",
                size: self.key_size,
            });
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.key[..4]);
        Ok(i32::from_ne_bytes(bytes))
    }

    /// Narrow the value to the wire's i32 domain.
    ///
    /// Errors unless the record declares exactly 4 value bytes. Delete
    /// records declare 0 and never call this; they replicate `value = 0`.
    pub fn value_as_i32(&self) -> std::result::Result<i32, NarrowError> {
        if self.value_size != 4 {
            return Err(NarrowError {
                field: "value",
                size: self.value_size,
            });
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.value[..4]);
        Ok(i32::from_ne_bytes(bytes))
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_ne_bytes(bytes)
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    i32::from_ne_bytes(bytes)
}
