// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Peer wire protocol.
//!
//! Agents push replicated mutations to each other over plaintext TCP using
//! fixed-length binary frames (no transport security; known gap). Scalars
//! are big-endian on the wire since frames cross hosts.
//!
//! # Frames
//!
//! Request: one opcode byte followed by an op-specific fixed body.
//!
//! ```text
//! SetValue:  [0x01][key: i32][value: i32][kind: i32][map_id: i32]
//! GetValue:  [0x02]
//! ```
//!
//! Response: one status byte. `SetValue` always receives [`STATUS_OK`] once
//! delivered; map-engine errors do not propagate across the wire. `GetValue`
//! is declared in the protocol surface but implemented by no agent variant
//! and always receives [`STATUS_UNIMPLEMENTED`].
//!
//! A connection carries any number of request frames until EOF, so both
//! per-event dialers and pooled senders are served by the same receiver
//! loop. Unknown opcodes and truncated bodies are protocol violations and
//! close the connection; an unknown `kind` inside a well-formed `SetValue`
//! is NOT a violation (the receiver no-ops and acknowledges).

use crate::error::{AgentError, Result};
use crate::event::MutationKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Opcode: apply a replicated mutation.
pub const OP_SET_VALUE: u8 = 0x01;
/// Opcode: read back the last applied mutation. Never implemented.
pub const OP_GET_VALUE: u8 = 0x02;

/// Ack: request processed (which for `SetValue` means "delivered", not
/// "kernel map apply succeeded").
pub const STATUS_OK: u8 = 0x00;
/// Ack: operation declared but not implemented.
pub const STATUS_UNIMPLEMENTED: u8 = 0x01;

/// Byte length of the `SetValue` body.
pub const SET_VALUE_BODY_LEN: usize = 16;

/// One replicated mutation as it crosses the wire.
///
/// `kind` stays a raw i32 here: the receiver must accept frames whose kind
/// it does not recognize (no-op plus ack), so parsing must not reject them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationRequest {
    pub key: i32,
    pub value: i32,
    pub kind: i32,
    pub map_id: i32,
}

impl ReplicationRequest {
    /// Build a request for a recognized mutation kind.
    pub fn new(key: i32, value: i32, kind: MutationKind, map_id: i32) -> Self {
        Self {
            key,
            value,
            kind: kind.as_wire(),
            map_id,
        }
    }

    /// The mutation kind, if this agent generation recognizes it.
    pub fn mutation_kind(&self) -> Option<MutationKind> {
        MutationKind::from_wire(self.kind)
    }

    /// Encode the fixed 16-byte `SetValue` body.
    pub fn encode_body(&self) -> [u8; SET_VALUE_BODY_LEN] {
        let mut body = [0u8; SET_VALUE_BODY_LEN];
        body[0..4].copy_from_slice(&self.key.to_be_bytes());
        body[4..8].copy_from_slice(&self.value.to_be_bytes());
        body[8..12].copy_from_slice(&self.kind.to_be_bytes());
        body[12..16].copy_from_slice(&self.map_id.to_be_bytes());
        body
    }

    /// Decode a `SetValue` body.
    ///
    /// Errors if the slice is not exactly [`SET_VALUE_BODY_LEN`] bytes.
    pub fn from_body(body: &[u8]) -> Result<Self> {
        if body.len() != SET_VALUE_BODY_LEN {
            return Err(AgentError::Wire(format!(
                "set_value body is {} bytes, expected {}",
                body.len(),
                SET_VALUE_BODY_LEN
            )));
        }
        Ok(Self {
            key: read_i32_be(body, 0),
            value: read_i32_be(body, 4),
            kind: read_i32_be(body, 8),
            map_id: read_i32_be(body, 12),
        })
    }
}

impl std::fmt::Display for ReplicationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.mutation_kind() {
            Some(kind) => write!(
                f,
                "{} key={} value={} map_id={}",
                kind, self.key, self.value, self.map_id
            ),
            None => write!(
                f,
                "UNKNOWN({}) key={} value={} map_id={}",
                self.kind, self.key, self.value, self.map_id
            ),
        }
    }
}

/// A parsed inbound request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    SetValue(ReplicationRequest),
    GetValue,
}

impl Request {
    /// Opcode byte for this request.
    pub fn opcode(&self) -> u8 {
        match self {
            Request::SetValue(_) => OP_SET_VALUE,
            Request::GetValue => OP_GET_VALUE,
        }
    }

    /// Encode the full frame (opcode plus body).
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::SetValue(req) => {
                let mut frame = Vec::with_capacity(1 + SET_VALUE_BODY_LEN);
                frame.push(OP_SET_VALUE);
                frame.extend_from_slice(&req.encode_body());
                frame
            }
            Request::GetValue => vec![OP_GET_VALUE],
        }
    }
}

/// Read one request frame.
///
/// Returns `Ok(None)` on clean EOF before an opcode (the peer is done with
/// this connection). A truncated body or unknown opcode is a
/// [`AgentError::Wire`] protocol violation; callers close the connection.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request>>
where
    R: AsyncRead + Unpin,
{
    let mut op = [0u8; 1];
    let n = reader
        .read(&mut op)
        .await
        .map_err(|e| AgentError::Wire(format!("reading opcode: {e}")))?;
    if n == 0 {
        return Ok(None);
    }

    match op[0] {
        OP_SET_VALUE => {
            let mut body = [0u8; SET_VALUE_BODY_LEN];
            reader
                .read_exact(&mut body)
                .await
                .map_err(|e| AgentError::Wire(format!("reading set_value body: {e}")))?;
            Ok(Some(Request::SetValue(ReplicationRequest::from_body(
                &body,
            )?)))
        }
        OP_GET_VALUE => Ok(Some(Request::GetValue)),
        other => Err(AgentError::Wire(format!("unknown opcode {other:#04x}"))),
    }
}

/// Write one request frame (client side).
pub async fn write_request<W>(writer: &mut W, request: &Request) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&request.encode()).await?;
    writer.flush().await
}

/// Write the one-byte status ack (server side).
pub async fn write_status<W>(writer: &mut W, status: u8) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&[status]).await?;
    writer.flush().await
}

/// Read the one-byte status ack (client side).
pub async fn read_status<R>(reader: &mut R) -> std::io::Result<u8>
where
    R: AsyncRead + Unpin,
{
    let mut status = [0u8; 1];
    reader.read_exact(&mut status).await?;
    Ok(status[0])
}

fn read_i32_be(buf: &[u8], offset: usize) -> i32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    i32::from_be_bytes(bytes)
}
