// Wire protocol for the façade-facing request/response socket (§10.4).
//
// Framing mirrors the exchange codec in `crate::exchange::codec`: a
// leading `u32` length prefix (little-endian) followed by the payload.
// Unlike the gossip wire format, the payload here is JSON rather than a
// hand-rolled binary layout — the façade protocol is request/response
// over TCP, not a broadcast datagram, so there is no pressure to shave
// bytes off of it, and JSON keeps `coord-cli` trivial to extend.

use crate::common::{Key, SessionId};
use crate::error::{CoordinationError, Result};
use crate::storage::StoredEntry;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum accepted frame size. Requests/responses carrying arbitrarily
/// large values would need chunking; out of scope for this façade.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Get { key: Key },
    Create { key: Key, value: Vec<u8> },
    GetOrCreate { key: Key, value: Vec<u8> },
    SetValue { key: Key, value: Vec<u8>, expected_version: u64 },
    Delete { key: Key, expected_version: u64, recursive: bool },
    GetSession,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Value(Option<Vec<u8>>),
    Entry(StoredEntry),
    Session(SessionId),
    Error { kind: String, message: String },
}

impl Response {
    pub fn from_error(e: &CoordinationError) -> Self {
        let kind = match e {
            CoordinationError::SessionTerminated => "SessionTerminated",
            CoordinationError::VersionConflict { .. } => "VersionConflict",
            CoordinationError::Exists(_) => "Exists",
            CoordinationError::NotFound(_) => "NotFound",
            CoordinationError::Cancelled => "Cancelled",
            CoordinationError::InvalidState(_) => "InvalidState",
            CoordinationError::TransientIO(_) => "TransientIO",
            CoordinationError::Network(_) => "Network",
            CoordinationError::Serialization(_) => "Serialization",
            CoordinationError::Configuration(_) => "Configuration",
            CoordinationError::Fatal(_) => "Fatal",
        };
        Response::Error {
            kind: kind.to_string(),
            message: e.to_string(),
        }
    }
}

/// Write one length-prefixed JSON frame to `stream`.
pub async fn write_frame<T, W>(stream: &mut W, value: &T) -> Result<()>
where
    T: Serialize,
    W: tokio::io::AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(value)
        .map_err(|e| CoordinationError::Serialization(e.to_string()))?;
    if payload.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(CoordinationError::Serialization(format!(
            "frame of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_FRAME_BYTES
        )));
    }
    stream.write_u32_le(payload.len() as u32).await?;
    stream.write_all(&payload).await?;
    Ok(())
}

/// Read one length-prefixed JSON frame from `stream`, or `None` on a
/// clean EOF before any bytes of the next frame arrive.
pub async fn read_frame<T, R>(stream: &mut R) -> Result<Option<T>>
where
    T: for<'de> Deserialize<'de>,
    R: tokio::io::AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(CoordinationError::Serialization(format!(
            "peer declared a {len} byte frame, exceeding the {MAX_FRAME_BYTES} byte limit"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    let value = serde_json::from_slice(&payload)
        .map_err(|e| CoordinationError::Serialization(e.to_string()))?;
    Ok(Some(value))
}
