// Wire codec for the three Cache-Fusion-style gossip messages (§4.5).
//
// Frame layout, all integers little-endian:
//
//   u32 total_length
//   u8  tag                 (0x01 invalidate, 0x02 read released, 0x03 write released)
//   u32 key_len   + key bytes (utf8)
//   u32 sess_len  + session bytes (address/tag sub-frame, see `encode_session`)

use crate::common::{Key, SessionId};
use crate::error::{CoordinationError, Result};
use bytes::{Buf, BufMut, BytesMut};

const TAG_INVALIDATE: u8 = 0x01;
const TAG_RELEASED_READ: u8 = 0x02;
const TAG_RELEASED_WRITE: u8 = 0x03;

/// A single gossiped message between coordination peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    InvalidateCacheEntry { key: Key, session: SessionId },
    ReleasedReadLock { key: Key, session: SessionId },
    ReleasedWriteLock { key: Key, session: SessionId },
}

impl Message {
    fn tag(&self) -> u8 {
        match self {
            Message::InvalidateCacheEntry { .. } => TAG_INVALIDATE,
            Message::ReleasedReadLock { .. } => TAG_RELEASED_READ,
            Message::ReleasedWriteLock { .. } => TAG_RELEASED_WRITE,
        }
    }

    fn key(&self) -> &Key {
        match self {
            Message::InvalidateCacheEntry { key, .. }
            | Message::ReleasedReadLock { key, .. }
            | Message::ReleasedWriteLock { key, .. } => key,
        }
    }

    fn session(&self) -> &SessionId {
        match self {
            Message::InvalidateCacheEntry { session, .. }
            | Message::ReleasedReadLock { session, .. }
            | Message::ReleasedWriteLock { session, .. } => session,
        }
    }

    /// Encode the full outer frame, including the leading `total_length`.
    pub fn encode(&self) -> BytesMut {
        let key_bytes = self.key().as_bytes();
        let session_bytes = encode_session(self.session());

        let payload_len = 1 + 4 + key_bytes.len() + 4 + session_bytes.len();
        let mut frame = BytesMut::with_capacity(4 + payload_len);

        frame.put_u32_le(payload_len as u32);
        frame.put_u8(self.tag());
        frame.put_u32_le(key_bytes.len() as u32);
        frame.put_slice(key_bytes);
        frame.put_u32_le(session_bytes.len() as u32);
        frame.put_slice(&session_bytes);

        frame
    }

    /// Decode a full outer frame. Malformed input (truncated length
    /// prefix, unknown tag, non-UTF8 key) yields `Serialization`, never a
    /// panic — frames arrive from untrusted peers.
    pub fn decode(buf: &[u8]) -> Result<Message> {
        let mut cursor = buf;

        if cursor.len() < 4 {
            return Err(CoordinationError::Serialization(
                "frame shorter than the length prefix".into(),
            ));
        }
        let total_length = cursor.get_u32_le() as usize;
        if cursor.len() < total_length {
            return Err(CoordinationError::Serialization(format!(
                "frame declares {total_length} bytes, only {} available",
                cursor.len()
            )));
        }
        // A datagram never carries more than one frame; trailing bytes
        // beyond `total_length` are ignored rather than rejected.
        let mut payload = &cursor[..total_length];

        if payload.is_empty() {
            return Err(CoordinationError::Serialization("empty payload".into()));
        }
        let tag = payload.get_u8();

        let key = read_len_prefixed(&mut payload)?;
        let key = String::from_utf8(key)
            .map_err(|_| CoordinationError::Serialization("key is not valid utf8".into()))?;

        let session_bytes = read_len_prefixed(&mut payload)?;
        let session = decode_session(&session_bytes)?;

        match tag {
            TAG_INVALIDATE => Ok(Message::InvalidateCacheEntry { key, session }),
            TAG_RELEASED_READ => Ok(Message::ReleasedReadLock { key, session }),
            TAG_RELEASED_WRITE => Ok(Message::ReleasedWriteLock { key, session }),
            other => Err(CoordinationError::Serialization(format!(
                "unknown message tag 0x{other:02x}"
            ))),
        }
    }
}

fn read_len_prefixed(buf: &mut &[u8]) -> Result<Vec<u8>> {
    if buf.len() < 4 {
        return Err(CoordinationError::Serialization(
            "truncated length prefix".into(),
        ));
    }
    let len = buf.get_u32_le() as usize;
    if buf.len() < len {
        return Err(CoordinationError::Serialization(
            "truncated length-prefixed field".into(),
        ));
    }
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}

fn encode_session(session: &SessionId) -> BytesMut {
    let mut buf = BytesMut::with_capacity(8 + session.address.len() + session.tag.len());
    buf.put_u32_le(session.address.len() as u32);
    buf.put_slice(&session.address);
    buf.put_u32_le(session.tag.len() as u32);
    buf.put_slice(&session.tag);
    buf
}

fn decode_session(mut bytes: &[u8]) -> Result<SessionId> {
    let address = read_len_prefixed(&mut bytes)?;
    let tag = read_len_prefixed(&mut bytes)?;
    Ok(SessionId::new(address, tag))
}
