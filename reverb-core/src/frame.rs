//! Node-to-node wire frame codec.
//!
//! Frame layout, bit-exact:
//!
//! ```text
//! +------------+-----------+-----------+----------------+---------+
//! | len u32 BE | plen u8   | path      | request u64 BE | payload |
//! +------------+-----------+-----------+----------------+---------+
//! ```
//!
//! `len` counts everything after itself. Request and response frames share
//! the layout; a response echoes the request id with an empty path.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Fixed overhead after the length word: path length byte + request id.
const FRAME_FIXED: usize = 1 + 8;

/// One request or response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// RPC path, e.g. `/channel/leaderTermStartIndex`. Empty on responses.
    pub path: String,
    /// Correlates a response with its request.
    pub request_id: u64,
    /// Opaque body.
    pub payload: Bytes,
}

impl Frame {
    /// Build a request frame.
    pub fn request(path: impl Into<String>, request_id: u64, payload: Bytes) -> Self {
        Self {
            path: path.into(),
            request_id,
            payload,
        }
    }

    /// Build a response frame for the given request id.
    pub fn response(request_id: u64, payload: Bytes) -> Self {
        Self {
            path: String::new(),
            request_id,
            payload,
        }
    }

    /// Whether this frame is a response (no path).
    pub fn is_response(&self) -> bool {
        self.path.is_empty()
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Result<Bytes> {
        if self.path.len() > u8::MAX as usize {
            return Err(Error::Decode(format!("path too long: {}", self.path.len())));
        }
        let body_len = FRAME_FIXED + self.path.len() + self.payload.len();
        let mut buf = BytesMut::with_capacity(4 + body_len);
        buf.put_u32(body_len as u32);
        buf.put_u8(self.path.len() as u8);
        buf.put_slice(self.path.as_bytes());
        buf.put_u64(self.request_id);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `buf`, consuming it.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a full frame,
    /// leaving `buf` untouched so more bytes can be appended.
    pub fn decode(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Frame>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if body_len > max_frame_size {
            return Err(Error::FrameTooLarge {
                size: body_len,
                max: max_frame_size,
            });
        }
        if body_len < FRAME_FIXED {
            return Err(Error::Decode(format!("frame body too short: {}", body_len)));
        }
        if buf.len() < 4 + body_len {
            return Ok(None);
        }
        buf.advance(4);
        let path_len = buf.get_u8() as usize;
        if FRAME_FIXED + path_len > body_len {
            return Err(Error::Decode(format!(
                "path length {} exceeds frame body {}",
                path_len, body_len
            )));
        }
        let path_bytes = buf.split_to(path_len);
        let path = std::str::from_utf8(&path_bytes)
            .map_err(|_| Error::Decode("path is not utf-8".into()))?
            .to_string();
        let request_id = buf.get_u64();
        let payload = buf.split_to(body_len - FRAME_FIXED - path_len).freeze();
        Ok(Some(Frame {
            path,
            request_id,
            payload,
        }))
    }
}

/// Append an unsigned varint (LEB128) to `buf`.
pub fn put_uvarint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Read an unsigned varint from the front of `buf`.
pub fn get_uvarint(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(Error::Decode("varint truncated".into()));
        }
        let byte = buf.get_u8();
        if shift == 63 && byte > 1 {
            return Err(Error::Decode("varint overflows u64".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Append a varint-length-prefixed string.
pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_uvarint(buf, s.len() as u64);
    buf.put_slice(s.as_bytes());
}

/// Read a varint-length-prefixed string.
pub fn get_string(buf: &mut impl Buf) -> Result<String> {
    let len = get_uvarint(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::Decode(format!(
            "string truncated: want {} bytes, have {}",
            len,
            buf.remaining()
        )));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| Error::Decode("string is not utf-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::request(
            "/channel/leaderTermStartIndex",
            77,
            Bytes::from_static(b"hello"),
        );
        let encoded = frame.encode().unwrap();
        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = Frame::decode(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
        assert!(!decoded.is_response());
    }

    #[test]
    fn test_frame_layout_is_pinned() {
        let frame = Frame::request("/a", 1, Bytes::from_static(b"x"));
        let encoded = frame.encode().unwrap();
        // len | plen | "/a" | request id | payload
        assert_eq!(
            &encoded[..],
            &[
                0, 0, 0, 12, // body length: 1 + 2 + 8 + 1
                2, b'/', b'a', // path
                0, 0, 0, 0, 0, 0, 0, 1, // request id
                b'x',
            ]
        );
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let frame = Frame::response(9, Bytes::from_static(b"abc"));
        let encoded = frame.encode().unwrap();
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(Frame::decode(&mut buf, 1024).unwrap().is_none());
        buf.put_u8(encoded[encoded.len() - 1]);
        let decoded = Frame::decode(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(decoded.is_response());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let a = Frame::request("/x", 1, Bytes::from_static(b"one"));
        let b = Frame::request("/y", 2, Bytes::from_static(b"two"));
        let mut buf = BytesMut::new();
        buf.put_slice(&a.encode().unwrap());
        buf.put_slice(&b.encode().unwrap());
        assert_eq!(Frame::decode(&mut buf, 1024).unwrap().unwrap(), a);
        assert_eq!(Frame::decode(&mut buf, 1024).unwrap().unwrap(), b);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let frame = Frame::request("/big", 3, Bytes::from(vec![0u8; 64]));
        let encoded = frame.encode().unwrap();
        let mut buf = BytesMut::from(&encoded[..]);
        assert!(matches!(
            Frame::decode(&mut buf, 16),
            Err(Error::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_uvarint_roundtrip() {
        let mut buf = BytesMut::new();
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            buf.clear();
            put_uvarint(&mut buf, value);
            let mut read = &buf[..];
            assert_eq!(get_uvarint(&mut read).unwrap(), value);
            assert!(read.is_empty());
        }
    }

    #[test]
    fn test_uvarint_truncated() {
        let mut buf = BytesMut::new();
        put_uvarint(&mut buf, 300);
        let mut read = &buf[..1];
        assert!(get_uvarint(&mut read).is_err());
    }

    #[test]
    fn test_string_roundtrip() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "alice@bob-1");
        let mut read = &buf[..];
        assert_eq!(get_string(&mut read).unwrap(), "alice@bob-1");
    }
}
