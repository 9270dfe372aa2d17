//! Replicated log entries and their encodings.
//!
//! Wire layout, bit-exact:
//!
//! ```text
//! +-------------+------------+----------------+------+
//! | index u64BE | term u32BE | data_len u32BE | data |
//! +-------------+------------+----------------+------+
//! ```
//!
//! The persisted record prepends a CRC32 of the wire body, verified on
//! every read.

use crate::error::{Result, StorageError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use reverb_core::{LogIndex, Term};

/// Wire header size: index + term + data length.
const ENTRY_HEADER: usize = 8 + 4 + 4;

/// One replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Contiguous from 1 within a handler's log.
    pub index: LogIndex,
    /// Term under which the entry was proposed.
    pub term: Term,
    /// Opaque payload; the apply layer interprets it.
    pub data: Bytes,
}

impl LogEntry {
    /// Create an entry.
    pub fn new(index: LogIndex, term: Term, data: Bytes) -> Self {
        Self { index, term, data }
    }

    /// Size of the wire encoding.
    pub fn wire_size(&self) -> usize {
        ENTRY_HEADER + self.data.len()
    }

    /// Append the wire encoding to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.index);
        buf.put_u32(self.term.value());
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
    }

    /// Decode one entry from the front of `buf`.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < ENTRY_HEADER {
            return Err(StorageError::Corruption {
                key: String::new(),
                index: 0,
                details: format!("entry header truncated: {} bytes", buf.remaining()),
            });
        }
        let index = buf.get_u64();
        let term = Term::new(buf.get_u32());
        let data_len = buf.get_u32() as usize;
        if buf.remaining() < data_len {
            return Err(StorageError::Corruption {
                key: String::new(),
                index,
                details: format!(
                    "entry data truncated: want {}, have {}",
                    data_len,
                    buf.remaining()
                ),
            });
        }
        let data = buf.copy_to_bytes(data_len);
        Ok(Self { index, term, data })
    }

    /// Encode a batch back-to-back, the `/…/log/sync` body format.
    pub fn encode_batch(entries: &[LogEntry]) -> Bytes {
        let total: usize = entries.iter().map(LogEntry::wire_size).sum();
        let mut buf = BytesMut::with_capacity(total);
        for entry in entries {
            entry.encode(&mut buf);
        }
        buf.freeze()
    }

    /// Decode a back-to-back batch until the buffer is exhausted.
    pub fn decode_batch(mut buf: impl Buf) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        while buf.has_remaining() {
            entries.push(Self::decode(&mut buf)?);
        }
        Ok(entries)
    }

    /// Encode the persisted record: CRC32 of the wire body, then the body.
    pub fn encode_record(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(self.wire_size());
        self.encode(&mut body);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();
        let mut record = BytesMut::with_capacity(4 + body.len());
        record.put_u32(crc);
        record.put_slice(&body);
        record.freeze()
    }

    /// Decode and verify a persisted record.
    pub fn decode_record(key: &str, mut record: Bytes) -> Result<Self> {
        if record.len() < 4 {
            return Err(StorageError::Corruption {
                key: key.to_string(),
                index: 0,
                details: "record shorter than checksum".into(),
            });
        }
        let stored_crc = record.get_u32();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&record);
        if hasher.finalize() != stored_crc {
            return Err(StorageError::Corruption {
                key: key.to_string(),
                index: 0,
                details: "checksum mismatch".into(),
            });
        }
        let entry = Self::decode(&mut record)?;
        Ok(entry)
    }
}
