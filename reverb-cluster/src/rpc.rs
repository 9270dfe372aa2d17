//! RPC request/response bodies.
//!
//! The `/channel/leaderTermStartIndex` body is a committed varint format;
//! the remaining bodies are internal and ride bincode.

use crate::error::{ClusterError, Result};
use bytes::{Buf, Bytes, BytesMut};
use reverb_core::frame::{get_string, get_uvarint, put_string, put_uvarint};
use reverb_core::{ChannelType, LogIndex, NodeId, Term};
use reverb_storage::MessageLogStore;
use serde::{Deserialize, Serialize};

/// Body of `/channel/leaderTermStartIndex`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderTermStartIndexReq {
    /// Handler whose term map is being consulted.
    pub handler_key: String,
    /// The leader being asked.
    pub leader_id: NodeId,
    /// The follower's last local leader term.
    pub term: Term,
}

impl LeaderTermStartIndexReq {
    /// Encode the varint body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + self.handler_key.len());
        put_string(&mut buf, &self.handler_key);
        put_uvarint(&mut buf, self.leader_id.value());
        put_uvarint(&mut buf, u64::from(self.term.value()));
        buf.freeze()
    }

    /// Decode the varint body.
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let handler_key = get_string(&mut buf)?;
        let leader_id = NodeId::new(get_uvarint(&mut buf)?);
        let term = Term::new(get_uvarint(&mut buf)? as u32);
        Ok(Self {
            handler_key,
            leader_id,
            term,
        })
    }
}

/// Serve a term-start-index lookup against the local log store.
///
/// When the asked term equals this node's latest leader term the answer is
/// the current last index; otherwise it is the first index of the next
/// term, 0 when unknown.
pub fn serve_leader_term_start_index(
    store: &MessageLogStore,
    handler_key: &str,
    term: Term,
) -> LogIndex {
    let my_last_term = store.leader_last_term(handler_key);
    if term == my_last_term {
        store.last_index(handler_key)
    } else {
        store.leader_term_start_index(handler_key, term.next())
    }
}

/// Encode the 8-byte big-endian index response.
pub fn encode_index_response(index: LogIndex) -> Bytes {
    Bytes::copy_from_slice(&index.to_be_bytes())
}

/// Decode the 8-byte big-endian index response; 0 when the body is empty.
pub fn decode_index_response(buf: &Bytes) -> Result<LogIndex> {
    if buf.is_empty() {
        return Ok(0);
    }
    if buf.remaining() < 8 {
        return Err(ClusterError::Core(reverb_core::Error::Decode(
            "index response shorter than 8 bytes".into(),
        )));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    Ok(LogIndex::from_be_bytes(bytes))
}

/// Body of `/channel/clusterconfig`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfigReq {
    /// Channel id.
    pub channel_id: String,
    /// Channel type.
    pub channel_type: ChannelType,
}

/// Bincode-encode an internal body.
pub fn encode_bincode<T: Serialize>(value: &T) -> Result<Bytes> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|e| ClusterError::Storage(reverb_storage::StorageError::Serialization(e.to_string())))
}

/// Bincode-decode an internal body.
pub fn decode_bincode<T: for<'de> Deserialize<'de>>(buf: &Bytes) -> Result<T> {
    bincode::deserialize(buf)
        .map_err(|e| ClusterError::Storage(reverb_storage::StorageError::Serialization(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverb_storage::Kv;

    #[test]
    fn test_term_index_req_roundtrip() {
        let req = LeaderTermStartIndexReq {
            handler_key: "alice@bob-1".into(),
            leader_id: NodeId::new(3),
            term: Term::new(7),
        };
        let decoded = LeaderTermStartIndexReq::decode(req.encode()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_index_response_roundtrip() {
        assert_eq!(decode_index_response(&encode_index_response(42)).unwrap(), 42);
        assert_eq!(decode_index_response(&Bytes::new()).unwrap(), 0);
    }

    #[test]
    fn test_serve_term_start_index() {
        let store = MessageLogStore::new(Kv::open());
        store.set_leader_term_start_index("ch", Term::new(1), 1);
        store.set_leader_term_start_index("ch", Term::new(3), 8);
        store
            .append_logs(
                "ch",
                &(1..=9)
                    .map(|i| {
                        let term = if i < 8 { 1 } else { 3 };
                        reverb_storage::LogEntry::new(i, Term::new(term), Bytes::new())
                    })
                    .collect::<Vec<_>>(),
            )
            .unwrap();

        // Matching latest term: answer is the last index.
        assert_eq!(serve_leader_term_start_index(&store, "ch", Term::new(3)), 9);
        // Older term: answer is the start of the next term.
        assert_eq!(serve_leader_term_start_index(&store, "ch", Term::new(2)), 8);
        // Unknown next term: 0.
        assert_eq!(serve_leader_term_start_index(&store, "ch", Term::new(5)), 0);
    }
}
