//! Wire encoding for step messages.
//!
//! Sync, heartbeat, and vote messages travel between nodes wrapped in a
//! step envelope naming the handler they target. Fixed fields are
//! big-endian; the config (present only on local kinds, which never cross
//! the wire, but encoded for completeness) rides as a bincode blob; log
//! entries use the committed batch format.

use super::{Message, MessageKind, ReplicaConfig};
use crate::error::{ClusterError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use reverb_core::frame::{get_string, put_string};
use reverb_core::{NodeId, Term};
use reverb_storage::LogEntry;

/// A step message addressed to one handler, as carried in a frame payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StepEnvelope {
    /// Target handler key.
    pub handler_key: String,
    /// The step message.
    pub message: Message,
}

impl StepEnvelope {
    /// Encode to a frame payload.
    pub fn encode(&self) -> Result<Bytes> {
        let msg = &self.message;
        let config_blob = match &msg.config {
            Some(config) => bincode::serialize(config).map_err(|e| {
                ClusterError::Storage(reverb_storage::StorageError::Serialization(e.to_string()))
            })?,
            None => Vec::new(),
        };
        let logs = LogEntry::encode_batch(&msg.logs);

        let mut buf = BytesMut::with_capacity(64 + self.handler_key.len() + config_blob.len() + logs.len());
        put_string(&mut buf, &self.handler_key);
        buf.put_u8(msg.kind as u8);
        buf.put_u64(msg.from.value());
        buf.put_u64(msg.to.value());
        buf.put_u32(msg.term.value());
        buf.put_u32(msg.log_term.value());
        buf.put_u64(msg.index);
        buf.put_u64(msg.committed_index);
        buf.put_u64(msg.applied_size);
        buf.put_u64(msg.transition_peer.value());
        buf.put_u8(u8::from(msg.reject));
        buf.put_u32(config_blob.len() as u32);
        buf.put_slice(&config_blob);
        buf.put_u32(logs.len() as u32);
        buf.put_slice(&logs);
        Ok(buf.freeze())
    }

    /// Decode from a frame payload.
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let handler_key = get_string(&mut buf)?;
        let fixed = 1 + 8 + 8 + 4 + 4 + 8 + 8 + 8 + 8 + 1 + 4;
        if buf.remaining() < fixed {
            return Err(reverb_core::Error::Decode(format!(
                "step envelope truncated: {} bytes",
                buf.remaining()
            ))
            .into());
        }
        let kind_byte = buf.get_u8();
        let kind = MessageKind::from_u8(kind_byte).ok_or_else(|| {
            ClusterError::Core(reverb_core::Error::Decode(format!(
                "unknown message kind {}",
                kind_byte
            )))
        })?;
        let mut message = Message::new(kind);
        message.from = NodeId::new(buf.get_u64());
        message.to = NodeId::new(buf.get_u64());
        message.term = Term::new(buf.get_u32());
        message.log_term = Term::new(buf.get_u32());
        message.index = buf.get_u64();
        message.committed_index = buf.get_u64();
        message.applied_size = buf.get_u64();
        message.transition_peer = NodeId::new(buf.get_u64());
        message.reject = buf.get_u8() != 0;

        let config_len = buf.get_u32() as usize;
        if buf.remaining() < config_len {
            return Err(reverb_core::Error::Decode("config blob truncated".into()).into());
        }
        if config_len > 0 {
            let blob = buf.copy_to_bytes(config_len);
            let config: ReplicaConfig = bincode::deserialize(&blob).map_err(|e| {
                ClusterError::Storage(reverb_storage::StorageError::Serialization(e.to_string()))
            })?;
            message.config = Some(config);
        }

        if buf.remaining() < 4 {
            return Err(reverb_core::Error::Decode("log batch length truncated".into()).into());
        }
        let logs_len = buf.get_u32() as usize;
        if buf.remaining() < logs_len {
            return Err(reverb_core::Error::Decode("log batch truncated".into()).into());
        }
        let logs_blob = buf.copy_to_bytes(logs_len);
        message.logs = LogEntry::decode_batch(logs_blob).map_err(ClusterError::Storage)?;

        Ok(Self {
            handler_key,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let mut message = Message::new(MessageKind::SyncGetResp);
        message.from = NodeId::new(1);
        message.to = NodeId::new(2);
        message.term = Term::new(3);
        message.index = 7;
        message.committed_index = 6;
        message.logs = vec![
            LogEntry::new(7, Term::new(3), Bytes::from_static(b"payload")),
            LogEntry::new(8, Term::new(3), Bytes::new()),
        ];
        let envelope = StepEnvelope {
            handler_key: "alice@bob-1".into(),
            message,
        };
        let decoded = StepEnvelope::decode(envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_envelope_with_config_roundtrip() {
        let mut message = Message::new(MessageKind::InitResp);
        message.config = Some(ReplicaConfig {
            replicas: vec![NodeId::new(1), NodeId::new(2)],
            leader: NodeId::new(1),
            term: Term::new(4),
            version: 9,
            ..Default::default()
        });
        let envelope = StepEnvelope {
            handler_key: "slot-3".into(),
            message,
        };
        let decoded = StepEnvelope::decode(envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_truncated_envelope_rejected() {
        let mut message = Message::new(MessageKind::Ping);
        message.to = NodeId::new(2);
        let envelope = StepEnvelope {
            handler_key: "k".into(),
            message,
        };
        let encoded = envelope.encode().unwrap();
        assert!(StepEnvelope::decode(encoded.slice(0..encoded.len() - 3)).is_err());
    }
}
