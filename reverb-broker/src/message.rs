//! In-flight publishes and message-id generation.

use bytes::Bytes;
use reverb_core::{ChannelType, MessageId, NodeId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// One publish moving through a channel's pipeline.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    /// Ingress-assigned id; carries connection-receive order and dedups
    /// re-proposals after leader change.
    pub message_id: MessageId,
    /// Queue index, assigned on enqueue. 0 until then.
    pub index: u64,
    /// Sending user.
    pub from_uid: String,
    /// Node the sender's connection lives on.
    pub from_node: NodeId,
    /// Target channel id.
    pub channel_id: String,
    /// Target channel type.
    pub channel_type: ChannelType,
    /// Message payload; ciphertext until the decrypt stage clears
    /// `is_encrypt`.
    pub payload: Bytes,
    /// Whether `payload` still needs decryption.
    pub is_encrypt: bool,
    /// Set when a stage rejected the message; later stages skip it.
    pub dropped: bool,
}

impl ChannelMessage {
    /// Payload size used for stage byte budgets.
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// The durable form of a message, the channel-log entry payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Ingress-assigned id.
    pub message_id: MessageId,
    /// Sending user.
    pub from_uid: String,
    /// Target channel id.
    pub channel_id: String,
    /// Target channel type.
    pub channel_type: ChannelType,
    /// Decrypted payload.
    pub payload: Vec<u8>,
}

impl StoredMessage {
    /// Build from a pipeline message (payload must be decrypted).
    pub fn from_channel_message(msg: &ChannelMessage) -> Self {
        Self {
            message_id: msg.message_id,
            from_uid: msg.from_uid.clone(),
            channel_id: msg.channel_id.clone(),
            channel_type: msg.channel_type,
            payload: msg.payload.to_vec(),
        }
    }
}

/// Forward batch body (`/channel/proposeForward`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardBatch {
    /// Target channel id.
    pub channel_id: String,
    /// Target channel type.
    pub channel_type: ChannelType,
    /// Decrypted messages in queue order.
    pub messages: Vec<StoredMessage>,
    /// Forwarding node.
    pub from_node: NodeId,
}

/// Delivery batch body (`/channel/deliver`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverBatch {
    /// Source channel id.
    pub channel_id: String,
    /// Source channel type.
    pub channel_type: ChannelType,
    /// Recipients homed on the receiving node.
    pub uids: Vec<String>,
    /// Messages to deliver.
    pub messages: Vec<StoredMessage>,
}

/// Node-seeded message-id generator: millisecond timestamp, node bits,
/// and a per-millisecond sequence, so ids are unique across the cluster
/// and ordered within a connection.
#[derive(Debug)]
pub struct MessageIdGenerator {
    node_bits: u64,
    state: AtomicU64,
}

/// Bits reserved for the per-millisecond sequence.
const SEQ_BITS: u64 = 12;
/// Bits reserved for the node id.
const NODE_BITS: u64 = 10;

impl MessageIdGenerator {
    /// Create a generator for `node`.
    pub fn new(node: NodeId) -> Self {
        Self {
            node_bits: (node.value() & ((1 << NODE_BITS) - 1)) << SEQ_BITS,
            state: AtomicU64::new(0),
        }
    }

    /// Next unique id.
    pub fn next_id(&self) -> MessageId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let candidate = (now_ms << (SEQ_BITS + NODE_BITS)) | self.node_bits;
        loop {
            let prev = self.state.load(Ordering::Relaxed);
            // Same millisecond (or clock step back): take the next
            // sequence slot instead of the timestamp slot.
            let next = if candidate > prev { candidate } else { prev + 1 };
            if self
                .state
                .compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let generator = MessageIdGenerator::new(NodeId::new(3));
        let mut prev = 0;
        for _ in 0..10_000 {
            let id = generator.next_id();
            assert!(id > prev);
            prev = id;
        }
    }

    #[test]
    fn test_ids_embed_node_bits() {
        let a = MessageIdGenerator::new(NodeId::new(1)).next_id();
        let b = MessageIdGenerator::new(NodeId::new(2)).next_id();
        assert_ne!(
            (a >> SEQ_BITS) & ((1 << NODE_BITS) - 1),
            (b >> SEQ_BITS) & ((1 << NODE_BITS) - 1)
        );
    }

    #[test]
    fn test_stored_message_roundtrip() {
        let stored = StoredMessage {
            message_id: 9,
            from_uid: "alice".into(),
            channel_id: "room".into(),
            channel_type: ChannelType::Group,
            payload: b"hello".to_vec(),
        };
        let encoded = bincode::serialize(&stored).unwrap();
        let decoded: StoredMessage = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, stored);
    }
}
