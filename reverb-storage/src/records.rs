//! Metadata records written by the apply layer.
//!
//! Plain serde structs; bincode is the storage encoding. The committed
//! cross-node formats live in [`crate::entry`] and [`crate::cmd`], not
//! here.

use reverb_core::{ChannelType, NodeId, Term};
use serde::{Deserialize, Serialize};

/// A registered user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Unique user id.
    pub uid: String,
    /// Unix millis at creation, 0 when unknown.
    pub created_at: u64,
    /// Unix millis at last update, 0 when unknown.
    pub updated_at: u64,
}

/// A device session belonging to a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Owning user id.
    pub uid: String,
    /// Device kind discriminator (app, web, desktop…).
    pub device_flag: u8,
    /// Authority level of the device.
    pub device_level: u8,
    /// Auth token for the device session.
    pub token: String,
    /// Unix millis at creation, 0 when unknown.
    pub created_at: u64,
    /// Unix millis at last update, 0 when unknown.
    pub updated_at: u64,
}

impl Device {
    /// Storage primary id: `"{uid}/{device_flag}"`.
    pub fn primary_id(&self) -> String {
        format!("{}/{}", self.uid, self.device_flag)
    }
}

/// Base info of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Channel id.
    pub channel_id: String,
    /// Channel type.
    pub channel_type: ChannelType,
    /// Whether the channel is banned (all sends rejected).
    pub ban: bool,
    /// Whether the channel is a large channel (fan-out treated lazily).
    pub large: bool,
    /// Whether the channel has been disbanded.
    pub disband: bool,
}

impl ChannelInfo {
    /// A fresh, unrestricted channel.
    pub fn new(channel_id: impl Into<String>, channel_type: ChannelType) -> Self {
        Self {
            channel_id: channel_id.into(),
            channel_type,
            ban: false,
            large: false,
            disband: false,
        }
    }
}

/// Conversation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationType {
    /// Ordinary chat conversation.
    Chat,
    /// Command-channel conversation.
    Cmd,
}

/// A user's read cursor into one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Owning user id.
    pub uid: String,
    /// Channel id.
    pub channel_id: String,
    /// Channel type.
    pub channel_type: ChannelType,
    /// Conversation kind.
    pub conversation_type: ConversationType,
    /// Highest message seq the user has read.
    pub read_to_msg_seq: u64,
}

/// Stream metadata (a long-running message split into chunks).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMeta {
    /// Stream number.
    pub stream_no: String,
    /// Channel the stream belongs to.
    pub channel_id: String,
    /// Channel type.
    pub channel_type: u8,
    /// Sender uid.
    pub from_uid: String,
}

/// One chunk of a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamItem {
    /// Stream number.
    pub stream_no: String,
    /// Chunk sequence within the stream.
    pub seq: u64,
    /// Chunk payload.
    pub payload: Vec<u8>,
}

impl StreamItem {
    /// Storage primary id: `"{stream_no}/{seq:020}"` so chunks sort by seq.
    pub fn primary_id(&self) -> String {
        format!("{}/{:020}", self.stream_no, self.seq)
    }
}

/// Per-channel replication config, arbitrated by the owning slot's log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelClusterConfig {
    /// Channel id.
    pub channel_id: String,
    /// Channel type byte.
    pub channel_type: u8,
    /// Voting replicas hosting the log. Always contains `leader`.
    pub replicas: Vec<NodeId>,
    /// Catching-up replicas, excluded from quorum.
    pub learners: Vec<NodeId>,
    /// Current leader.
    pub leader: NodeId,
    /// Current term; strictly increases on every election.
    pub term: Term,
    /// Source node of an in-progress replica relocation.
    pub migrate_from: NodeId,
    /// Target node of an in-progress replica relocation.
    pub migrate_to: NodeId,
    /// Monotonic config version; bumped on every saved mutation.
    pub conf_version: u64,
    /// Upper bound on `replicas` size.
    pub replica_max_count: u16,
}

impl ChannelClusterConfig {
    /// Whether no config has ever been saved (all-zero record).
    pub fn is_empty(&self) -> bool {
        self.leader.is_none() && self.replicas.is_empty()
    }

    /// Whether `node` is a voting replica.
    pub fn is_replica(&self, node: NodeId) -> bool {
        self.replicas.contains(&node)
    }

    /// Whether `node` is a learner.
    pub fn is_learner(&self, node: NodeId) -> bool {
        self.learners.contains(&node)
    }

    /// Whether a replica relocation is in progress.
    pub fn migrating(&self) -> bool {
        !self.migrate_from.is_none() && !self.migrate_to.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_config_membership() {
        let cfg = ChannelClusterConfig {
            channel_id: "room".into(),
            channel_type: ChannelType::Group.as_u8(),
            replicas: vec![NodeId::new(1), NodeId::new(2)],
            learners: vec![NodeId::new(3)],
            leader: NodeId::new(1),
            term: Term::new(1),
            ..Default::default()
        };
        assert!(!cfg.is_empty());
        assert!(cfg.is_replica(NodeId::new(2)));
        assert!(!cfg.is_replica(NodeId::new(3)));
        assert!(cfg.is_learner(NodeId::new(3)));
        assert!(!cfg.migrating());
    }

    #[test]
    fn test_empty_config() {
        assert!(ChannelClusterConfig::default().is_empty());
    }

    #[test]
    fn test_stream_item_ids_sort_by_seq() {
        let a = StreamItem {
            stream_no: "s1".into(),
            seq: 2,
            ..Default::default()
        };
        let b = StreamItem {
            stream_no: "s1".into(),
            seq: 10,
            ..Default::default()
        };
        assert!(a.primary_id() < b.primary_id());
    }
}
