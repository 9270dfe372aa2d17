//! Cluster-control command envelope.
//!
//! Slot-log entries carry CMDs: a tagged envelope, bit-exact on the wire:
//!
//! ```text
//! +---------------+----------------+------+
//! | cmd_type u16BE| data_len u32BE | data |
//! +---------------+----------------+------+
//! ```
//!
//! Payloads are bincode-encoded records; the envelope, not the payload, is
//! the committed format.

use crate::error::{Result, StorageError};
use crate::records::{
    ChannelClusterConfig, Conversation, Device, StreamItem, StreamMeta, User,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use reverb_core::ChannelType;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Command discriminants. The numeric values are the wire format; never
/// renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CmdType {
    /// Add members to a channel's subscriber set.
    AddSubscribers = 1,
    /// Remove members from a channel's subscriber set.
    RemoveSubscribers = 2,
    /// Clear a channel's subscriber set.
    RemoveAllSubscribers = 3,
    /// Register a user.
    AddUser = 4,
    /// Update a user.
    UpdateUser = 5,
    /// Register a device.
    AddDevice = 6,
    /// Update a device.
    UpdateDevice = 7,
    /// Create channel base info.
    AddChannelInfo = 8,
    /// Update channel base info.
    UpdateChannelInfo = 9,
    /// Delete a channel and its membership sets.
    DeleteChannel = 10,
    /// Add uids to a channel denylist.
    AddDenylist = 11,
    /// Remove uids from a channel denylist.
    RemoveDenylist = 12,
    /// Clear a channel denylist.
    RemoveAllDenylist = 13,
    /// Add uids to a channel allowlist.
    AddAllowlist = 14,
    /// Remove uids from a channel allowlist.
    RemoveAllowlist = 15,
    /// Clear a channel allowlist.
    RemoveAllAllowlist = 16,
    /// Upsert a user's conversations.
    AddOrUpdateConversations = 17,
    /// Delete one conversation of a user.
    DeleteConversation = 18,
    /// Save a channel's cluster config.
    ChannelClusterConfigSave = 19,
    /// Add system uids.
    SystemUidsAdd = 20,
    /// Remove system uids.
    SystemUidsRemove = 21,
    /// Save stream metadata.
    AddStreamMeta = 22,
    /// Append stream chunks.
    AddStreams = 23,
}

impl CmdType {
    /// Convert from the wire discriminant.
    pub fn from_u16(value: u16) -> Result<Self> {
        Ok(match value {
            1 => Self::AddSubscribers,
            2 => Self::RemoveSubscribers,
            3 => Self::RemoveAllSubscribers,
            4 => Self::AddUser,
            5 => Self::UpdateUser,
            6 => Self::AddDevice,
            7 => Self::UpdateDevice,
            8 => Self::AddChannelInfo,
            9 => Self::UpdateChannelInfo,
            10 => Self::DeleteChannel,
            11 => Self::AddDenylist,
            12 => Self::RemoveDenylist,
            13 => Self::RemoveAllDenylist,
            14 => Self::AddAllowlist,
            15 => Self::RemoveAllowlist,
            16 => Self::RemoveAllAllowlist,
            17 => Self::AddOrUpdateConversations,
            18 => Self::DeleteConversation,
            19 => Self::ChannelClusterConfigSave,
            20 => Self::SystemUidsAdd,
            21 => Self::SystemUidsRemove,
            22 => Self::AddStreamMeta,
            23 => Self::AddStreams,
            other => return Err(StorageError::UnknownCmdType(other)),
        })
    }
}

/// Channel plus a uid list; payload of the membership commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelUids {
    /// Channel id.
    pub channel_id: String,
    /// Channel type.
    pub channel_type: ChannelType,
    /// Affected uids.
    pub uids: Vec<String>,
}

/// A bare channel reference; payload of the whole-channel commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    /// Channel id.
    pub channel_id: String,
    /// Channel type.
    pub channel_type: ChannelType,
}

/// A user's conversation upserts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSet {
    /// Owning uid.
    pub uid: String,
    /// Conversations to upsert.
    pub conversations: Vec<Conversation>,
}

/// Deletion of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRef {
    /// Owning uid.
    pub uid: String,
    /// Channel id.
    pub channel_id: String,
    /// Channel type.
    pub channel_type: ChannelType,
}

/// A plain uid list; payload of the system-uid commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Uids {
    /// Affected uids.
    pub uids: Vec<String>,
}

/// One decoded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    /// Command discriminant.
    pub cmd_type: CmdType,
    /// Bincode payload.
    pub data: Bytes,
}

fn to_bincode<T: Serialize>(value: &T) -> Result<Bytes> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

impl Cmd {
    /// Build a command with an already-encoded payload.
    pub fn new(cmd_type: CmdType, data: Bytes) -> Self {
        Self { cmd_type, data }
    }

    /// Build a command by bincode-encoding `payload`.
    pub fn encode_payload<T: Serialize>(cmd_type: CmdType, payload: &T) -> Result<Self> {
        Ok(Self::new(cmd_type, to_bincode(payload)?))
    }

    /// Decode the payload as `T`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        bincode::deserialize(&self.data).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Encode the wire envelope.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + 4 + self.data.len());
        buf.put_u16(self.cmd_type as u16);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Decode the wire envelope.
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.remaining() < 6 {
            return Err(StorageError::Serialization(format!(
                "cmd envelope truncated: {} bytes",
                buf.remaining()
            )));
        }
        let cmd_type = CmdType::from_u16(buf.get_u16())?;
        let data_len = buf.get_u32() as usize;
        if buf.remaining() < data_len {
            return Err(StorageError::Serialization(format!(
                "cmd data truncated: want {}, have {}",
                data_len,
                buf.remaining()
            )));
        }
        let data = buf.copy_to_bytes(data_len);
        Ok(Self { cmd_type, data })
    }

    /// Membership command over a channel's subscriber/denylist/allowlist.
    pub fn channel_uids(cmd_type: CmdType, channel_id: &str, channel_type: ChannelType, uids: Vec<String>) -> Result<Self> {
        Self::encode_payload(
            cmd_type,
            &ChannelUids {
                channel_id: channel_id.to_string(),
                channel_type,
                uids,
            },
        )
    }

    /// Whole-channel command (delete, clear-list).
    pub fn channel_ref(cmd_type: CmdType, channel_id: &str, channel_type: ChannelType) -> Result<Self> {
        Self::encode_payload(
            cmd_type,
            &ChannelRef {
                channel_id: channel_id.to_string(),
                channel_type,
            },
        )
    }

    /// `AddUser` / `UpdateUser`.
    pub fn user(cmd_type: CmdType, user: &User) -> Result<Self> {
        Self::encode_payload(cmd_type, user)
    }

    /// `AddDevice` / `UpdateDevice`.
    pub fn device(cmd_type: CmdType, device: &Device) -> Result<Self> {
        Self::encode_payload(cmd_type, device)
    }

    /// `AddChannelInfo` / `UpdateChannelInfo`.
    pub fn channel_info(cmd_type: CmdType, info: &crate::records::ChannelInfo) -> Result<Self> {
        Self::encode_payload(cmd_type, info)
    }

    /// `AddOrUpdateConversations`.
    pub fn conversations(uid: &str, conversations: Vec<Conversation>) -> Result<Self> {
        Self::encode_payload(
            CmdType::AddOrUpdateConversations,
            &ConversationSet {
                uid: uid.to_string(),
                conversations,
            },
        )
    }

    /// `DeleteConversation`.
    pub fn delete_conversation(uid: &str, channel_id: &str, channel_type: ChannelType) -> Result<Self> {
        Self::encode_payload(
            CmdType::DeleteConversation,
            &ConversationRef {
                uid: uid.to_string(),
                channel_id: channel_id.to_string(),
                channel_type,
            },
        )
    }

    /// `ChannelClusterConfigSave`.
    pub fn channel_cluster_config_save(config: &ChannelClusterConfig) -> Result<Self> {
        Self::encode_payload(CmdType::ChannelClusterConfigSave, config)
    }

    /// `SystemUidsAdd` / `SystemUidsRemove`.
    pub fn system_uids(cmd_type: CmdType, uids: Vec<String>) -> Result<Self> {
        Self::encode_payload(cmd_type, &Uids { uids })
    }

    /// `AddStreamMeta`.
    pub fn stream_meta(meta: &StreamMeta) -> Result<Self> {
        Self::encode_payload(CmdType::AddStreamMeta, meta)
    }

    /// `AddStreams`.
    pub fn streams(items: &Vec<StreamItem>) -> Result<Self> {
        Self::encode_payload(CmdType::AddStreams, items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_layout_is_pinned() {
        let cmd = Cmd::new(CmdType::DeleteChannel, Bytes::from_static(b"xy"));
        let encoded = cmd.encode();
        assert_eq!(
            &encoded[..],
            &[0, 10, /* cmd type */ 0, 0, 0, 2, /* len */ b'x', b'y']
        );
    }

    #[test]
    fn test_envelope_roundtrip() {
        let cmd = Cmd::channel_uids(
            CmdType::AddSubscribers,
            "room",
            ChannelType::Group,
            vec!["alice".into(), "bob".into()],
        )
        .unwrap();
        let decoded = Cmd::decode(cmd.encode()).unwrap();
        assert_eq!(decoded, cmd);
        let payload: ChannelUids = decoded.decode_payload().unwrap();
        assert_eq!(payload.uids, vec!["alice", "bob"]);
    }

    #[test]
    fn test_unknown_cmd_type_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(999);
        buf.put_u32(0);
        assert!(matches!(
            Cmd::decode(buf.freeze()),
            Err(StorageError::UnknownCmdType(999))
        ));
    }

    #[test]
    fn test_truncated_envelope_rejected() {
        let cmd = Cmd::new(CmdType::AddUser, Bytes::from_static(b"abcd"));
        let encoded = cmd.encode();
        assert!(Cmd::decode(encoded.slice(0..encoded.len() - 1)).is_err());
        assert!(Cmd::decode(encoded.slice(0..3)).is_err());
    }

    #[test]
    fn test_every_cmd_type_roundtrips() {
        for value in 1u16..=23 {
            let ty = CmdType::from_u16(value).unwrap();
            assert_eq!(ty as u16, value);
        }
    }
}
