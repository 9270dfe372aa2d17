//! Metadata apply layer.
//!
//! Committed slot-log entries carry [`Cmd`] envelopes; this module executes
//! them against the metadata column family and exposes the read side used
//! by permission checks, tag building, and config resolution. Re-applying
//! an already-applied entry is a no-op by construction: every command is an
//! absolute write (put / delete / set-member), never an increment.

use crate::cmd::{ChannelRef, ChannelUids, Cmd, CmdType, ConversationRef, ConversationSet, Uids};
use crate::entry::LogEntry;
use crate::error::{Result, StorageError};
use crate::keys::{self, Column, Table};
use crate::kv::{ColumnFamily, Kv};
use crate::records::{
    ChannelClusterConfig, ChannelInfo, Conversation, Device, StreamItem, StreamMeta, User,
};
use bytes::Bytes;
use reverb_core::{channel_key, ChannelType};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};

/// Primary id of the singleton system-uid set.
const SYSTEM_UIDS_PRIMARY: &str = "system";

/// Shared handle to the metadata store.
#[derive(Debug, Clone)]
pub struct MetaStore {
    kv: Kv,
}

impl MetaStore {
    /// Create a store over the given engine.
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    fn put_record<T: Serialize>(&self, table: Table, primary: &str, record: &T) -> Result<()> {
        let body = bincode::serialize(record)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.kv.put(
            ColumnFamily::Meta,
            keys::row_key(table, primary, Column::Body),
            Bytes::from(body),
        );
        Ok(())
    }

    fn get_record<T: DeserializeOwned>(&self, table: Table, primary: &str) -> Result<Option<T>> {
        let Some(body) = self
            .kv
            .get(ColumnFamily::Meta, &keys::row_key(table, primary, Column::Body))
        else {
            return Ok(None);
        };
        let record = bincode::deserialize(&body)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(Some(record))
    }

    fn add_members(&self, table: Table, primary: &str, uids: &[String]) {
        for uid in uids {
            self.kv
                .put(ColumnFamily::Meta, keys::member_key(table, primary, uid), Bytes::new());
        }
    }

    fn remove_members(&self, table: Table, primary: &str, uids: &[String]) {
        for uid in uids {
            self.kv
                .delete(ColumnFamily::Meta, &keys::member_key(table, primary, uid));
        }
    }

    fn clear_members(&self, table: Table, primary: &str) {
        let (start, end) = keys::member_range(table, primary);
        self.kv.delete_range(ColumnFamily::Meta, &start, &end);
    }

    fn members(&self, table: Table, primary: &str) -> Vec<String> {
        let (start, end) = keys::member_range(table, primary);
        self.kv
            .scan(ColumnFamily::Meta, &start, &end)
            .into_iter()
            .filter_map(|(k, _)| keys::member_from_key(&k, primary.len()))
            .collect()
    }

    fn is_member(&self, table: Table, primary: &str, uid: &str) -> bool {
        self.kv
            .get(ColumnFamily::Meta, &keys::member_key(table, primary, uid))
            .is_some()
    }

    fn has_members(&self, table: Table, primary: &str) -> bool {
        let (start, end) = keys::member_range(table, primary);
        !self.kv.scan(ColumnFamily::Meta, &start, &end).is_empty()
    }

    // ---- subscribers ----

    /// All subscribers of a channel.
    pub fn subscribers(&self, channel_id: &str, channel_type: ChannelType) -> Vec<String> {
        self.members(Table::Subscriber, &channel_key(channel_id, channel_type))
    }

    /// Whether `uid` subscribes to the channel.
    pub fn is_subscriber(&self, channel_id: &str, channel_type: ChannelType, uid: &str) -> bool {
        self.is_member(Table::Subscriber, &channel_key(channel_id, channel_type), uid)
    }

    // ---- deny / allow lists ----

    /// Whether `uid` is denylisted on the channel.
    pub fn is_denied(&self, channel_id: &str, channel_type: ChannelType, uid: &str) -> bool {
        self.is_member(Table::Denylist, &channel_key(channel_id, channel_type), uid)
    }

    /// Whether the channel maintains a non-empty allowlist.
    pub fn has_allowlist(&self, channel_id: &str, channel_type: ChannelType) -> bool {
        self.has_members(Table::Allowlist, &channel_key(channel_id, channel_type))
    }

    /// Whether `uid` is on the channel allowlist.
    pub fn is_allowed(&self, channel_id: &str, channel_type: ChannelType, uid: &str) -> bool {
        self.is_member(Table::Allowlist, &channel_key(channel_id, channel_type), uid)
    }

    // ---- users / devices ----

    /// Look up a user.
    pub fn user(&self, uid: &str) -> Result<Option<User>> {
        self.get_record(Table::User, uid)
    }

    /// Look up a device.
    pub fn device(&self, uid: &str, device_flag: u8) -> Result<Option<Device>> {
        self.get_record(Table::Device, &format!("{}/{}", uid, device_flag))
    }

    // ---- channels ----

    /// Look up channel base info.
    pub fn channel_info(&self, channel_id: &str, channel_type: ChannelType) -> Result<Option<ChannelInfo>> {
        self.get_record(Table::ChannelInfo, &channel_key(channel_id, channel_type))
    }

    // ---- conversations ----

    /// All conversations of a user.
    pub fn conversations(&self, uid: &str) -> Result<Vec<Conversation>> {
        let (start, end) = keys::member_range(Table::Conversation, uid);
        self.kv
            .scan(ColumnFamily::Meta, &start, &end)
            .into_iter()
            .map(|(_, body)| {
                bincode::deserialize(&body).map_err(|e| StorageError::Serialization(e.to_string()))
            })
            .collect()
    }

    // ---- cluster config ----

    /// Persist a channel's cluster config.
    pub fn save_channel_cluster_config(&self, config: &ChannelClusterConfig) -> Result<()> {
        let ty = ChannelType::from_u8(config.channel_type).ok_or_else(|| {
            StorageError::Serialization(format!("bad channel type {}", config.channel_type))
        })?;
        self.put_record(
            Table::ChannelClusterConfig,
            &channel_key(&config.channel_id, ty),
            config,
        )
    }

    /// Look up a channel's cluster config.
    pub fn channel_cluster_config(
        &self,
        channel_id: &str,
        channel_type: ChannelType,
    ) -> Result<Option<ChannelClusterConfig>> {
        self.get_record(Table::ChannelClusterConfig, &channel_key(channel_id, channel_type))
    }

    // ---- system uids ----

    /// Whether `uid` is a system uid (bypasses permission checks).
    pub fn is_system_uid(&self, uid: &str) -> bool {
        self.is_member(Table::SystemUid, SYSTEM_UIDS_PRIMARY, uid)
    }

    // ---- streams ----

    /// Look up stream metadata.
    pub fn stream_meta(&self, stream_no: &str) -> Result<Option<StreamMeta>> {
        self.get_record(Table::StreamMeta, stream_no)
    }

    /// All chunks of a stream, ordered by seq.
    pub fn stream_items(&self, stream_no: &str) -> Result<Vec<StreamItem>> {
        let (start, end) = keys::member_range(Table::Stream, stream_no);
        self.kv
            .scan(ColumnFamily::Meta, &start, &end)
            .into_iter()
            .map(|(_, body)| {
                bincode::deserialize(&body).map_err(|e| StorageError::Serialization(e.to_string()))
            })
            .collect()
    }

    // ---- apply ----

    /// Apply a batch of committed slot-log entries. Returns the applied
    /// byte count reported back to the replica for flow control.
    pub fn apply_slot_logs(&self, handler_key: &str, entries: &[LogEntry]) -> Result<u64> {
        let mut applied: u64 = 0;
        for entry in entries {
            let cmd = Cmd::decode(entry.data.clone()).map_err(|e| {
                error!(key = %handler_key, index = entry.index, error = %e, "undecodable cmd in slot log");
                e
            })?;
            self.exec_cmd(&cmd)?;
            applied += entry.wire_size() as u64;
            debug!(key = %handler_key, index = entry.index, cmd = ?cmd.cmd_type, "applied");
        }
        Ok(applied)
    }

    /// Execute one command against the metadata columns.
    pub fn exec_cmd(&self, cmd: &Cmd) -> Result<()> {
        match cmd.cmd_type {
            CmdType::AddSubscribers => {
                let p: ChannelUids = cmd.decode_payload()?;
                self.add_members(Table::Subscriber, &channel_key(&p.channel_id, p.channel_type), &p.uids);
            }
            CmdType::RemoveSubscribers => {
                let p: ChannelUids = cmd.decode_payload()?;
                self.remove_members(Table::Subscriber, &channel_key(&p.channel_id, p.channel_type), &p.uids);
            }
            CmdType::RemoveAllSubscribers => {
                let p: ChannelRef = cmd.decode_payload()?;
                self.clear_members(Table::Subscriber, &channel_key(&p.channel_id, p.channel_type));
            }
            CmdType::AddUser | CmdType::UpdateUser => {
                let user: User = cmd.decode_payload()?;
                self.put_record(Table::User, &user.uid.clone(), &user)?;
            }
            CmdType::AddDevice | CmdType::UpdateDevice => {
                let device: Device = cmd.decode_payload()?;
                self.put_record(Table::Device, &device.primary_id(), &device)?;
            }
            CmdType::AddChannelInfo | CmdType::UpdateChannelInfo => {
                let info: ChannelInfo = cmd.decode_payload()?;
                self.put_record(Table::ChannelInfo, &channel_key(&info.channel_id, info.channel_type), &info)?;
            }
            CmdType::DeleteChannel => {
                let p: ChannelRef = cmd.decode_payload()?;
                let key = channel_key(&p.channel_id, p.channel_type);
                self.kv
                    .delete(ColumnFamily::Meta, &keys::row_key(Table::ChannelInfo, &key, Column::Body));
                self.clear_members(Table::Subscriber, &key);
                self.clear_members(Table::Denylist, &key);
                self.clear_members(Table::Allowlist, &key);
            }
            CmdType::AddDenylist => {
                let p: ChannelUids = cmd.decode_payload()?;
                self.add_members(Table::Denylist, &channel_key(&p.channel_id, p.channel_type), &p.uids);
            }
            CmdType::RemoveDenylist => {
                let p: ChannelUids = cmd.decode_payload()?;
                self.remove_members(Table::Denylist, &channel_key(&p.channel_id, p.channel_type), &p.uids);
            }
            CmdType::RemoveAllDenylist => {
                let p: ChannelRef = cmd.decode_payload()?;
                self.clear_members(Table::Denylist, &channel_key(&p.channel_id, p.channel_type));
            }
            CmdType::AddAllowlist => {
                let p: ChannelUids = cmd.decode_payload()?;
                self.add_members(Table::Allowlist, &channel_key(&p.channel_id, p.channel_type), &p.uids);
            }
            CmdType::RemoveAllowlist => {
                let p: ChannelUids = cmd.decode_payload()?;
                self.remove_members(Table::Allowlist, &channel_key(&p.channel_id, p.channel_type), &p.uids);
            }
            CmdType::RemoveAllAllowlist => {
                let p: ChannelRef = cmd.decode_payload()?;
                self.clear_members(Table::Allowlist, &channel_key(&p.channel_id, p.channel_type));
            }
            CmdType::AddOrUpdateConversations => {
                let p: ConversationSet = cmd.decode_payload()?;
                for conversation in &p.conversations {
                    let member = channel_key(&conversation.channel_id, conversation.channel_type);
                    let body = bincode::serialize(conversation)
                        .map_err(|e| StorageError::Serialization(e.to_string()))?;
                    self.kv.put(
                        ColumnFamily::Meta,
                        keys::member_key(Table::Conversation, &p.uid, &member),
                        Bytes::from(body),
                    );
                }
            }
            CmdType::DeleteConversation => {
                let p: ConversationRef = cmd.decode_payload()?;
                let member = channel_key(&p.channel_id, p.channel_type);
                self.kv
                    .delete(ColumnFamily::Meta, &keys::member_key(Table::Conversation, &p.uid, &member));
            }
            CmdType::ChannelClusterConfigSave => {
                let config: ChannelClusterConfig = cmd.decode_payload()?;
                self.save_channel_cluster_config(&config)?;
            }
            CmdType::SystemUidsAdd => {
                let p: Uids = cmd.decode_payload()?;
                self.add_members(Table::SystemUid, SYSTEM_UIDS_PRIMARY, &p.uids);
            }
            CmdType::SystemUidsRemove => {
                let p: Uids = cmd.decode_payload()?;
                self.remove_members(Table::SystemUid, SYSTEM_UIDS_PRIMARY, &p.uids);
            }
            CmdType::AddStreamMeta => {
                let meta: StreamMeta = cmd.decode_payload()?;
                self.put_record(Table::StreamMeta, &meta.stream_no.clone(), &meta)?;
            }
            CmdType::AddStreams => {
                let items: Vec<StreamItem> = cmd.decode_payload()?;
                for item in &items {
                    let body = bincode::serialize(item)
                        .map_err(|e| StorageError::Serialization(e.to_string()))?;
                    self.kv.put(
                        ColumnFamily::Meta,
                        keys::member_key(Table::Stream, &item.stream_no, &format!("{:020}", item.seq)),
                        Bytes::from(body),
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverb_core::{NodeId, Term};

    fn store() -> MetaStore {
        MetaStore::new(Kv::open())
    }

    #[test]
    fn test_subscriber_commands() {
        let store = store();
        let cmd = Cmd::channel_uids(
            CmdType::AddSubscribers,
            "room",
            ChannelType::Group,
            vec!["alice".into(), "bob".into()],
        )
        .unwrap();
        store.exec_cmd(&cmd).unwrap();

        let mut subs = store.subscribers("room", ChannelType::Group);
        subs.sort();
        assert_eq!(subs, vec!["alice", "bob"]);
        assert!(store.is_subscriber("room", ChannelType::Group, "alice"));

        let cmd = Cmd::channel_uids(
            CmdType::RemoveSubscribers,
            "room",
            ChannelType::Group,
            vec!["alice".into()],
        )
        .unwrap();
        store.exec_cmd(&cmd).unwrap();
        assert!(!store.is_subscriber("room", ChannelType::Group, "alice"));
        assert!(store.is_subscriber("room", ChannelType::Group, "bob"));
    }

    #[test]
    fn test_reapply_is_noop() {
        let store = store();
        let cmd = Cmd::channel_uids(
            CmdType::AddSubscribers,
            "room",
            ChannelType::Group,
            vec!["alice".into()],
        )
        .unwrap();
        store.exec_cmd(&cmd).unwrap();
        store.exec_cmd(&cmd).unwrap();
        assert_eq!(store.subscribers("room", ChannelType::Group), vec!["alice"]);
    }

    #[test]
    fn test_deny_allow_lists() {
        let store = store();
        store
            .exec_cmd(
                &Cmd::channel_uids(CmdType::AddDenylist, "room", ChannelType::Group, vec!["eve".into()])
                    .unwrap(),
            )
            .unwrap();
        assert!(store.is_denied("room", ChannelType::Group, "eve"));

        assert!(!store.has_allowlist("room", ChannelType::Group));
        store
            .exec_cmd(
                &Cmd::channel_uids(CmdType::AddAllowlist, "room", ChannelType::Group, vec!["alice".into()])
                    .unwrap(),
            )
            .unwrap();
        assert!(store.has_allowlist("room", ChannelType::Group));
        assert!(store.is_allowed("room", ChannelType::Group, "alice"));
        assert!(!store.is_allowed("room", ChannelType::Group, "bob"));

        store
            .exec_cmd(&Cmd::channel_ref(CmdType::RemoveAllAllowlist, "room", ChannelType::Group).unwrap())
            .unwrap();
        assert!(!store.has_allowlist("room", ChannelType::Group));
    }

    #[test]
    fn test_delete_channel_clears_membership() {
        let store = store();
        store
            .exec_cmd(
                &Cmd::channel_info(
                    CmdType::AddChannelInfo,
                    &ChannelInfo::new("room", ChannelType::Group),
                )
                .unwrap(),
            )
            .unwrap();
        store
            .exec_cmd(
                &Cmd::channel_uids(CmdType::AddSubscribers, "room", ChannelType::Group, vec!["a".into()])
                    .unwrap(),
            )
            .unwrap();

        store
            .exec_cmd(&Cmd::channel_ref(CmdType::DeleteChannel, "room", ChannelType::Group).unwrap())
            .unwrap();
        assert!(store.channel_info("room", ChannelType::Group).unwrap().is_none());
        assert!(store.subscribers("room", ChannelType::Group).is_empty());
    }

    #[test]
    fn test_cluster_config_save_via_log_apply() {
        let store = store();
        let config = ChannelClusterConfig {
            channel_id: "room".into(),
            channel_type: ChannelType::Group.as_u8(),
            replicas: vec![NodeId::new(1), NodeId::new(2)],
            leader: NodeId::new(1),
            term: Term::new(1),
            conf_version: 1,
            replica_max_count: 3,
            ..Default::default()
        };
        let cmd = Cmd::channel_cluster_config_save(&config).unwrap();
        let entry = LogEntry::new(1, Term::new(1), cmd.encode());
        let applied = store.apply_slot_logs("slot-3", &[entry]).unwrap();
        assert!(applied > 0);

        let loaded = store
            .channel_cluster_config("room", ChannelType::Group)
            .unwrap()
            .unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_conversations_upsert_and_delete() {
        let store = store();
        let conversation = Conversation {
            uid: "alice".into(),
            channel_id: "room".into(),
            channel_type: ChannelType::Group,
            conversation_type: crate::records::ConversationType::Chat,
            read_to_msg_seq: 9,
        };
        store
            .exec_cmd(&Cmd::conversations("alice", vec![conversation.clone()]).unwrap())
            .unwrap();
        assert_eq!(store.conversations("alice").unwrap(), vec![conversation]);

        store
            .exec_cmd(&Cmd::delete_conversation("alice", "room", ChannelType::Group).unwrap())
            .unwrap();
        assert!(store.conversations("alice").unwrap().is_empty());
    }

    #[test]
    fn test_system_uids() {
        let store = store();
        store
            .exec_cmd(&Cmd::system_uids(CmdType::SystemUidsAdd, vec!["sys1".into()]).unwrap())
            .unwrap();
        assert!(store.is_system_uid("sys1"));
        store
            .exec_cmd(&Cmd::system_uids(CmdType::SystemUidsRemove, vec!["sys1".into()]).unwrap())
            .unwrap();
        assert!(!store.is_system_uid("sys1"));
    }

    #[test]
    fn test_streams() {
        let store = store();
        let meta = StreamMeta {
            stream_no: "s1".into(),
            channel_id: "room".into(),
            channel_type: ChannelType::Group.as_u8(),
            from_uid: "alice".into(),
        };
        store.exec_cmd(&Cmd::stream_meta(&meta).unwrap()).unwrap();
        let items = vec![
            StreamItem { stream_no: "s1".into(), seq: 1, payload: b"a".to_vec() },
            StreamItem { stream_no: "s1".into(), seq: 2, payload: b"b".to_vec() },
        ];
        store.exec_cmd(&Cmd::streams(&items).unwrap()).unwrap();
        assert_eq!(store.stream_meta("s1").unwrap().unwrap(), meta);
        assert_eq!(store.stream_items("s1").unwrap(), items);
    }
}
