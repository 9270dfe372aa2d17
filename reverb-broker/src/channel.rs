//! The channel object: role, status, and the stage ladder.
//!
//! A channel examines its queue cursors each round and launches at most
//! one in-flight batch per stage. Stage order is strict; a message enters
//! a stage only after the previous stage acknowledged it. Leaders run
//! permission → store → deliver; proxies forward decrypted payloads to
//! the leader instead.

use crate::message::ChannelMessage;
use crate::queue::MessageQueue;
use reverb_core::{channel_key, ChannelType, NodeId};
use std::collections::HashSet;
use tracing::info;

/// Channel lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// No config resolved yet.
    Uninitialized,
    /// Config resolution in flight.
    Initializing,
    /// Config resolved; the stage ladder runs.
    Initialized,
}

/// Role of this node for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Owns the pipeline: permission, store, deliver.
    Leader,
    /// Hosts the queue and forwards decrypted payloads to the leader.
    Proxy,
}

/// One stage batch the channel wants executed.
#[derive(Debug)]
pub enum ChannelAction {
    /// Resolve config and derive the role.
    Init,
    /// Decrypt payloads.
    Decrypt {
        /// Batch in queue order.
        messages: Vec<ChannelMessage>,
    },
    /// Check send permissions (leader only).
    PermissionCheck {
        /// Batch in queue order.
        messages: Vec<ChannelMessage>,
    },
    /// Propose to the replicated log (leader only).
    Storage {
        /// Batch in queue order.
        messages: Vec<ChannelMessage>,
    },
    /// Fan out to recipients (leader only).
    Deliver {
        /// Batch in queue order.
        messages: Vec<ChannelMessage>,
    },
    /// Ship to the leader (proxy only).
    Forward {
        /// The channel leader.
        leader: NodeId,
        /// Batch in queue order.
        messages: Vec<ChannelMessage>,
    },
}

/// Per-stage byte budgets.
#[derive(Debug, Clone)]
pub struct ChannelBudgets {
    /// Store stage batch bound.
    pub storage_max_size: u64,
    /// Deliver stage batch bound.
    pub deliver_max_size: u64,
    /// Forward stage batch bound.
    pub forward_max_size: u64,
}

impl Default for ChannelBudgets {
    fn default() -> Self {
        Self {
            storage_max_size: 1024 * 1024 * 2,
            deliver_max_size: 1024 * 1024 * 2,
            forward_max_size: 1024 * 1024 * 2,
        }
    }
}

/// A channel hosted on this node.
#[derive(Debug)]
pub struct Channel {
    /// Handler key (`"{id}-{type}"`).
    pub key: String,
    /// Channel id.
    pub channel_id: String,
    /// Channel type.
    pub channel_type: ChannelType,
    /// The message queue and its cursors.
    pub queue: MessageQueue,
    /// Lifecycle status.
    pub status: ChannelStatus,
    /// Current role. Meaningless until initialized.
    pub role: ChannelRole,
    /// Channel leader node.
    pub leader: NodeId,
    /// Receiver-tag key; `None` until the first deliver builds one.
    pub receiver_tag_key: Option<String>,
    /// Recently active subscribers (connection-churn cache, not the full
    /// subscriber set).
    pub cache_subscribers: HashSet<String>,
    budgets: ChannelBudgets,

    decrypting: bool,
    permission_checking: bool,
    storaging: bool,
    delivering: bool,
    forwarding: bool,

    /// Ticks since the queue last moved; drives idle eviction.
    pub idle_ticks: u64,
}

impl Channel {
    /// Create an uninitialized channel.
    pub fn new(channel_id: &str, channel_type: ChannelType, budgets: ChannelBudgets) -> Self {
        Self {
            key: channel_key(channel_id, channel_type),
            channel_id: channel_id.to_string(),
            channel_type,
            queue: MessageQueue::new(),
            status: ChannelStatus::Uninitialized,
            role: ChannelRole::Proxy,
            leader: NodeId::none(),
            receiver_tag_key: None,
            cache_subscribers: HashSet::new(),
            budgets,
            decrypting: false,
            permission_checking: false,
            storaging: false,
            delivering: false,
            forwarding: false,
            idle_ticks: 0,
        }
    }

    /// Whether the channel has been initialized.
    pub fn is_initialized(&self) -> bool {
        self.status == ChannelStatus::Initialized
    }

    fn has_undecrypted(&self) -> bool {
        !self.decrypting && self.queue.payload_decrypting_index < self.queue.last_index
    }

    fn has_unchecked(&self) -> bool {
        !self.permission_checking
            && self.queue.permission_checking_index < self.queue.payload_decrypted_index
    }

    fn has_unstored(&self) -> bool {
        !self.storaging && self.queue.storaging_index < self.queue.permission_checked_index
    }

    fn has_undelivered(&self) -> bool {
        !self.delivering && self.queue.delivering_index < self.queue.storaged_index
    }

    fn has_unforwarded(&self) -> bool {
        !self.forwarding && self.queue.forwarding_index < self.queue.payload_decrypted_index
    }

    /// Whether [`Self::ready`] would produce actions.
    pub fn has_ready(&self) -> bool {
        if !self.is_initialized() {
            return self.status != ChannelStatus::Initializing;
        }
        if self.has_undecrypted() {
            return true;
        }
        match self.role {
            ChannelRole::Leader => {
                self.has_unchecked() || self.has_unstored() || self.has_undelivered()
            }
            ChannelRole::Proxy => self.has_unforwarded(),
        }
    }

    /// Collect the next stage batches, marking each launched stage
    /// in-flight so it is not re-entered until its result lands.
    pub fn ready(&mut self) -> Vec<ChannelAction> {
        let mut actions = Vec::new();
        if !self.is_initialized() {
            if self.status == ChannelStatus::Uninitialized {
                self.status = ChannelStatus::Initializing;
                actions.push(ChannelAction::Init);
            }
            return actions;
        }

        if self.has_undecrypted() {
            let batch = self.queue.slice_with_size(
                self.queue.payload_decrypting_index + 1,
                self.queue.last_index + 1,
                0,
            );
            if let Some(last) = batch.last() {
                self.queue.payload_decrypting_index = last.index;
                self.decrypting = true;
                actions.push(ChannelAction::Decrypt { messages: batch });
            }
        }

        match self.role {
            ChannelRole::Leader => {
                if self.has_unchecked() {
                    let batch = self.queue.slice_with_size(
                        self.queue.permission_checking_index + 1,
                        self.queue.payload_decrypted_index + 1,
                        0,
                    );
                    if let Some(last) = batch.last() {
                        self.queue.permission_checking_index = last.index;
                        self.permission_checking = true;
                        actions.push(ChannelAction::PermissionCheck { messages: batch });
                    }
                }
                if self.has_unstored() {
                    let batch = self.queue.slice_with_size(
                        self.queue.storaging_index + 1,
                        self.queue.permission_checked_index + 1,
                        self.budgets.storage_max_size,
                    );
                    if let Some(last) = batch.last() {
                        self.queue.storaging_index = last.index;
                        self.storaging = true;
                        actions.push(ChannelAction::Storage { messages: batch });
                    }
                }
                if self.has_undelivered() {
                    let batch = self.queue.slice_with_size(
                        self.queue.delivering_index + 1,
                        self.queue.storaged_index + 1,
                        self.budgets.deliver_max_size,
                    );
                    if let Some(last) = batch.last() {
                        self.queue.delivering_index = last.index;
                        self.delivering = true;
                        actions.push(ChannelAction::Deliver { messages: batch });
                    }
                }
            }
            ChannelRole::Proxy => {
                if self.has_unforwarded() {
                    let batch = self.queue.slice_with_size(
                        self.queue.forwarding_index + 1,
                        self.queue.payload_decrypted_index + 1,
                        self.budgets.forward_max_size,
                    );
                    if let Some(last) = batch.last() {
                        self.queue.forwarding_index = last.index;
                        self.forwarding = true;
                        actions.push(ChannelAction::Forward {
                            leader: self.leader,
                            messages: batch,
                        });
                    }
                }
            }
        }
        actions
    }

    // ---- stage results ----

    /// Init resolved: adopt role and start the ladder.
    pub fn on_init(&mut self, leader: NodeId, local: NodeId) {
        self.status = ChannelStatus::Initialized;
        if leader == local {
            self.become_leader();
        } else {
            self.become_proxy(leader);
        }
    }

    /// Init failed; retry on the next round.
    pub fn on_init_failed(&mut self) {
        self.status = ChannelStatus::Uninitialized;
    }

    /// Decrypt batch finished up to `last_index`.
    pub fn on_decrypted(&mut self, last_index: u64) {
        self.decrypting = false;
        if last_index > self.queue.payload_decrypted_index {
            self.queue.payload_decrypted_index = last_index;
        }
        self.idle_ticks = 0;
    }

    /// Permission batch finished up to `last_index`.
    pub fn on_permission_checked(&mut self, last_index: u64) {
        self.permission_checking = false;
        if last_index > self.queue.permission_checked_index {
            self.queue.permission_checked_index = last_index;
        }
    }

    /// Permission batch failed; rewind so it re-drives.
    pub fn on_permission_failed(&mut self) {
        self.permission_checking = false;
        self.queue.permission_checking_index = self.queue.permission_checked_index;
    }

    /// Store batch committed up to `last_index`.
    pub fn on_stored(&mut self, last_index: u64) {
        self.storaging = false;
        if last_index > self.queue.storaged_index {
            self.queue.storaged_index = last_index;
        }
    }

    /// Store batch failed; rewind the in-flight cursor so it re-drives.
    pub fn on_store_failed(&mut self) {
        self.storaging = false;
        self.queue.storaging_index = self.queue.storaged_index;
    }

    /// Deliver batch acknowledged up to `last_index`.
    pub fn on_delivered(&mut self, last_index: u64) {
        self.delivering = false;
        if last_index > self.queue.delivered_index {
            self.queue.delivered_index = last_index;
        }
        self.queue.trim_to(self.queue.delivered_index);
    }

    /// Deliver batch failed; rewind so it re-drives.
    pub fn on_deliver_failed(&mut self) {
        self.delivering = false;
        self.queue.delivering_index = self.queue.delivered_index;
    }

    /// Forward batch acknowledged up to `last_index`.
    pub fn on_forwarded(&mut self, last_index: u64) {
        self.forwarding = false;
        if last_index > self.queue.forwarded_index {
            self.queue.forwarded_index = last_index;
        }
        self.queue.trim_to(self.queue.forwarded_index);
    }

    /// Forward batch failed; rewind so it re-drives.
    pub fn on_forward_failed(&mut self) {
        self.forwarding = false;
        self.queue.forwarding_index = self.queue.forwarded_index;
    }

    /// Decrypt batch failed; rewind so it re-drives.
    pub fn on_decrypt_failed(&mut self) {
        self.decrypting = false;
        self.queue.payload_decrypting_index = self.queue.payload_decrypted_index;
    }

    // ---- role transitions ----

    /// Take the leader role; stage cursors reset and queued messages
    /// re-drive through the leader ladder.
    pub fn become_leader(&mut self) {
        self.reset_index();
        self.leader = NodeId::none();
        self.role = ChannelRole::Leader;
        info!(channel = %self.key, "became channel leader");
    }

    /// Take the proxy role for `leader`.
    pub fn become_proxy(&mut self, leader: NodeId) {
        self.reset_index();
        self.leader = leader;
        self.role = ChannelRole::Proxy;
        info!(channel = %self.key, leader = %leader, "became channel proxy");
    }

    fn reset_index(&mut self) {
        self.queue.reset_index();
        self.permission_checking = false;
        self.storaging = false;
        self.delivering = false;
        self.forwarding = false;
    }

    /// Whether `uid` is a cached active subscriber.
    pub fn is_cache_subscriber(&self, uid: &str) -> bool {
        self.cache_subscribers.contains(uid)
    }

    /// Cache an active subscriber.
    pub fn set_cache_subscriber(&mut self, uid: String) {
        self.cache_subscribers.insert(uid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn channel() -> Channel {
        Channel::new("room", ChannelType::Group, ChannelBudgets::default())
    }

    fn push(ch: &mut Channel, payload: &[u8], encrypted: bool) -> u64 {
        ch.queue.append(ChannelMessage {
            message_id: 1,
            index: 0,
            from_uid: "alice".into(),
            from_node: NodeId::new(1),
            channel_id: "room".into(),
            channel_type: ChannelType::Group,
            payload: Bytes::copy_from_slice(payload),
            is_encrypt: encrypted,
            dropped: false,
        })
    }

    #[test]
    fn test_first_ready_is_init() {
        let mut ch = channel();
        assert!(ch.has_ready());
        let actions = ch.ready();
        assert!(matches!(actions[0], ChannelAction::Init));
        // Initializing: no duplicate init.
        assert!(!ch.has_ready());
        assert!(ch.ready().is_empty());
    }

    #[test]
    fn test_leader_ladder_strict_order() {
        let mut ch = channel();
        ch.on_init(NodeId::new(1), NodeId::new(1));
        assert_eq!(ch.role, ChannelRole::Leader);
        push(&mut ch, b"hello", false);

        // Stage 1: decrypt.
        let actions = ch.ready();
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], ChannelAction::Decrypt { .. }));
        // Decrypt in flight: nothing else launches.
        assert!(ch.ready().is_empty());
        ch.on_decrypted(1);

        // Stage 2: permission.
        let actions = ch.ready();
        assert!(matches!(actions[0], ChannelAction::PermissionCheck { .. }));
        ch.on_permission_checked(1);

        // Stage 3: storage.
        let actions = ch.ready();
        assert!(matches!(actions[0], ChannelAction::Storage { .. }));
        ch.on_stored(1);

        // Stage 4: deliver.
        let actions = ch.ready();
        assert!(matches!(actions[0], ChannelAction::Deliver { .. }));
        ch.on_delivered(1);
        assert!(!ch.has_ready());
        assert_eq!(ch.queue.len(), 0); // delivered messages trimmed
    }

    #[test]
    fn test_proxy_forwards_after_decrypt() {
        let mut ch = channel();
        ch.on_init(NodeId::new(2), NodeId::new(1));
        assert_eq!(ch.role, ChannelRole::Proxy);
        push(&mut ch, b"hello", false);

        let actions = ch.ready();
        assert!(matches!(actions[0], ChannelAction::Decrypt { .. }));
        ch.on_decrypted(1);

        let actions = ch.ready();
        match &actions[0] {
            ChannelAction::Forward { leader, messages } => {
                assert_eq!(*leader, NodeId::new(2));
                assert_eq!(messages.len(), 1);
            }
            other => panic!("expected forward, got {:?}", other),
        }
        ch.on_forwarded(1);
        assert!(!ch.has_ready());
    }

    #[test]
    fn test_store_failure_rewinds_and_retries() {
        let mut ch = channel();
        ch.on_init(NodeId::new(1), NodeId::new(1));
        push(&mut ch, b"x", false);
        ch.ready();
        ch.on_decrypted(1);
        ch.ready();
        ch.on_permission_checked(1);
        let actions = ch.ready();
        assert!(matches!(actions[0], ChannelAction::Storage { .. }));

        ch.on_store_failed();
        // The same batch launches again.
        let actions = ch.ready();
        assert!(matches!(actions[0], ChannelAction::Storage { .. }));
    }

    #[test]
    fn test_role_change_reproposes_stored_messages() {
        let mut ch = channel();
        ch.on_init(NodeId::new(1), NodeId::new(1));
        push(&mut ch, b"x", false);
        ch.ready();
        ch.on_decrypted(1);
        ch.ready();
        ch.on_permission_checked(1);
        ch.ready();
        ch.on_stored(1);

        // Leader lost mid-pipeline; now a proxy for node 2.
        ch.become_proxy(NodeId::new(2));
        assert_eq!(ch.queue.storaged_index, 0);
        assert_eq!(ch.queue.payload_decrypted_index, 1);
        let actions = ch.ready();
        assert!(matches!(actions[0], ChannelAction::Forward { .. }));
    }

    #[test]
    fn test_ready_combines_pipelined_stages() {
        let mut ch = channel();
        ch.on_init(NodeId::new(1), NodeId::new(1));
        push(&mut ch, b"a", false);
        ch.ready();
        ch.on_decrypted(1);
        ch.ready();
        ch.on_permission_checked(1);
        // A second message arrives while the first waits for storage.
        push(&mut ch, b"b", false);
        let actions = ch.ready();
        // Storage for message 1 and decrypt for message 2, one round.
        assert_eq!(actions.len(), 2);
        assert!(actions.iter().any(|a| matches!(a, ChannelAction::Decrypt { .. })));
        assert!(actions.iter().any(|a| matches!(a, ChannelAction::Storage { .. })));
    }
}
