//! The per-channel message queue and its stage cursors.
//!
//! Eleven cursors track each message's progress through the pipeline.
//! Every cursor is monotonically non-decreasing while a role is held;
//! `reset_index` (role change) zeroes the stage cursors but never
//! `last_index` or the decrypt pair, so accepted messages survive leader
//! changes and re-propose on the new leader.

use crate::message::ChannelMessage;
use bytes::Bytes;
use std::collections::VecDeque;

/// Ordered in-flight publishes with pipeline cursors.
#[derive(Debug, Default)]
pub struct MessageQueue {
    messages: VecDeque<ChannelMessage>,
    /// Queue index of `messages[0]` minus one; 0 when nothing was trimmed.
    base: u64,

    /// Index of the newest accepted message.
    pub last_index: u64,
    /// Decrypt stage in-flight bound.
    pub payload_decrypting_index: u64,
    /// Decrypt stage done bound.
    pub payload_decrypted_index: u64,
    /// Permission stage in-flight bound.
    pub permission_checking_index: u64,
    /// Permission stage done bound.
    pub permission_checked_index: u64,
    /// Store stage in-flight bound.
    pub storaging_index: u64,
    /// Store stage done bound.
    pub storaged_index: u64,
    /// Deliver stage in-flight bound.
    pub delivering_index: u64,
    /// Deliver stage done bound.
    pub delivered_index: u64,
    /// Forward stage in-flight bound.
    pub forwarding_index: u64,
    /// Forward stage done bound.
    pub forwarded_index: u64,
}

impl MessageQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a message, assigning the next queue index.
    pub fn append(&mut self, mut msg: ChannelMessage) -> u64 {
        self.last_index += 1;
        msg.index = self.last_index;
        self.messages.push_back(msg);
        self.last_index
    }

    /// Number of in-flight messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the queue holds no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn position(&self, index: u64) -> Option<usize> {
        if index <= self.base || index > self.last_index {
            return None;
        }
        let offset = (index - self.base - 1) as usize;
        (offset < self.messages.len()).then_some(offset)
    }

    /// Messages with `start <= index < end_exclusive`, stopping before the
    /// batch exceeds `max_bytes` (0 = unbounded). Always yields at least
    /// one message when the range is non-empty.
    pub fn slice_with_size(&self, start: u64, end_exclusive: u64, max_bytes: u64) -> Vec<ChannelMessage> {
        let mut batch = Vec::new();
        let mut bytes: u64 = 0;
        let mut index = start.max(self.base + 1);
        while index < end_exclusive {
            let Some(pos) = self.position(index) else {
                break;
            };
            let msg = &self.messages[pos];
            bytes += msg.size();
            if max_bytes > 0 && bytes > max_bytes && !batch.is_empty() {
                break;
            }
            batch.push(msg.clone());
            index += 1;
        }
        batch
    }

    /// Replace a message's payload after decryption.
    pub fn set_decrypted(&mut self, index: u64, payload: Bytes) {
        if let Some(pos) = self.position(index) {
            let msg = &mut self.messages[pos];
            msg.payload = payload;
            msg.is_encrypt = false;
        }
    }

    /// Mark a message dropped (decrypt failure, permission reject).
    pub fn mark_dropped(&mut self, index: u64) {
        if let Some(pos) = self.position(index) {
            self.messages[pos].dropped = true;
        }
    }

    /// Drop queue storage for messages at or below `index`. Cursors are
    /// untouched; callers trim only below every done cursor they depend
    /// on.
    pub fn trim_to(&mut self, index: u64) {
        while let Some(front) = self.messages.front() {
            if front.index > index {
                break;
            }
            self.messages.pop_front();
            self.base += 1;
        }
    }

    /// Zero the role-dependent cursors. Accepted and decrypted progress
    /// survives; the new role re-drives the rest, deduplicating on
    /// message id at the log layer.
    pub fn reset_index(&mut self) {
        // Stage cursors restart at the trimmed base (0 when nothing was
        // trimmed) so every message still queued re-drives.
        self.permission_checking_index = self.base;
        self.permission_checked_index = self.base;
        self.storaging_index = self.base;
        self.storaged_index = self.base;
        self.delivering_index = self.base;
        self.delivered_index = self.base;
        self.forwarding_index = self.base;
        self.forwarded_index = self.base;
    }

    /// Debug invariant: cursor ordering for the leader stage ladder.
    #[cfg(debug_assertions)]
    pub fn assert_cursor_order(&self) {
        debug_assert!(self.payload_decrypted_index <= self.last_index);
        debug_assert!(self.permission_checked_index <= self.payload_decrypted_index.max(self.base));
        debug_assert!(self.storaged_index <= self.permission_checked_index.max(self.base));
        debug_assert!(self.delivered_index <= self.storaged_index.max(self.base));
        debug_assert!(self.forwarded_index <= self.payload_decrypted_index.max(self.base));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverb_core::{ChannelType, NodeId};

    fn msg(payload: &[u8]) -> ChannelMessage {
        ChannelMessage {
            message_id: 1,
            index: 0,
            from_uid: "alice".into(),
            from_node: NodeId::new(1),
            channel_id: "room".into(),
            channel_type: ChannelType::Group,
            payload: Bytes::copy_from_slice(payload),
            is_encrypt: false,
            dropped: false,
        }
    }

    #[test]
    fn test_append_assigns_contiguous_indices() {
        let mut queue = MessageQueue::new();
        assert_eq!(queue.append(msg(b"a")), 1);
        assert_eq!(queue.append(msg(b"b")), 2);
        assert_eq!(queue.last_index, 2);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_slice_ranges() {
        let mut queue = MessageQueue::new();
        for payload in [b"aa".as_ref(), b"bb", b"cc", b"dd"] {
            queue.append(msg(payload));
        }
        let batch = queue.slice_with_size(2, 4, 0);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].index, 2);
        assert_eq!(batch[1].index, 3);
    }

    #[test]
    fn test_slice_respects_byte_budget() {
        let mut queue = MessageQueue::new();
        for payload in [b"aaaa".as_ref(), b"bbbb", b"cccc"] {
            queue.append(msg(payload));
        }
        let batch = queue.slice_with_size(1, 4, 5);
        assert_eq!(batch.len(), 1);
        // The first message always fits, even over budget.
        let batch = queue.slice_with_size(1, 4, 2);
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_trim_and_position() {
        let mut queue = MessageQueue::new();
        for payload in [b"a".as_ref(), b"b", b"c"] {
            queue.append(msg(payload));
        }
        queue.trim_to(2);
        assert_eq!(queue.len(), 1);
        let batch = queue.slice_with_size(1, 4, 0);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].index, 3);
        // New appends continue the index sequence.
        assert_eq!(queue.append(msg(b"d")), 4);
    }

    #[test]
    fn test_decrypt_and_drop_marks() {
        let mut queue = MessageQueue::new();
        let mut encrypted = msg(b"secret");
        encrypted.is_encrypt = true;
        queue.append(encrypted);
        queue.set_decrypted(1, Bytes::from_static(b"plain"));
        let batch = queue.slice_with_size(1, 2, 0);
        assert!(!batch[0].is_encrypt);
        assert_eq!(&batch[0].payload[..], b"plain");

        queue.mark_dropped(1);
        assert!(queue.slice_with_size(1, 2, 0)[0].dropped);
    }

    #[test]
    fn test_reset_index_preserves_accepted_work() {
        let mut queue = MessageQueue::new();
        for payload in [b"a".as_ref(), b"b"] {
            queue.append(msg(payload));
        }
        queue.payload_decrypting_index = 2;
        queue.payload_decrypted_index = 2;
        queue.permission_checked_index = 2;
        queue.storaged_index = 2;
        queue.reset_index();
        assert_eq!(queue.last_index, 2);
        assert_eq!(queue.payload_decrypted_index, 2);
        assert_eq!(queue.storaged_index, 0);
        assert_eq!(queue.permission_checked_index, 0);
    }
}
