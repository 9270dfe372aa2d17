//! Composite key schema.
//!
//! Row columns are `(table, primary, column)`; member sets (secondary
//! indexes over a parent row) are `(table, primary, member)`. Primaries and
//! members are length-prefixed with `u16 BE` so keys sharing a primary sort
//! together and prefix scans stay exact. Log and watermark keys live in
//! their own column families and prefix with the handler key.

use reverb_core::{LogIndex, Term};

/// Metadata tables inside [`crate::kv::ColumnFamily::Meta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Table {
    /// Users by uid.
    User = 1,
    /// Devices by `"{uid}/{device_id}"`.
    Device = 2,
    /// Channel subscriber sets by channel key.
    Subscriber = 3,
    /// Channel denylists by channel key.
    Denylist = 4,
    /// Channel allowlists by channel key.
    Allowlist = 5,
    /// Conversations by `"{uid}/{channel_key}"`.
    Conversation = 6,
    /// Channel base info by channel key.
    ChannelInfo = 7,
    /// Channel cluster configs by channel key.
    ChannelClusterConfig = 8,
    /// The set of system uids (primary is a fixed sentinel).
    SystemUid = 9,
    /// Stream metadata by stream number.
    StreamMeta = 10,
    /// Stream items by `"{stream_no}/{seq}"`.
    Stream = 11,
}

/// Fixed column ids for single-value rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Column {
    /// The bincode-encoded record body.
    Body = 1,
}

/// Watermark columns inside [`crate::kv::ColumnFamily::Watermark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Watermark {
    /// Highest index applied to the state machine.
    Applied = 1,
    /// Highest index known committed.
    Committed = 2,
}

fn put_prefixed(buf: &mut Vec<u8>, value: &[u8]) {
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
}

/// Row-column key `(table, primary, column)`.
pub fn row_key(table: Table, primary: &str, column: Column) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + primary.len());
    key.push(table as u8);
    put_prefixed(&mut key, primary.as_bytes());
    key.push(column as u8);
    key
}

/// Member key `(table, primary, member)` for set-valued rows.
pub fn member_key(table: Table, primary: &str, member: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(6 + primary.len() + member.len());
    key.push(table as u8);
    put_prefixed(&mut key, primary.as_bytes());
    put_prefixed(&mut key, member.as_bytes());
    key
}

/// `[start, end)` bounds covering every member of `(table, primary)`.
pub fn member_range(table: Table, primary: &str) -> (Vec<u8>, Vec<u8>) {
    let mut start = Vec::with_capacity(4 + primary.len());
    start.push(table as u8);
    put_prefixed(&mut start, primary.as_bytes());
    let mut end = start.clone();
    end.push(0xff);
    end.push(0xff);
    end.push(0xff);
    (start, end)
}

/// Decode the member suffix out of a key produced by [`member_key`].
pub fn member_from_key(key: &[u8], primary_len: usize) -> Option<String> {
    // table byte + u16 prefix + primary + u16 prefix + member
    let member_start = 1 + 2 + primary_len + 2;
    if key.len() < member_start {
        return None;
    }
    String::from_utf8(key[member_start..].to_vec()).ok()
}

fn put_handler(buf: &mut Vec<u8>, handler_key: &str) {
    put_prefixed(buf, handler_key.as_bytes());
}

/// Log entry key `(handler, index)` in the Logs column family.
pub fn log_key(handler_key: &str, index: LogIndex) -> Vec<u8> {
    let mut key = Vec::with_capacity(10 + handler_key.len());
    put_handler(&mut key, handler_key);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// `[start, end)` bounds for the log entries of `handler_key` with
/// `start_index <= index < end_index`.
pub fn log_range(handler_key: &str, start_index: LogIndex, end_index: LogIndex) -> (Vec<u8>, Vec<u8>) {
    (log_key(handler_key, start_index), log_key(handler_key, end_index))
}

/// Decode the index out of a key produced by [`log_key`].
pub fn index_from_log_key(key: &[u8]) -> Option<LogIndex> {
    if key.len() < 8 {
        return None;
    }
    let tail: [u8; 8] = key[key.len() - 8..].try_into().ok()?;
    Some(LogIndex::from_be_bytes(tail))
}

/// Term-start-index key `(handler, term)` in the TermStart column family.
pub fn term_start_key(handler_key: &str, term: Term) -> Vec<u8> {
    let mut key = Vec::with_capacity(6 + handler_key.len());
    put_handler(&mut key, handler_key);
    key.extend_from_slice(&term.value().to_be_bytes());
    key
}

/// `[start, end)` bounds for the term-start records of `handler_key` with
/// `start_term <= term < end_term`.
pub fn term_start_range(handler_key: &str, start_term: Term, end_term: Term) -> (Vec<u8>, Vec<u8>) {
    (
        term_start_key(handler_key, start_term),
        term_start_key(handler_key, end_term),
    )
}

/// Decode the term out of a key produced by [`term_start_key`].
pub fn term_from_term_start_key(key: &[u8]) -> Option<Term> {
    if key.len() < 4 {
        return None;
    }
    let tail: [u8; 4] = key[key.len() - 4..].try_into().ok()?;
    Some(Term::new(u32::from_be_bytes(tail)))
}

/// Watermark key `(handler, watermark)` in the Watermark column family.
pub fn watermark_key(handler_key: &str, mark: Watermark) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + handler_key.len());
    put_handler(&mut key, handler_key);
    key.push(mark as u8);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_keys_order_by_index() {
        let a = log_key("ch-1", 1);
        let b = log_key("ch-1", 2);
        let c = log_key("ch-1", 300);
        assert!(a < b && b < c);
        assert_eq!(index_from_log_key(&c), Some(300));
    }

    #[test]
    fn test_log_range_excludes_other_handlers() {
        let (start, end) = log_range("ch-1", 1, u64::MAX);
        let other = log_key("ch-2", 1);
        assert!(!(other >= start && other < end));
    }

    #[test]
    fn test_member_range_covers_members() {
        let (start, end) = member_range(Table::Subscriber, "room-2");
        let member = member_key(Table::Subscriber, "room-2", "alice");
        assert!(member >= start && member < end);
        let foreign = member_key(Table::Subscriber, "room-3", "alice");
        assert!(!(foreign >= start && foreign < end));
    }

    #[test]
    fn test_member_from_key() {
        let key = member_key(Table::Subscriber, "room-2", "alice");
        assert_eq!(member_from_key(&key, "room-2".len()).as_deref(), Some("alice"));
    }

    #[test]
    fn test_term_start_keys_order_by_term() {
        let a = term_start_key("ch-1", Term::new(1));
        let b = term_start_key("ch-1", Term::new(7));
        assert!(a < b);
        assert_eq!(term_from_term_start_key(&b), Some(Term::new(7)));
    }
}
