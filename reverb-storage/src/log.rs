//! Per-handler append-only message log store.
//!
//! Every handler (channel log or slot log) owns one contiguous log keyed by
//! its handler key, plus applied/committed watermarks and the
//! term → first-index-of-term map used for conflict resolution.

use crate::entry::LogEntry;
use crate::error::{Result, StorageError};
use crate::keys;
use crate::kv::{ColumnFamily, Kv};
use bytes::Bytes;
use reverb_core::{LogIndex, Term};
use tracing::warn;

/// Shared handle to the log store.
#[derive(Debug, Clone)]
pub struct MessageLogStore {
    kv: Kv,
}

impl MessageLogStore {
    /// Create a store over the given engine.
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    /// Highest stored index for `key`, 0 when the log is empty.
    pub fn last_index(&self, key: &str) -> LogIndex {
        let (start, end) = keys::log_range(key, 0, LogIndex::MAX);
        self.kv
            .last_in_range(ColumnFamily::Logs, &start, &end)
            .and_then(|(k, _)| keys::index_from_log_key(&k))
            .unwrap_or(0)
    }

    /// Term of the entry at `last_index`, 0 when the log is empty.
    pub fn last_term(&self, key: &str) -> Result<Term> {
        let last = self.last_index(key);
        if last == 0 {
            return Ok(Term::default());
        }
        let entries = self.logs(key, last, last + 1)?;
        Ok(entries.first().map(|e| e.term).unwrap_or_default())
    }

    /// Append `entries`, which must be contiguous starting at tail + 1.
    pub fn append_logs(&self, key: &str, entries: &[LogEntry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let expected = self.last_index(key) + 1;
        if first.index != expected {
            return Err(StorageError::NonContiguousAppend {
                key: key.to_string(),
                expected,
                got: first.index,
            });
        }
        for (offset, entry) in entries.iter().enumerate() {
            let want = first.index + offset as u64;
            if entry.index != want {
                return Err(StorageError::NonContiguousAppend {
                    key: key.to_string(),
                    expected: want,
                    got: entry.index,
                });
            }
        }
        for entry in entries {
            self.kv.put(
                ColumnFamily::Logs,
                keys::log_key(key, entry.index),
                entry.encode_record(),
            );
        }
        Ok(())
    }

    /// Entries with `start <= index < end_exclusive`.
    ///
    /// When interior entries are missing, returns the longest contiguous
    /// prefix starting at `start`; an absent `start` yields an empty batch.
    pub fn logs(&self, key: &str, start: LogIndex, end_exclusive: LogIndex) -> Result<Vec<LogEntry>> {
        if start == 0 || start >= end_exclusive {
            return Ok(Vec::new());
        }
        let (range_start, range_end) = keys::log_range(key, start, end_exclusive);
        let pairs = self.kv.scan(ColumnFamily::Logs, &range_start, &range_end);
        let mut entries = Vec::with_capacity(pairs.len());
        for (offset, (_, record)) in pairs.into_iter().enumerate() {
            let entry = LogEntry::decode_record(key, record)?;
            if entry.index != start + offset as u64 {
                warn!(
                    key = %key,
                    expected = start + offset as u64,
                    got = entry.index,
                    "log not contiguous, truncating read at gap"
                );
                break;
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Delete every entry with index > `index`.
    pub fn truncate_logs_to(&self, key: &str, index: LogIndex) -> Result<()> {
        let (start, end) = keys::log_range(key, index + 1, LogIndex::MAX);
        let removed = self.kv.delete_range(ColumnFamily::Logs, &start, &end);
        if removed > 0 {
            warn!(key = %key, to = index, removed, "truncated log");
        }
        Ok(())
    }

    /// Persisted applied watermark, 0 when never set.
    pub fn applied_index(&self, key: &str) -> LogIndex {
        self.watermark(key, keys::Watermark::Applied)
    }

    /// Advance the applied watermark. Lower values are ignored.
    pub fn set_applied_index(&self, key: &str, index: LogIndex) {
        self.set_watermark(key, keys::Watermark::Applied, index);
    }

    /// Persisted committed watermark, 0 when never set.
    pub fn committed_index(&self, key: &str) -> LogIndex {
        self.watermark(key, keys::Watermark::Committed)
    }

    /// Advance the committed watermark. Lower values are ignored.
    pub fn set_committed_index(&self, key: &str, index: LogIndex) {
        self.set_watermark(key, keys::Watermark::Committed, index);
    }

    fn watermark(&self, key: &str, mark: keys::Watermark) -> LogIndex {
        self.kv
            .get(ColumnFamily::Watermark, &keys::watermark_key(key, mark))
            .and_then(|v| v.as_ref().try_into().ok().map(LogIndex::from_be_bytes))
            .unwrap_or(0)
    }

    fn set_watermark(&self, key: &str, mark: keys::Watermark, index: LogIndex) {
        if index <= self.watermark(key, mark) {
            return;
        }
        self.kv.put(
            ColumnFamily::Watermark,
            keys::watermark_key(key, mark),
            Bytes::copy_from_slice(&index.to_be_bytes()),
        );
    }

    /// Record the first index of `term`, overwriting any previous value.
    pub fn set_leader_term_start_index(&self, key: &str, term: Term, index: LogIndex) {
        self.kv.put(
            ColumnFamily::TermStart,
            keys::term_start_key(key, term),
            Bytes::copy_from_slice(&index.to_be_bytes()),
        );
    }

    /// First index of `term`, 0 when the term is unknown locally.
    pub fn leader_term_start_index(&self, key: &str, term: Term) -> LogIndex {
        self.kv
            .get(ColumnFamily::TermStart, &keys::term_start_key(key, term))
            .and_then(|v| v.as_ref().try_into().ok().map(LogIndex::from_be_bytes))
            .unwrap_or(0)
    }

    /// Highest term with a recorded start index, 0 when none.
    pub fn leader_last_term(&self, key: &str) -> Term {
        let (start, end) = keys::term_start_range(key, Term::new(0), Term::new(u32::MAX));
        self.kv
            .last_in_range(ColumnFamily::TermStart, &start, &end)
            .and_then(|(k, _)| keys::term_from_term_start_key(&k))
            .unwrap_or_default()
    }

    /// Drop every term-start record with term > `term`.
    pub fn delete_leader_term_start_index_greater_than_term(&self, key: &str, term: Term) {
        let (start, end) = keys::term_start_range(key, term.next(), Term::new(u32::MAX));
        self.kv.delete_range(ColumnFamily::TermStart, &start, &end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: LogIndex, term: u32) -> LogEntry {
        LogEntry::new(index, Term::new(term), Bytes::from(format!("e{}", index)))
    }

    fn store() -> MessageLogStore {
        MessageLogStore::new(Kv::open())
    }

    #[test]
    fn test_append_and_read() {
        let store = store();
        store
            .append_logs("ch", &[entry(1, 1), entry(2, 1), entry(3, 2)])
            .unwrap();
        assert_eq!(store.last_index("ch"), 3);
        assert_eq!(store.last_term("ch").unwrap(), Term::new(2));

        let read = store.logs("ch", 1, 4).unwrap();
        assert_eq!(read.len(), 3);
        assert_eq!(read[2], entry(3, 2));

        // Range is half-open.
        assert_eq!(store.logs("ch", 2, 3).unwrap(), vec![entry(2, 1)]);
    }

    #[test]
    fn test_append_rejects_gap() {
        let store = store();
        store.append_logs("ch", &[entry(1, 1)]).unwrap();
        let err = store.append_logs("ch", &[entry(3, 1)]).unwrap_err();
        assert!(matches!(
            err,
            StorageError::NonContiguousAppend {
                expected: 2,
                got: 3,
                ..
            }
        ));
        // A gap inside the batch is rejected too.
        let err = store.append_logs("ch", &[entry(2, 1), entry(4, 1)]).unwrap_err();
        assert!(matches!(err, StorageError::NonContiguousAppend { .. }));
    }

    #[test]
    fn test_truncate_hides_entries() {
        let store = store();
        store
            .append_logs("ch", &[entry(1, 1), entry(2, 1), entry(3, 1)])
            .unwrap();
        store.truncate_logs_to("ch", 1).unwrap();
        assert_eq!(store.last_index("ch"), 1);
        assert!(store.logs("ch", 2, 10).unwrap().is_empty());
        // The log accepts appends from the new tail.
        store.append_logs("ch", &[entry(2, 2)]).unwrap();
        assert_eq!(store.last_term("ch").unwrap(), Term::new(2));
    }

    #[test]
    fn test_watermarks_are_monotonic() {
        let store = store();
        store.set_committed_index("ch", 5);
        store.set_committed_index("ch", 3);
        assert_eq!(store.committed_index("ch"), 5);
        store.set_applied_index("ch", 4);
        assert_eq!(store.applied_index("ch"), 4);
        // Separate handlers do not share watermarks.
        assert_eq!(store.applied_index("other"), 0);
    }

    #[test]
    fn test_term_start_index_map() {
        let store = store();
        store.set_leader_term_start_index("ch", Term::new(1), 1);
        store.set_leader_term_start_index("ch", Term::new(3), 7);
        store.set_leader_term_start_index("ch", Term::new(5), 20);

        assert_eq!(store.leader_term_start_index("ch", Term::new(3)), 7);
        assert_eq!(store.leader_term_start_index("ch", Term::new(2)), 0);
        assert_eq!(store.leader_last_term("ch"), Term::new(5));

        store.delete_leader_term_start_index_greater_than_term("ch", Term::new(3));
        assert_eq!(store.leader_term_start_index("ch", Term::new(5)), 0);
        assert_eq!(store.leader_last_term("ch"), Term::new(3));
    }

    #[test]
    fn test_logs_across_handlers_are_isolated() {
        let store = store();
        store.append_logs("a", &[entry(1, 1)]).unwrap();
        store.append_logs("b", &[entry(1, 1), entry(2, 1)]).unwrap();
        assert_eq!(store.last_index("a"), 1);
        assert_eq!(store.last_index("b"), 2);
    }
}
