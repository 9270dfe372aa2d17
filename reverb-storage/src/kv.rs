//! Ordered column-family KV engine.
//!
//! Stands in for the external column-family store the rest of the system
//! treats as a collaborator: ordered iteration per column family, per-key
//! atomicity, concurrent readers. Everything above it (log store, apply
//! layer) only touches this surface, so swapping in a disk engine is a
//! local change.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

/// Column families, one ordered keyspace each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnFamily {
    /// Per-handler replicated log entries, ordered by index.
    Logs,
    /// Per-handler term → first-index-of-term records.
    TermStart,
    /// Per-handler applied/committed watermarks.
    Watermark,
    /// Metadata rows written by the apply layer.
    Meta,
}

const CF_COUNT: usize = 4;

impl ColumnFamily {
    fn slot(self) -> usize {
        match self {
            Self::Logs => 0,
            Self::TermStart => 1,
            Self::Watermark => 2,
            Self::Meta => 3,
        }
    }
}

type Tree = BTreeMap<Vec<u8>, Bytes>;

/// Shared handle to the engine.
#[derive(Debug, Clone, Default)]
pub struct Kv {
    families: Arc<[RwLock<Tree>; CF_COUNT]>,
}

impl Kv {
    /// Open a fresh, empty engine.
    pub fn open() -> Self {
        Self::default()
    }

    fn tree(&self, cf: ColumnFamily) -> &RwLock<Tree> {
        &self.families[cf.slot()]
    }

    /// Put one key/value pair.
    pub fn put(&self, cf: ColumnFamily, key: Vec<u8>, value: Bytes) {
        self.tree(cf).write().insert(key, value);
    }

    /// Get a value by exact key.
    pub fn get(&self, cf: ColumnFamily, key: &[u8]) -> Option<Bytes> {
        self.tree(cf).read().get(key).cloned()
    }

    /// Delete one key. Returns whether it existed.
    pub fn delete(&self, cf: ColumnFamily, key: &[u8]) -> bool {
        self.tree(cf).write().remove(key).is_some()
    }

    /// All pairs with keys in `[start, end)`, in key order.
    pub fn scan(&self, cf: ColumnFamily, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Bytes)> {
        self.tree(cf)
            .read()
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// The last pair with a key in `[start, end)`, if any.
    pub fn last_in_range(
        &self,
        cf: ColumnFamily,
        start: &[u8],
        end: &[u8],
    ) -> Option<(Vec<u8>, Bytes)> {
        self.tree(cf)
            .read()
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    /// Delete every key in `[start, end)`. Returns the number removed.
    pub fn delete_range(&self, cf: ColumnFamily, start: &[u8], end: &[u8]) -> usize {
        let mut tree = self.tree(cf).write();
        let doomed: Vec<Vec<u8>> = tree
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            tree.remove(key);
        }
        doomed.len()
    }
}
