//! # Reverb Storage
//!
//! The node-local persistence layer: an ordered column-family KV engine,
//! the per-handler replicated message log with its term-start-index map,
//! and the metadata apply layer that executes committed cluster-control
//! commands.

/// Metadata apply layer and read surface.
pub mod apply;

/// Cluster-control command envelope.
pub mod cmd;

/// Replicated log entries and encodings.
pub mod entry;

/// Storage error types.
pub mod error;

/// Composite key schema.
pub mod keys;

/// Ordered column-family KV engine.
pub mod kv;

/// Per-handler message log store.
pub mod log;

/// Metadata record types.
pub mod records;

pub use crate::{
    apply::MetaStore,
    cmd::{Cmd, CmdType},
    entry::LogEntry,
    error::{Result, StorageError},
    kv::{ColumnFamily, Kv},
    log::MessageLogStore,
    records::{ChannelClusterConfig, ChannelInfo, Conversation, Device, User},
};
