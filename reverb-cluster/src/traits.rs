//! Capability seams between the reactor and its host.
//!
//! The reactor is polymorphic over exactly two surfaces: the handler's
//! storage (its log, watermarks, term map, and apply side) and the host's
//! request layer (config resolution, remote term lookup, durable appends,
//! role transitions). The broker implements both for channels; the slot
//! manager implements both for slots.

use crate::error::Result;
use crate::replica::MessageKind;
use async_trait::async_trait;
use reverb_core::{LogIndex, NodeId, Term};
use reverb_storage::LogEntry;

/// Storage surface of one handler.
///
/// Synchronous methods touch the local engine only; `apply_logs` may fan
/// out (message delivery, metadata writes) and is async.
#[async_trait]
pub trait HandlerStorage: Send + Sync + 'static {
    /// Tail index of the persisted log.
    fn last_index(&self) -> Result<LogIndex>;

    /// Term of the tail entry.
    fn last_term(&self) -> Result<Term>;

    /// Persisted applied watermark.
    fn applied_index(&self) -> Result<LogIndex>;

    /// Persisted committed watermark.
    fn committed_index(&self) -> Result<LogIndex>;

    /// Persist the committed watermark.
    fn set_committed_index(&self, index: LogIndex) -> Result<()>;

    /// Highest term with a recorded start index.
    fn leader_last_term(&self) -> Result<Term>;

    /// First index of `term`, 0 when unknown.
    fn leader_term_start_index(&self, term: Term) -> Result<LogIndex>;

    /// Record the first index of `term`.
    fn set_leader_term_start_index(&self, term: Term, index: LogIndex) -> Result<()>;

    /// Drop term-start records above `term`.
    fn delete_leader_term_start_index_greater_than_term(&self, term: Term) -> Result<()>;

    /// Contiguous entries in `[start, end_exclusive)`.
    fn logs(&self, start: LogIndex, end_exclusive: LogIndex) -> Result<Vec<LogEntry>>;

    /// Delete entries above `index`.
    fn truncate_logs_to(&self, index: LogIndex) -> Result<()>;

    /// Apply committed entries in `[start, end_exclusive)` to the business
    /// state machine and advance the applied watermark. Returns applied
    /// bytes for flow control. Must be idempotent on index.
    async fn apply_logs(&self, start: LogIndex, end_exclusive: LogIndex) -> Result<u64>;
}

/// A role transition requested by a handler's leader once the migration
/// target has caught up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleTransition {
    /// One of `LearnerToFollower`, `LearnerToLeader`, `FollowerToLeader`.
    pub kind: MessageKind,
    /// The node changing role.
    pub peer: NodeId,
    /// Leader term at proposal time.
    pub term: Term,
}

/// Request surface the reactor consumes from its host.
#[async_trait]
pub trait ReactorRequest: Send + Sync + 'static {
    /// Resolve the handler's cluster config. `None` means the handler is
    /// unknown and no config should be created yet.
    async fn get_config(&self, handler_key: &str) -> Result<Option<crate::replica::ReplicaConfig>>;

    /// Ask `leader` for the first index of `term + 1` in its term map (or
    /// its last index + 1 when `term` is its current term). 0 = unknown.
    async fn get_leader_term_start_index(
        &self,
        handler_key: &str,
        leader: NodeId,
        term: Term,
    ) -> Result<LogIndex>;

    /// Durably append entries to the handler's log.
    async fn append_logs(&self, handler_key: &str, entries: &[LogEntry]) -> Result<()>;

    /// Persist a migration role transition (proposed to the arbitrating
    /// slot log).
    async fn role_transition(&self, handler_key: &str, transition: RoleTransition) -> Result<()>;

    /// Persist leadership won by election (term bump + leader change).
    async fn on_elected(&self, handler_key: &str, term: Term, leader: NodeId) -> Result<()>;
}

/// Outbound seam: delivers wire step messages to peers.
#[async_trait]
pub trait ReactorSender: Send + Sync + 'static {
    /// Send `message` for `handler_key` to node `to`.
    async fn send(
        &self,
        to: NodeId,
        handler_key: &str,
        message: crate::replica::Message,
    ) -> Result<()>;
}
