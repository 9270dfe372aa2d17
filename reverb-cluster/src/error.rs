//! Cluster error types.
//!
//! `propose_and_wait` callers receive one of the classified proposal
//! errors; everything transport-shaped names the peer node so operators
//! can see which link failed.

use reverb_core::NodeId;
use thiserror::Error;

/// Errors produced by the reactor, resolver, and transport layers.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// The proposal did not commit-and-apply before the deadline.
    #[error("proposal timed out after {timeout_ms}ms on {key}")]
    ProposalTimeout {
        /// Handler key the proposal targeted.
        key: String,
        /// Deadline that expired.
        timeout_ms: u64,
    },

    /// The handler's state machine refused the proposal.
    #[error("proposal rejected on {key}: {reason}")]
    ProposalRejected {
        /// Handler key the proposal targeted.
        key: String,
        /// Why it was refused.
        reason: String,
    },

    /// This node does not lead the handler's log.
    #[error("not leader for {key}; leader is {leader}")]
    NotLeader {
        /// Handler key the proposal targeted.
        key: String,
        /// Current leader, zero when unknown.
        leader: NodeId,
    },

    /// No handler is registered under the key.
    #[error("handler not found: {0}")]
    HandlerNotFound(String),

    /// A request to a peer failed and may be retried.
    #[error("transport to node {peer} failed: {details}")]
    Transport {
        /// Peer the request targeted.
        peer: NodeId,
        /// What failed.
        details: String,
    },

    /// A request to a peer did not answer within the request timeout.
    #[error("request to node {peer} timed out on {path}")]
    RequestTimeout {
        /// Peer the request targeted.
        peer: NodeId,
        /// RPC path of the request.
        path: String,
    },

    /// No route to the peer (unknown node id or no address).
    #[error("no route to node {0}")]
    NoRoute(NodeId),

    /// The channel has no resolvable cluster config.
    #[error("no cluster config for {0}")]
    NoConfig(String),

    /// The reactor is shutting down.
    #[error("reactor stopped")]
    Stopped,

    /// Storage error bubbled up from a worker.
    #[error(transparent)]
    Storage(#[from] reverb_storage::StorageError),

    /// Core codec error.
    #[error(transparent)]
    Core(#[from] reverb_core::Error),
}

/// Convenience result alias for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

impl ClusterError {
    /// Whether the caller may retry after backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::RequestTimeout { .. }
                | Self::ProposalTimeout { .. }
                | Self::ProposalRejected { .. }
        )
    }
}
