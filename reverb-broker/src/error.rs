//! Broker error types.

use thiserror::Error;

/// Errors produced by the channel pipeline and broker wiring.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The channel key or type could not be parsed.
    #[error("bad channel key: {0}")]
    BadChannelKey(String),

    /// Payload decryption failed; the message is dropped.
    #[error("decrypt failed for message {message_id}: {details}")]
    Decrypt {
        /// Message that failed.
        message_id: u64,
        /// What failed.
        details: String,
    },

    /// The send was rejected by the permission check.
    #[error("send rejected on {channel}: {reason}")]
    SendRejected {
        /// Channel key.
        channel: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The broker is shutting down.
    #[error("broker stopped")]
    Stopped,

    /// Cluster layer error.
    #[error(transparent)]
    Cluster(#[from] reverb_cluster::ClusterError),

    /// Storage layer error.
    #[error(transparent)]
    Storage(#[from] reverb_storage::StorageError),

    /// Core codec error.
    #[error(transparent)]
    Core(#[from] reverb_core::Error),
}

/// Convenience result alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
