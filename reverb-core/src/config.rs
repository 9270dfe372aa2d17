//! Node configuration.
//!
//! Plain serde structs with defaults and a `validate()` pass; the embedding
//! host decides where the values come from (file, env, flags).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const fn default_reactor_sub_count() -> usize {
    16
}
const fn default_slot_count() -> u32 {
    64
}
const fn default_channel_replica_max_count() -> usize {
    3
}
const fn default_slot_replica_max_count() -> usize {
    3
}
const fn default_req_timeout_ms() -> u64 {
    3_000
}
const fn default_stage_max_size() -> u64 {
    1024 * 1024 * 2
}
const fn default_tick_interval_ms() -> u64 {
    100
}
const fn default_election_timeout_ticks() -> u64 {
    10
}
const fn default_channel_idle_ttl_ticks() -> u64 {
    18_000
}
const fn default_true() -> bool {
    true
}
const fn default_max_frame_size() -> usize {
    1024 * 1024 * 8
}

/// Cluster and reactor options for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's id. Must be non-zero.
    pub node_id: u64,

    /// Initial peer set as `(node_id, address)` pairs, this node included.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Node ids of the original cluster members. A node joining an
    /// existing cluster lists the founders here (itself excluded) so its
    /// bootstrap slot assignment matches theirs; empty means `peers` are
    /// the founders.
    #[serde(default)]
    pub bootstrap_nodes: Vec<u64>,

    /// Number of sub-reactor loops per reactor.
    #[serde(default = "default_reactor_sub_count")]
    pub reactor_sub_count: usize,

    /// Number of slots the channel-id space is partitioned into.
    #[serde(default = "default_slot_count")]
    pub slot_count: u32,

    /// Maximum replica count for a channel's log.
    #[serde(default = "default_channel_replica_max_count")]
    pub channel_replica_max_count: usize,

    /// Maximum replica count for a slot's log.
    #[serde(default = "default_slot_replica_max_count")]
    pub slot_replica_max_count: usize,

    /// Node-to-node request timeout, also the worker deadline, in millis.
    #[serde(default = "default_req_timeout_ms")]
    pub req_timeout_ms: u64,

    /// Byte budget of one storage batch in the channel pipeline.
    #[serde(default = "default_stage_max_size")]
    pub storage_max_size: u64,

    /// Byte budget of one deliver batch.
    #[serde(default = "default_stage_max_size")]
    pub deliver_max_size: u64,

    /// Byte budget of one forward batch.
    #[serde(default = "default_stage_max_size")]
    pub forward_max_size: u64,

    /// Pause proposals to a handler whose applied index lags its committed
    /// index beyond the slow-down threshold.
    #[serde(default = "default_true")]
    pub auto_slow_down_on: bool,

    /// When true, commit notification waits for apply to finish; when
    /// false (default), commit precedes apply.
    #[serde(default)]
    pub is_committed_after_applied: bool,

    /// Sub-reactor tick interval in millis.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Ticks without leader contact before a follower starts an election.
    #[serde(default = "default_election_timeout_ticks")]
    pub election_timeout_ticks: u64,

    /// Ticks without traffic before an idle channel is evicted.
    #[serde(default = "default_channel_idle_ttl_ticks")]
    pub channel_idle_ttl_ticks: u64,

    /// Upper bound on a single wire frame.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// Address book entry for one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer node id.
    pub node_id: u64,
    /// Peer listen address, `host:port`.
    pub addr: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            peers: Vec::new(),
            bootstrap_nodes: Vec::new(),
            reactor_sub_count: default_reactor_sub_count(),
            slot_count: default_slot_count(),
            channel_replica_max_count: default_channel_replica_max_count(),
            slot_replica_max_count: default_slot_replica_max_count(),
            req_timeout_ms: default_req_timeout_ms(),
            storage_max_size: default_stage_max_size(),
            deliver_max_size: default_stage_max_size(),
            forward_max_size: default_stage_max_size(),
            auto_slow_down_on: true,
            is_committed_after_applied: false,
            tick_interval_ms: default_tick_interval_ms(),
            election_timeout_ticks: default_election_timeout_ticks(),
            channel_idle_ttl_ticks: default_channel_idle_ttl_ticks(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl NodeConfig {
    /// Create a config for the given node id with defaults everywhere else.
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id,
            ..Self::default()
        }
    }

    /// Request timeout as a [`Duration`].
    pub fn req_timeout(&self) -> Duration {
        Duration::from_millis(self.req_timeout_ms)
    }

    /// Tick interval as a [`Duration`].
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(Error::InvalidConfig("node_id must be non-zero".into()));
        }
        if self.reactor_sub_count == 0 {
            return Err(Error::InvalidConfig(
                "reactor_sub_count must be at least 1".into(),
            ));
        }
        if self.slot_count == 0 {
            return Err(Error::InvalidConfig("slot_count must be at least 1".into()));
        }
        if self.channel_replica_max_count == 0 || self.slot_replica_max_count == 0 {
            return Err(Error::InvalidConfig(
                "replica max counts must be at least 1".into(),
            ));
        }
        if self.election_timeout_ticks < 2 {
            return Err(Error::InvalidConfig(
                "election_timeout_ticks must be at least 2".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let cfg = NodeConfig::new(1);
        cfg.validate().unwrap();
        assert_eq!(cfg.req_timeout(), Duration::from_millis(3_000));
        assert!(!cfg.is_committed_after_applied);
        assert!(cfg.auto_slow_down_on);
    }

    #[test]
    fn test_zero_node_id_rejected() {
        let cfg = NodeConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_sub_count_rejected() {
        let cfg = NodeConfig {
            reactor_sub_count: 0,
            ..NodeConfig::new(1)
        };
        assert!(cfg.validate().is_err());
    }
}
