//! # Reverb Cluster
//!
//! The replicated-log substrate of the broker: a Raft-derived per-handler
//! state machine, the sub-reactor scheduler that drives many handlers over
//! a fixed task pool, slot-based partitioning with config arbitration, and
//! the node-to-node transport.

/// Channel cluster-config resolution.
pub mod channel_config;

/// Cluster error types.
pub mod error;

/// Handler registry and sub-reactor scheduler.
pub mod reactor;

/// Per-handler replication state machine.
pub mod replica;

/// RPC bodies.
pub mod rpc;

/// Slot management and routing.
pub mod slot;

/// Capability seams.
pub mod traits;

/// Node-to-node transport.
pub mod transport;

pub use crate::{
    channel_config::{ChannelConfigResolver, ResolverOptions},
    error::{ClusterError, Result},
    reactor::{HandlerInfo, Reactor, ReactorOptions},
    replica::{
        Message, MessageKind, Replica, ReplicaConfig, ReplicaEvent, ReplicaOptions, Role,
        StepEnvelope,
    },
    rpc::{ChannelConfigReq, LeaderTermStartIndexReq},
    slot::{cluster_to_replica_config, parse_slot_key, ConfigListener, SlotManager, SlotOptions},
    traits::{HandlerStorage, ReactorRequest, ReactorSender, RoleTransition},
    transport::{
        paths, MemoryMesh, MemoryTransport, NodeTransport, StepSender, TcpTransport,
        TransportService,
    },
};
