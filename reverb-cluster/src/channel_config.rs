//! Channel cluster-config resolution.
//!
//! The slot owning a channel arbitrates its config: the slot leader reads
//! or creates the record and every mutation (election result, migration
//! step, learner promotion) is proposed to the slot log, so one consensus
//! group orders all of a channel's config changes. Non-slot-leader nodes
//! fetch configs over RPC and cache the read leader until the slot epoch
//! moves.

use crate::error::{ClusterError, Result};
use crate::rpc::{self, ChannelConfigReq};
use crate::slot::SlotManager;
use crate::traits::RoleTransition;
use crate::transport::{paths, NodeTransport};
use dashmap::DashMap;
use reverb_core::{channel_key, ChannelType, NodeId, Term};
use reverb_storage::{ChannelClusterConfig, MetaStore};
use std::sync::Arc;
use tracing::{debug, info};

/// Resolver options.
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// This node's id.
    pub node_id: NodeId,
    /// Maximum voting replicas per channel.
    pub channel_replica_max_count: usize,
}

/// Loads, creates, and mutates channel cluster configs.
pub struct ChannelConfigResolver {
    opts: ResolverOptions,
    meta: MetaStore,
    slots: Arc<SlotManager>,
    transport: Arc<dyn NodeTransport>,
    /// Read-leader cache, invalidated by slot epoch bumps.
    read_leaders: DashMap<String, (u64, NodeId)>,
}

impl ChannelConfigResolver {
    /// Create a resolver.
    pub fn new(
        opts: ResolverOptions,
        meta: MetaStore,
        slots: Arc<SlotManager>,
        transport: Arc<dyn NodeTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            opts,
            meta,
            slots,
            transport,
            read_leaders: DashMap::new(),
        })
    }

    /// Load the channel's config, creating and persisting one when this
    /// node is the owning slot's leader and none exists yet.
    pub async fn load_or_create(
        &self,
        channel_id: &str,
        channel_type: ChannelType,
    ) -> Result<ChannelClusterConfig> {
        let slot_leader = self.slots.slot_leader_of_channel(channel_id)?;
        if slot_leader == self.opts.node_id {
            if let Some(config) = self.meta.channel_cluster_config(channel_id, channel_type)? {
                return Ok(config);
            }
            let config = self.elect_initial_config(channel_id, channel_type)?;
            info!(
                channel = %channel_key(channel_id, channel_type),
                leader = %config.leader,
                replicas = config.replicas.len(),
                "created channel cluster config"
            );
            self.slots.propose_config_save(&config).await?;
            Ok(config)
        } else {
            let req = ChannelConfigReq {
                channel_id: channel_id.to_string(),
                channel_type,
            };
            let resp = self
                .transport
                .request(slot_leader, paths::CHANNEL_CLUSTER_CONFIG, rpc::encode_bincode(&req)?)
                .await?;
            if resp.is_empty() {
                return Err(ClusterError::NoConfig(channel_key(channel_id, channel_type)));
            }
            rpc::decode_bincode(&resp)
        }
    }

    /// Pick the initial replica set: the slot's own replicas first (its
    /// leader leading the channel too), then remaining peers in stable
    /// order, capped at the configured maximum.
    fn elect_initial_config(
        &self,
        channel_id: &str,
        channel_type: ChannelType,
    ) -> Result<ChannelClusterConfig> {
        let slot = self.slots.slot_id_of_channel(channel_id);
        let state = self
            .slots
            .slot_state(slot)
            .ok_or_else(|| ClusterError::NoConfig(format!("slot-{}", slot)))?;
        let mut replicas = vec![state.leader];
        for replica in &state.replicas {
            if !replicas.contains(replica) {
                replicas.push(*replica);
            }
        }
        for peer in self.slots.peers() {
            if !replicas.contains(&peer) {
                replicas.push(peer);
            }
        }
        replicas.truncate(self.opts.channel_replica_max_count);
        Ok(ChannelClusterConfig {
            channel_id: channel_id.to_string(),
            channel_type: channel_type.as_u8(),
            leader: replicas[0],
            replicas,
            learners: Vec::new(),
            term: Term::new(1),
            migrate_from: NodeId::none(),
            migrate_to: NodeId::none(),
            conf_version: 1,
            replica_max_count: self.opts.channel_replica_max_count as u16,
        })
    }

    /// Channel leader for reads, cached until the slot epoch moves.
    pub async fn leader_of_channel_for_read(
        &self,
        channel_id: &str,
        channel_type: ChannelType,
    ) -> Result<NodeId> {
        let key = channel_key(channel_id, channel_type);
        let epoch = self.slots.epoch();
        if let Some(cached) = self.read_leaders.get(&key) {
            let (cached_epoch, leader) = *cached;
            if cached_epoch == epoch {
                return Ok(leader);
            }
        }
        let config = match self.meta.channel_cluster_config(channel_id, channel_type)? {
            Some(config) => config,
            None => self.load_or_create(channel_id, channel_type).await?,
        };
        self.read_leaders.insert(key, (epoch, config.leader));
        Ok(config.leader)
    }

    /// Leader of the slot owning the channel.
    pub fn slot_leader_of_channel(&self, channel_id: &str) -> Result<NodeId> {
        self.slots.slot_leader_of_channel(channel_id)
    }

    /// Drop a cached read leader (config change observed).
    pub fn invalidate(&self, key: &str) {
        self.read_leaders.remove(key);
    }

    /// Record an election result: the channel's term and leader move
    /// together, arbitrated by the owning slot.
    pub async fn record_election(
        &self,
        channel_id: &str,
        channel_type: ChannelType,
        leader: NodeId,
        term: Term,
    ) -> Result<()> {
        let mut config = self.load_or_create(channel_id, channel_type).await?;
        if config.leader == leader && config.term >= term {
            return Ok(());
        }
        config.leader = leader;
        config.term = config.term.max(term);
        config.conf_version += 1;
        debug!(channel = %channel_key(channel_id, channel_type), leader = %leader, term = %term, "recording election");
        self.slots.propose_config_save(&config).await
    }

    /// Apply a role transition to the channel config and propose the
    /// updated record to the owning slot.
    pub async fn record_transition(
        &self,
        channel_id: &str,
        channel_type: ChannelType,
        transition: RoleTransition,
    ) -> Result<()> {
        let mut config = self.load_or_create(channel_id, channel_type).await?;
        let peer = transition.peer;
        match transition.kind {
            crate::replica::MessageKind::LearnerToFollower => {
                config.learners.retain(|n| *n != peer);
                if !config.replicas.contains(&peer) {
                    config.replicas.push(peer);
                }
            }
            crate::replica::MessageKind::LearnerToLeader
            | crate::replica::MessageKind::FollowerToLeader => {
                config.learners.retain(|n| *n != peer);
                if !config.replicas.contains(&peer) {
                    config.replicas.push(peer);
                }
                let from = config.migrate_from;
                if !from.is_none()
                    && from != peer
                    && config.replicas.len() > usize::from(config.replica_max_count)
                {
                    config.replicas.retain(|n| *n != from);
                }
                config.leader = peer;
                config.term = config.term.next();
            }
            _ => return Ok(()),
        }
        config.migrate_from = NodeId::none();
        config.migrate_to = NodeId::none();
        config.conf_version += 1;
        self.slots.propose_config_save(&config).await
    }

    /// Server side of `/channel/clusterconfig` (runs on the slot leader).
    pub async fn handle_config_fetch(&self, req: ChannelConfigReq) -> Result<ChannelClusterConfig> {
        self.load_or_create(&req.channel_id, req.channel_type).await
    }

    /// Server side of `/channel/clusterconfig/propose` (runs on the slot
    /// leader).
    pub async fn handle_config_propose(&self, config: ChannelClusterConfig) -> Result<()> {
        self.slots.propose_config_save(&config).await
    }
}
