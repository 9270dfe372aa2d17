//! Slot management and routing.
//!
//! Slots statically partition the channel-id space; each slot runs its own
//! consensus group through the shared reactor design and arbitrates the
//! cluster configs of the channels it owns. Slot membership itself is
//! recorded as a cluster-config record under the reserved channel id
//! `slot-N` and every mutation is proposed to that slot's own log, so a
//! single consensus group orders both kinds of config change.

use crate::error::{ClusterError, Result};
use crate::reactor::Reactor;
use crate::replica::ReplicaConfig;
use crate::rpc;
use crate::traits::{HandlerStorage, ReactorRequest, RoleTransition};
use crate::transport::{paths, NodeTransport};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use reverb_core::{fnv1a, slot_key, ChannelType, LogIndex, NodeId, SlotId, Term};
use reverb_storage::{ChannelClusterConfig, Cmd, LogEntry, MessageLogStore, MetaStore, StorageError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{info, warn};

/// Channel type byte used for the reserved `slot-N` config records.
const SLOT_CONFIG_CHANNEL_TYPE: ChannelType = ChannelType::Data;

/// Observer of applied slot-log effects (the broker registers one to
/// refresh channel handlers and invalidate its caches).
pub trait ConfigListener: Send + Sync + 'static {
    /// A config record was applied from a slot log.
    fn on_config_saved(&self, config: &ChannelClusterConfig);

    /// A channel's subscriber set changed (receiver tags must rebuild).
    fn on_subscribers_changed(&self, _channel_id: &str, _channel_type: u8) {}
}

/// Construction options.
#[derive(Debug, Clone)]
pub struct SlotOptions {
    /// This node's id.
    pub node_id: NodeId,
    /// Number of slots.
    pub slot_count: u32,
    /// Maximum voting replicas per slot.
    pub replica_max_count: usize,
    /// Request timeout for slot-log proposals and RPCs.
    pub req_timeout: Duration,
}

/// Owner of slot states and the slot reactor's host surfaces.
pub struct SlotManager {
    opts: SlotOptions,
    peers: RwLock<Vec<NodeId>>,
    states: DashMap<SlotId, ReplicaConfig>,
    /// Cache epoch; bumped on every slot-config change.
    epoch: AtomicU64,
    log_store: MessageLogStore,
    meta: MetaStore,
    transport: Arc<dyn NodeTransport>,
    reactor: RwLock<Option<Arc<Reactor>>>,
    listeners: RwLock<Vec<Arc<dyn ConfigListener>>>,
}

impl SlotManager {
    /// Create the manager and derive the bootstrap slot assignment.
    ///
    /// Persisted slot configs (from a previous run or an applied
    /// migration) take precedence over the deterministic bootstrap.
    pub fn new(
        opts: SlotOptions,
        mut peers: Vec<NodeId>,
        log_store: MessageLogStore,
        meta: MetaStore,
        transport: Arc<dyn NodeTransport>,
    ) -> Arc<Self> {
        peers.sort_unstable();
        peers.dedup();
        let manager = Arc::new(Self {
            opts,
            peers: RwLock::new(peers),
            states: DashMap::new(),
            epoch: AtomicU64::new(1),
            log_store,
            meta,
            transport,
            reactor: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
        });
        manager.bootstrap_states();
        manager
    }

    fn bootstrap_states(&self) {
        let peers = self.peers.read().clone();
        for slot in 0..self.opts.slot_count {
            let persisted = self
                .meta
                .channel_cluster_config(&slot_key(slot), SLOT_CONFIG_CHANNEL_TYPE)
                .ok()
                .flatten();
            let config = match persisted {
                Some(saved) => cluster_to_replica_config(&saved),
                None => initial_slot_config(slot, &peers, self.opts.replica_max_count),
            };
            self.states.insert(slot, config);
        }
    }

    /// Register a config listener.
    pub fn add_listener(&self, listener: Arc<dyn ConfigListener>) {
        self.listeners.write().push(listener);
    }

    /// Attach the slot reactor and register a handler for every slot this
    /// node participates in.
    pub async fn start(self: &Arc<Self>, reactor: Arc<Reactor>) -> Result<()> {
        *self.reactor.write() = Some(reactor.clone());
        for slot in 0..self.opts.slot_count {
            let Some(state) = self.states.get(&slot).map(|s| s.clone()) else {
                continue;
            };
            let member = state.replicas.contains(&self.opts.node_id)
                || state.learners.contains(&self.opts.node_id);
            if !member {
                continue;
            }
            self.ensure_handler(slot).await?;
        }
        Ok(())
    }

    /// Register the handler for `slot` if missing (inbound traffic may
    /// reach a node before its membership does).
    pub async fn ensure_handler(self: &Arc<Self>, slot: SlotId) -> Result<()> {
        let reactor = self.reactor()?;
        if reactor.handler_exists(&slot_key(slot)) {
            return Ok(());
        }
        let storage: Arc<dyn HandlerStorage> = Arc::new(SlotHandlerStorage {
            key: slot_key(slot),
            log_store: self.log_store.clone(),
            meta: self.meta.clone(),
            manager: Arc::downgrade(self),
        });
        reactor.add_handler(&slot_key(slot), storage).await
    }

    fn reactor(&self) -> Result<Arc<Reactor>> {
        self.reactor.read().clone().ok_or(ClusterError::Stopped)
    }

    /// Current cache epoch. Bumps on every slot-config change.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Known peers, sorted.
    pub fn peers(&self) -> Vec<NodeId> {
        self.peers.read().clone()
    }

    /// Slot owning `channel_id`.
    pub fn slot_id_of_channel(&self, channel_id: &str) -> SlotId {
        (fnv1a(channel_id.as_bytes()) % u64::from(self.opts.slot_count)) as SlotId
    }

    /// Current state of `slot`.
    pub fn slot_state(&self, slot: SlotId) -> Option<ReplicaConfig> {
        self.states.get(&slot).map(|s| s.clone())
    }

    /// Leader of the slot owning `channel_id`.
    pub fn slot_leader_of_channel(&self, channel_id: &str) -> Result<NodeId> {
        let slot = self.slot_id_of_channel(channel_id);
        let state = self
            .states
            .get(&slot)
            .ok_or_else(|| ClusterError::NoConfig(format!("slot-{}", slot)))?;
        if state.leader.is_none() {
            return Err(ClusterError::NoConfig(format!("slot-{}", slot)));
        }
        Ok(state.leader)
    }

    /// Whether this node currently leads `slot`.
    pub fn is_slot_leader(&self, slot: SlotId) -> bool {
        self.states
            .get(&slot)
            .map_or(false, |s| s.leader == self.opts.node_id)
    }

    fn owning_slot(&self, channel_id: &str) -> SlotId {
        match parse_slot_key(channel_id) {
            Some(slot) => slot,
            None => self.slot_id_of_channel(channel_id),
        }
    }

    /// Propose an arbitrary metadata command to `slot`'s log. Must run on
    /// the slot leader.
    pub async fn propose_cmd(&self, slot: SlotId, cmd: Cmd) -> Result<()> {
        let state = self
            .states
            .get(&slot)
            .map(|s| s.clone())
            .ok_or_else(|| ClusterError::NoConfig(format!("slot-{}", slot)))?;
        if state.leader != self.opts.node_id {
            return Err(ClusterError::NotLeader {
                key: slot_key(slot),
                leader: state.leader,
            });
        }
        self.reactor()?
            .propose_and_wait(&slot_key(slot), vec![cmd.encode()], self.opts.req_timeout)
            .await?;
        Ok(())
    }

    /// Propose a cluster-config save to the log of the owning slot. Runs
    /// locally when this node leads that slot, otherwise via the slot
    /// leader.
    pub async fn propose_config_save(&self, config: &ChannelClusterConfig) -> Result<()> {
        let slot = self.owning_slot(&config.channel_id);
        let state = self
            .states
            .get(&slot)
            .map(|s| s.clone())
            .ok_or_else(|| ClusterError::NoConfig(format!("slot-{}", slot)))?;
        let cmd = Cmd::channel_cluster_config_save(config).map_err(ClusterError::Storage)?;
        if state.leader == self.opts.node_id {
            self.reactor()?
                .propose_and_wait(&slot_key(slot), vec![cmd.encode()], self.opts.req_timeout)
                .await?;
            Ok(())
        } else {
            let body = rpc::encode_bincode(config)?;
            self.transport
                .request(state.leader, paths::CHANNEL_CLUSTER_CONFIG_PROPOSE, body)
                .await?;
            Ok(())
        }
    }

    /// Applied-side hook: a config record landed from a slot log.
    pub(crate) fn config_applied(&self, config: &ChannelClusterConfig) {
        if let Some(slot) = parse_slot_key(&config.channel_id) {
            let replica_config = cluster_to_replica_config(config);
            let stale = self
                .states
                .get(&slot)
                .map_or(false, |s| s.version > replica_config.version);
            if stale {
                return;
            }
            self.states.insert(slot, replica_config.clone());
            self.epoch.fetch_add(1, Ordering::Release);
            info!(slot, leader = %replica_config.leader, version = replica_config.version, "slot config applied");
            let reactor = self.reactor.read().clone();
            if let Some(reactor) = reactor {
                let key = slot_key(slot);
                let update = replica_config.clone();
                tokio::spawn(async move {
                    let _ = reactor.update_config(&key, update).await;
                });
            }
            // The leader pushes the record to every member, so nodes the
            // slot log has not reached yet (fresh learners) still adopt
            // their membership promptly.
            if replica_config.leader == self.opts.node_id {
                let members: Vec<NodeId> = replica_config
                    .replicas
                    .iter()
                    .chain(replica_config.learners.iter())
                    .copied()
                    .filter(|n| *n != self.opts.node_id)
                    .collect();
                let record = config.clone();
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    for member in members {
                        let Ok(body) = rpc::encode_bincode(&record) else {
                            return;
                        };
                        if let Err(e) = transport.request(member, paths::SLOT_CONFIG_PUSH, body).await {
                            warn!(peer = %member, error = %e, "slot config push failed");
                        }
                    }
                });
            }
        } else {
            self.epoch.fetch_add(1, Ordering::Release);
        }
        for listener in self.listeners.read().iter() {
            listener.on_config_saved(config);
        }
    }

    /// Receiving side of a slot-config push: adopt the record and make
    /// sure the slot handler exists when this node is now a member.
    pub async fn config_pushed(self: &Arc<Self>, config: &ChannelClusterConfig) -> Result<()> {
        let Some(slot) = parse_slot_key(&config.channel_id) else {
            return Ok(());
        };
        self.config_applied(config);
        let member = config.replicas.contains(&self.opts.node_id)
            || config.learners.contains(&self.opts.node_id);
        if member {
            self.ensure_handler(slot).await?;
        }
        Ok(())
    }

    /// Applied-side hook: subscriber membership moved under a channel.
    pub(crate) fn subscribers_changed(&self, channel_id: &str, channel_type: u8) {
        for listener in self.listeners.read().iter() {
            listener.on_subscribers_changed(channel_id, channel_type);
        }
    }

    fn slot_config_record(&self, slot: SlotId, state: &ReplicaConfig) -> ChannelClusterConfig {
        ChannelClusterConfig {
            channel_id: slot_key(slot),
            channel_type: SLOT_CONFIG_CHANNEL_TYPE.as_u8(),
            replicas: state.replicas.clone(),
            learners: state.learners.clone(),
            leader: state.leader,
            term: state.term,
            migrate_from: state.migrate_from,
            migrate_to: state.migrate_to,
            conf_version: state.version,
            replica_max_count: self.opts.replica_max_count as u16,
        }
    }

    /// Begin relocating `slot`'s leadership to `target`. Must run on the
    /// slot leader. The target joins as a learner when it is not already
    /// a replica; the transition completes once it has caught up.
    pub async fn migrate_slot(&self, slot: SlotId, target: NodeId) -> Result<()> {
        let mut state = self
            .states
            .get(&slot)
            .map(|s| s.clone())
            .ok_or_else(|| ClusterError::NoConfig(format!("slot-{}", slot)))?;
        if state.leader != self.opts.node_id {
            return Err(ClusterError::NotLeader {
                key: slot_key(slot),
                leader: state.leader,
            });
        }
        if state.leader == target {
            return Ok(());
        }
        state.migrate_from = state.leader;
        state.migrate_to = target;
        if !state.replicas.contains(&target) && !state.learners.contains(&target) {
            state.learners.push(target);
        }
        state.version += 1;
        let record = self.slot_config_record(slot, &state);
        self.propose_config_save(&record).await
    }

    /// Admit `node` to the cluster: remember it and offer it as a learner
    /// on every under-replicated slot this node leads.
    pub async fn node_join(&self, node: NodeId) -> Result<()> {
        {
            let mut peers = self.peers.write();
            if !peers.contains(&node) {
                peers.push(node);
                peers.sort_unstable();
            }
        }
        for slot in 0..self.opts.slot_count {
            let Some(mut state) = self.states.get(&slot).map(|s| s.clone()) else {
                continue;
            };
            if state.leader != self.opts.node_id {
                continue;
            }
            if state.replicas.contains(&node) || state.learners.contains(&node) {
                continue;
            }
            if state.replicas.len() >= self.opts.replica_max_count {
                continue;
            }
            state.learners.push(node);
            state.version += 1;
            let record = self.slot_config_record(slot, &state);
            self.propose_config_save(&record).await?;
        }
        Ok(())
    }

    fn complete_transition(&self, slot: SlotId, transition: RoleTransition) -> Option<ChannelClusterConfig> {
        let mut state = self.states.get(&slot).map(|s| s.clone())?;
        let peer = transition.peer;
        match transition.kind {
            crate::replica::MessageKind::LearnerToFollower => {
                state.learners.retain(|n| *n != peer);
                if !state.replicas.contains(&peer) {
                    state.replicas.push(peer);
                }
            }
            crate::replica::MessageKind::LearnerToLeader
            | crate::replica::MessageKind::FollowerToLeader => {
                state.learners.retain(|n| *n != peer);
                if !state.replicas.contains(&peer) {
                    state.replicas.push(peer);
                }
                let from = state.migrate_from;
                if !from.is_none()
                    && from != peer
                    && state.replicas.len() > self.opts.replica_max_count
                {
                    state.replicas.retain(|n| *n != from);
                }
                state.leader = peer;
                state.term = state.term.next();
            }
            _ => return None,
        }
        state.migrate_from = NodeId::none();
        state.migrate_to = NodeId::none();
        state.version += 1;
        Some(self.slot_config_record(slot, &state))
    }
}

#[async_trait]
impl ReactorRequest for SlotManager {
    async fn get_config(&self, handler_key: &str) -> Result<Option<ReplicaConfig>> {
        let Some(slot) = parse_slot_key(handler_key) else {
            return Err(ClusterError::NoConfig(handler_key.to_string()));
        };
        Ok(self.states.get(&slot).map(|s| s.clone()))
    }

    async fn get_leader_term_start_index(
        &self,
        handler_key: &str,
        leader: NodeId,
        term: Term,
    ) -> Result<LogIndex> {
        if leader == self.opts.node_id {
            return Ok(rpc::serve_leader_term_start_index(&self.log_store, handler_key, term));
        }
        let req = rpc::LeaderTermStartIndexReq {
            handler_key: handler_key.to_string(),
            leader_id: leader,
            term,
        };
        let resp = self
            .transport
            .request(leader, paths::CHANNEL_LEADER_TERM_START_INDEX, req.encode())
            .await?;
        rpc::decode_index_response(&resp)
    }

    async fn append_logs(&self, handler_key: &str, entries: &[LogEntry]) -> Result<()> {
        match self.log_store.append_logs(handler_key, entries) {
            Ok(()) => Ok(()),
            Err(e @ StorageError::NonContiguousAppend { .. }) => {
                // Indices are assigned by the proposer; a gap is a bug.
                panic!("slot log append contract violated: {}", e);
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn role_transition(&self, handler_key: &str, transition: RoleTransition) -> Result<()> {
        let Some(slot) = parse_slot_key(handler_key) else {
            return Err(ClusterError::NoConfig(handler_key.to_string()));
        };
        let Some(record) = self.complete_transition(slot, transition) else {
            return Ok(());
        };
        self.propose_config_save(&record).await
    }

    async fn on_elected(&self, handler_key: &str, term: Term, leader: NodeId) -> Result<()> {
        let Some(slot) = parse_slot_key(handler_key) else {
            return Err(ClusterError::NoConfig(handler_key.to_string()));
        };
        let Some(mut state) = self.states.get(&slot).map(|s| s.clone()) else {
            return Err(ClusterError::NoConfig(handler_key.to_string()));
        };
        if state.term >= term && state.leader == leader {
            return Ok(());
        }
        state.leader = leader;
        state.term = term;
        state.version += 1;
        let record = self.slot_config_record(slot, &state);
        // Adopt locally first so the new leader accepts the proposal even
        // before the save replicates.
        self.config_applied(&record);
        self.propose_config_save(&record).await
    }
}

/// Storage surface of one slot handler: the shared log store plus the
/// metadata apply layer.
struct SlotHandlerStorage {
    key: String,
    log_store: MessageLogStore,
    meta: MetaStore,
    manager: Weak<SlotManager>,
}

#[async_trait]
impl HandlerStorage for SlotHandlerStorage {
    fn last_index(&self) -> Result<LogIndex> {
        Ok(self.log_store.last_index(&self.key))
    }

    fn last_term(&self) -> Result<Term> {
        Ok(self.log_store.last_term(&self.key)?)
    }

    fn applied_index(&self) -> Result<LogIndex> {
        Ok(self.log_store.applied_index(&self.key))
    }

    fn committed_index(&self) -> Result<LogIndex> {
        Ok(self.log_store.committed_index(&self.key))
    }

    fn set_committed_index(&self, index: LogIndex) -> Result<()> {
        self.log_store.set_committed_index(&self.key, index);
        Ok(())
    }

    fn leader_last_term(&self) -> Result<Term> {
        Ok(self.log_store.leader_last_term(&self.key))
    }

    fn leader_term_start_index(&self, term: Term) -> Result<LogIndex> {
        Ok(self.log_store.leader_term_start_index(&self.key, term))
    }

    fn set_leader_term_start_index(&self, term: Term, index: LogIndex) -> Result<()> {
        self.log_store.set_leader_term_start_index(&self.key, term, index);
        Ok(())
    }

    fn delete_leader_term_start_index_greater_than_term(&self, term: Term) -> Result<()> {
        self.log_store
            .delete_leader_term_start_index_greater_than_term(&self.key, term);
        Ok(())
    }

    fn logs(&self, start: LogIndex, end_exclusive: LogIndex) -> Result<Vec<LogEntry>> {
        Ok(self.log_store.logs(&self.key, start, end_exclusive)?)
    }

    fn truncate_logs_to(&self, index: LogIndex) -> Result<()> {
        Ok(self.log_store.truncate_logs_to(&self.key, index)?)
    }

    async fn apply_logs(&self, start: LogIndex, end_exclusive: LogIndex) -> Result<u64> {
        let applied = self.log_store.applied_index(&self.key);
        // Idempotence: never re-execute below the watermark.
        let start = start.max(applied + 1);
        if start >= end_exclusive {
            return Ok(0);
        }
        let entries = self.log_store.logs(&self.key, start, end_exclusive)?;
        let mut non_noop = Vec::with_capacity(entries.len());
        for entry in &entries {
            if !entry.data.is_empty() {
                non_noop.push(entry.clone());
            }
        }
        let applied_bytes = self.meta.apply_slot_logs(&self.key, &non_noop)?;
        self.log_store.set_applied_index(&self.key, end_exclusive - 1);

        // Applied effects fan out to the manager once they are durable.
        if let Some(manager) = self.manager.upgrade() {
            for entry in &non_noop {
                let Ok(cmd) = Cmd::decode(entry.data.clone()) else {
                    continue;
                };
                match cmd.cmd_type {
                    reverb_storage::CmdType::ChannelClusterConfigSave => {
                        match cmd.decode_payload::<ChannelClusterConfig>() {
                            Ok(config) => manager.config_applied(&config),
                            Err(e) => warn!(key = %self.key, error = %e, "undecodable config save"),
                        }
                    }
                    reverb_storage::CmdType::AddSubscribers
                    | reverb_storage::CmdType::RemoveSubscribers => {
                        if let Ok(p) = cmd.decode_payload::<reverb_storage::cmd::ChannelUids>() {
                            manager.subscribers_changed(&p.channel_id, p.channel_type.as_u8());
                        }
                    }
                    reverb_storage::CmdType::RemoveAllSubscribers => {
                        if let Ok(p) = cmd.decode_payload::<reverb_storage::cmd::ChannelRef>() {
                            manager.subscribers_changed(&p.channel_id, p.channel_type.as_u8());
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(applied_bytes)
    }
}

/// Parse the slot id out of a reserved `slot-N` key.
pub fn parse_slot_key(key: &str) -> Option<SlotId> {
    key.strip_prefix("slot-")?.parse().ok()
}

/// Project a persisted cluster-config record into the replica view.
pub fn cluster_to_replica_config(config: &ChannelClusterConfig) -> ReplicaConfig {
    ReplicaConfig {
        replicas: config.replicas.clone(),
        learners: config.learners.clone(),
        leader: config.leader,
        term: config.term,
        migrate_from: config.migrate_from,
        migrate_to: config.migrate_to,
        version: config.conf_version,
    }
}

/// Deterministic bootstrap assignment: replicas rotate through the sorted
/// peer list so load spreads evenly, and the first replica leads.
fn initial_slot_config(slot: SlotId, peers: &[NodeId], replica_max_count: usize) -> ReplicaConfig {
    if peers.is_empty() {
        return ReplicaConfig::default();
    }
    let count = replica_max_count.min(peers.len());
    let mut replicas = Vec::with_capacity(count);
    for offset in 0..count {
        replicas.push(peers[(slot as usize + offset) % peers.len()]);
    }
    ReplicaConfig {
        leader: replicas[0],
        replicas,
        learners: Vec::new(),
        term: Term::new(1),
        migrate_from: NodeId::none(),
        migrate_to: NodeId::none(),
        version: 1,
    }
}
