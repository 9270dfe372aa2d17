//! Node assembly.
//!
//! A [`Broker`] wires one node: the KV engine and stores, the slot
//! manager with its reactor, the channel replication reactor, the channel
//! pipeline, the receiver-tag manager, and the transport dispatcher that
//! routes inbound RPC paths to all of them.

use crate::channel::ChannelBudgets;
use crate::error::{BrokerError, Result};
use crate::message::{
    ChannelMessage, DeliverBatch, ForwardBatch, MessageIdGenerator, StoredMessage,
};
use crate::pipeline::{ChannelReactor, ChannelSnapshot, PipelineHost, PipelineOptions};
use crate::tag::TagManager;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use reverb_cluster::{
    channel_config::ChannelConfigResolver,
    cluster_to_replica_config, parse_slot_key, paths,
    reactor::{Reactor, ReactorOptions},
    replica::{ReplicaConfig, ReplicaOptions, StepEnvelope},
    rpc, ChannelConfigReq, ClusterError, ConfigListener, HandlerStorage, MemoryMesh,
    MemoryTransport, NodeTransport, ReactorRequest, ResolverOptions, RoleTransition, SlotManager,
    SlotOptions, StepSender, TcpTransport, TransportService,
};
use reverb_core::{
    channel_from_key, channel_key, person_channel_uids, ChannelType, LogIndex, NodeConfig, NodeId,
    SlotId, Term,
};
use reverb_storage::{Cmd, CmdType, Kv, LogEntry, MessageLogStore, MetaStore, StorageError};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Decrypts client payloads. Key management belongs to the listener; the
/// broker only needs the capability.
pub trait PayloadDecryptor: Send + Sync + 'static {
    /// Decrypt one message payload.
    fn decrypt(&self, msg: &ChannelMessage) -> Result<Bytes>;
}

/// Passthrough decryptor for plaintext deployments.
#[derive(Debug, Default)]
pub struct PlainDecryptor;

impl PayloadDecryptor for PlainDecryptor {
    fn decrypt(&self, msg: &ChannelMessage) -> Result<Bytes> {
        Ok(msg.payload.clone())
    }
}

/// Hands delivered messages to locally connected recipients. The
/// connection layer implements this; tests observe it.
pub trait DeliverSink: Send + Sync + 'static {
    /// Deliver `messages` to the local connections of `uids`.
    fn deliver_local(&self, uids: &[String], messages: &[StoredMessage]);
}

/// One node of the messaging cluster.
pub struct Broker {
    config: NodeConfig,
    node_id: NodeId,
    log_store: MessageLogStore,
    meta: MetaStore,
    transport: Arc<dyn NodeTransport>,
    slots: Arc<SlotManager>,
    slot_reactor: Arc<Reactor>,
    channel_reactor: Arc<Reactor>,
    resolver: Arc<ChannelConfigResolver>,
    pipeline: Arc<ChannelReactor>,
    host: Arc<BrokerHost>,
    msg_ids: MessageIdGenerator,
}

impl Broker {
    /// Build a node on an in-process mesh (tests, embedded clusters).
    pub async fn with_mesh(
        config: NodeConfig,
        mesh: Arc<MemoryMesh>,
        sink: Arc<dyn DeliverSink>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let node_id = NodeId::new(config.node_id);
        let service = Arc::new(NodeService::default());
        let transport: Arc<dyn NodeTransport> =
            MemoryTransport::new(node_id, mesh.clone(), config.req_timeout());
        let broker = Self::assemble(config, transport, service.clone(), sink).await?;
        mesh.register(node_id, service);
        Ok(broker)
    }

    /// Build a node listening on TCP. Returns the broker and its bound
    /// address.
    pub async fn with_tcp(
        config: NodeConfig,
        listen_addr: &str,
        sink: Arc<dyn DeliverSink>,
    ) -> Result<(Arc<Self>, String)> {
        config.validate()?;
        let node_id = NodeId::new(config.node_id);
        let service = Arc::new(NodeService::default());
        let peers: Vec<(NodeId, String)> = config
            .peers
            .iter()
            .map(|p| (NodeId::new(p.node_id), p.addr.clone()))
            .collect();
        let dispatcher: Arc<dyn TransportService> = service.clone();
        let transport = TcpTransport::new(
            node_id,
            peers,
            dispatcher,
            config.req_timeout(),
            config.max_frame_size,
        );
        let bound = transport.start(listen_addr).await?;
        let broker = Self::assemble(config, transport, service, sink).await?;
        Ok((broker, bound))
    }

    async fn assemble(
        config: NodeConfig,
        transport: Arc<dyn NodeTransport>,
        service: Arc<NodeService>,
        sink: Arc<dyn DeliverSink>,
    ) -> Result<Arc<Self>> {
        let node_id = NodeId::new(config.node_id);
        let kv = Kv::open();
        let log_store = MessageLogStore::new(kv.clone());
        let meta = MetaStore::new(kv);

        let peers: Vec<NodeId> = if config.bootstrap_nodes.is_empty() {
            config.peers.iter().map(|p| NodeId::new(p.node_id)).collect()
        } else {
            config.bootstrap_nodes.iter().map(|n| NodeId::new(*n)).collect()
        };
        let slots = SlotManager::new(
            SlotOptions {
                node_id,
                slot_count: config.slot_count,
                replica_max_count: config.slot_replica_max_count,
                req_timeout: config.req_timeout(),
            },
            peers,
            log_store.clone(),
            meta.clone(),
            transport.clone(),
        );

        let replica_opts = ReplicaOptions {
            election_timeout_ticks: config.election_timeout_ticks,
            heartbeat_interval_ticks: 2,
            auto_slow_down: config.auto_slow_down_on,
            ..ReplicaOptions::default()
        };
        let slot_reactor = Reactor::new(
            ReactorOptions {
                node_id,
                name: "slot",
                sub_count: config.reactor_sub_count,
                tick_interval: config.tick_interval(),
                req_timeout: config.req_timeout(),
                replica: replica_opts.clone(),
                is_committed_after_applied: config.is_committed_after_applied,
            },
            slots.clone(),
            StepSender::slot(transport.clone()),
        );
        slots.start(slot_reactor.clone()).await?;

        let resolver = ChannelConfigResolver::new(
            ResolverOptions {
                node_id,
                channel_replica_max_count: config.channel_replica_max_count,
            },
            meta.clone(),
            slots.clone(),
            transport.clone(),
        );

        let channel_request = Arc::new(ChannelRequest {
            node_id,
            resolver: resolver.clone(),
            log_store: log_store.clone(),
            transport: transport.clone(),
        });
        let channel_reactor = Reactor::new(
            ReactorOptions {
                node_id,
                name: "channel",
                sub_count: config.reactor_sub_count,
                tick_interval: config.tick_interval(),
                req_timeout: config.req_timeout(),
                replica: replica_opts,
                is_committed_after_applied: config.is_committed_after_applied,
            },
            channel_request,
            StepSender::channel(transport.clone()),
        );

        let default_decryptor: Arc<dyn PayloadDecryptor> = Arc::new(PlainDecryptor);
        let host = Arc::new(BrokerHost {
            node_id,
            req_timeout: config.req_timeout(),
            meta: meta.clone(),
            log_store: log_store.clone(),
            resolver: resolver.clone(),
            slots: slots.clone(),
            channel_reactor: channel_reactor.clone(),
            transport: transport.clone(),
            tags: TagManager::new(),
            tag_keys: DashMap::new(),
            sink,
            decryptor: RwLock::new(default_decryptor),
        });

        let pipeline = ChannelReactor::new(
            PipelineOptions {
                node_id,
                sub_count: config.reactor_sub_count,
                tick_interval: config.tick_interval(),
                idle_ttl_ticks: config.channel_idle_ttl_ticks,
                budgets: ChannelBudgets {
                    storage_max_size: config.storage_max_size,
                    deliver_max_size: config.deliver_max_size,
                    forward_max_size: config.forward_max_size,
                },
            },
            host.clone(),
        );

        let broker = Arc::new(Self {
            msg_ids: MessageIdGenerator::new(node_id),
            config,
            node_id,
            log_store,
            meta,
            transport,
            slots: slots.clone(),
            slot_reactor,
            channel_reactor,
            resolver,
            pipeline,
            host,
        });
        service.install(&broker);
        slots.add_listener(Arc::new(BrokerListener {
            broker: Arc::downgrade(&broker),
        }));
        info!(node = %broker.node_id, "broker assembled");
        Ok(broker)
    }

    /// Replace the payload decryptor (the listener owns key material).
    pub fn set_decryptor(&self, decryptor: Arc<dyn PayloadDecryptor>) {
        *self.host.decryptor.write() = decryptor;
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Node configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The slot manager (admin surface: migrations, joins).
    pub fn slots(&self) -> &Arc<SlotManager> {
        &self.slots
    }

    /// The metadata read surface.
    pub fn meta(&self) -> &MetaStore {
        &self.meta
    }

    /// The per-handler log store.
    pub fn log_store(&self) -> &MessageLogStore {
        &self.log_store
    }

    /// The channel cluster-config resolver.
    pub fn resolver(&self) -> &Arc<ChannelConfigResolver> {
        &self.resolver
    }

    /// The node-to-node transport.
    pub fn transport(&self) -> &Arc<dyn NodeTransport> {
        &self.transport
    }

    /// Replication state of a channel handler.
    pub async fn channel_handler_info(
        &self,
        channel_id: &str,
        channel_type: ChannelType,
    ) -> Option<reverb_cluster::HandlerInfo> {
        self.channel_reactor
            .handler_info(&channel_key(channel_id, channel_type))
            .await
    }

    /// Replication state of a slot handler.
    pub async fn slot_handler_info(&self, slot: SlotId) -> Option<reverb_cluster::HandlerInfo> {
        self.slot_reactor.handler_info(&reverb_core::slot_key(slot)).await
    }

    /// Pipeline cursors of a channel.
    pub async fn channel_snapshot(
        &self,
        channel_id: &str,
        channel_type: ChannelType,
    ) -> Option<ChannelSnapshot> {
        self.pipeline.snapshot(channel_id, channel_type).await
    }

    /// Client ingress: accept a publish onto a channel's pipeline.
    pub async fn propose_send(
        &self,
        from_uid: &str,
        channel_id: &str,
        channel_type: ChannelType,
        payload: Bytes,
        is_encrypt: bool,
    ) -> Result<reverb_core::MessageId> {
        let message_id = self.msg_ids.next_id();
        let message = ChannelMessage {
            message_id,
            index: 0,
            from_uid: from_uid.to_string(),
            from_node: self.node_id,
            channel_id: channel_id.to_string(),
            channel_type,
            payload,
            is_encrypt,
            dropped: false,
        };
        self.pipeline.send(channel_id, channel_type, vec![message]).await?;
        Ok(message_id)
    }

    /// Propose a metadata command to the slot owning `channel_id`. Must
    /// run on that slot's leader.
    pub async fn propose_channel_meta(&self, channel_id: &str, cmd: Cmd) -> Result<()> {
        let slot = self.slots.slot_id_of_channel(channel_id);
        self.slots.propose_cmd(slot, cmd).await?;
        Ok(())
    }

    /// Add subscribers to a channel (arbitrated by its slot).
    pub async fn add_subscribers(
        &self,
        channel_id: &str,
        channel_type: ChannelType,
        uids: Vec<String>,
    ) -> Result<()> {
        let cmd = Cmd::channel_uids(CmdType::AddSubscribers, channel_id, channel_type, uids)?;
        self.propose_channel_meta(channel_id, cmd).await
    }

    fn on_config_saved(&self, config: &reverb_storage::ChannelClusterConfig) {
        if parse_slot_key(&config.channel_id).is_some() {
            return;
        }
        let Some(channel_type) = ChannelType::from_u8(config.channel_type) else {
            return;
        };
        let key = channel_key(&config.channel_id, channel_type);
        self.resolver.invalidate(&key);
        let replica_config = cluster_to_replica_config(config);
        let leader = config.leader;
        let channel_reactor = self.channel_reactor.clone();
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            if channel_reactor.handler_exists(&key) {
                let _ = channel_reactor.update_config(&key, replica_config).await;
            }
            let _ = pipeline.config_changed(&key, leader).await;
        });
    }

    fn on_subscribers_changed(&self, channel_id: &str, channel_type: u8) {
        let Some(channel_type) = ChannelType::from_u8(channel_type) else {
            return;
        };
        let key = channel_key(channel_id, channel_type);
        if let Some((_, tag_key)) = self.host.tag_keys.remove(&key) {
            self.host.tags.remove(&tag_key);
            debug!(channel = %key, "receiver tag invalidated");
        }
    }
}

/// Slot-log listener forwarding applied effects into the broker.
struct BrokerListener {
    broker: std::sync::Weak<Broker>,
}

impl ConfigListener for BrokerListener {
    fn on_config_saved(&self, config: &reverb_storage::ChannelClusterConfig) {
        if let Some(broker) = self.broker.upgrade() {
            broker.on_config_saved(config);
        }
    }

    fn on_subscribers_changed(&self, channel_id: &str, channel_type: u8) {
        if let Some(broker) = self.broker.upgrade() {
            broker.on_subscribers_changed(channel_id, channel_type);
        }
    }
}

// ---------------------------------------------------------------- host

/// Stage host shared by the pipeline and the transport dispatcher.
struct BrokerHost {
    node_id: NodeId,
    req_timeout: std::time::Duration,
    meta: MetaStore,
    log_store: MessageLogStore,
    resolver: Arc<ChannelConfigResolver>,
    slots: Arc<SlotManager>,
    channel_reactor: Arc<Reactor>,
    transport: Arc<dyn NodeTransport>,
    tags: Arc<TagManager>,
    /// Channel key → live tag key.
    tag_keys: DashMap<String, String>,
    sink: Arc<dyn DeliverSink>,
    decryptor: RwLock<Arc<dyn PayloadDecryptor>>,
}

impl BrokerHost {
    /// Register the replication handler for a channel if missing.
    async fn ensure_channel_handler(&self, key: &str) -> Result<()> {
        if self.channel_reactor.handler_exists(key) {
            return Ok(());
        }
        let storage: Arc<dyn HandlerStorage> = Arc::new(ChannelHandlerStorage {
            key: key.to_string(),
            log_store: self.log_store.clone(),
        });
        self.channel_reactor.add_handler(key, storage).await?;
        Ok(())
    }

    /// Build (or fetch) the channel's receiver tag.
    fn receiver_tag(&self, channel_id: &str, channel_type: ChannelType) -> Result<Arc<crate::tag::Tag>> {
        let key = channel_key(channel_id, channel_type);
        if let Some(tag_key) = self.tag_keys.get(&key) {
            if let Some(tag) = self.tags.get(&tag_key) {
                return Ok(tag);
            }
        }
        let subscribers: Vec<String> = if channel_type == ChannelType::Person {
            match person_channel_uids(channel_id) {
                Some((a, b)) => vec![a.to_string(), b.to_string()],
                None => vec![channel_id.to_string()],
            }
        } else {
            self.meta.subscribers(channel_id, channel_type)
        };
        let mut homes = Vec::with_capacity(subscribers.len());
        for uid in subscribers {
            // A user's home is the leader of the slot owning their
            // person channel.
            let home = self.slots.slot_leader_of_channel(&uid)?;
            homes.push((uid, home));
        }
        let tag = self.tags.add_or_update_receiver_tag(homes);
        self.tag_keys.insert(key, tag.key.clone());
        Ok(tag)
    }
}

#[async_trait]
impl PipelineHost for BrokerHost {
    async fn resolve_channel(&self, channel_id: &str, channel_type: ChannelType) -> Result<NodeId> {
        let config = self.resolver.load_or_create(channel_id, channel_type).await?;
        let key = channel_key(channel_id, channel_type);
        let member = config.leader == self.node_id
            || config.replicas.contains(&self.node_id)
            || config.learners.contains(&self.node_id);
        if member {
            self.ensure_channel_handler(&key).await?;
        }
        Ok(config.leader)
    }

    fn decrypt(&self, msg: &ChannelMessage) -> Result<Bytes> {
        self.decryptor.read().decrypt(msg)
    }

    async fn check_permission(&self, msg: &ChannelMessage) -> Result<bool> {
        let (channel_id, channel_type, from) = (&msg.channel_id, msg.channel_type, &msg.from_uid);
        if self.meta.is_system_uid(from) {
            return Ok(true);
        }
        if let Some(info) = self.meta.channel_info(channel_id, channel_type)? {
            if info.ban || info.disband {
                return Ok(false);
            }
        }
        if channel_type == ChannelType::Person {
            // Fake person channels carry both uids in the id; anyone else
            // is an outsider.
            if let Some((a, b)) = person_channel_uids(channel_id) {
                return Ok(from == a || from == b);
            }
            return Ok(true);
        }
        if self.meta.is_denied(channel_id, channel_type, from) {
            return Ok(false);
        }
        if self.meta.has_allowlist(channel_id, channel_type) {
            return Ok(self.meta.is_allowed(channel_id, channel_type, from));
        }
        if channel_type == ChannelType::Group {
            return Ok(self.meta.is_subscriber(channel_id, channel_type, from));
        }
        Ok(true)
    }

    async fn store(&self, key: &str, messages: &[ChannelMessage]) -> Result<()> {
        let mut datas = Vec::with_capacity(messages.len());
        for msg in messages {
            let stored = StoredMessage::from_channel_message(msg);
            let blob = bincode::serialize(&stored)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            datas.push(Bytes::from(blob));
        }
        self.channel_reactor
            .propose_and_wait(key, datas, self.req_timeout)
            .await?;
        Ok(())
    }

    async fn deliver(
        &self,
        channel_id: &str,
        channel_type: ChannelType,
        messages: &[ChannelMessage],
    ) -> Result<()> {
        let tag = self.receiver_tag(channel_id, channel_type)?;
        let stored: Vec<StoredMessage> = messages
            .iter()
            .map(StoredMessage::from_channel_message)
            .collect();
        for group in &tag.node_users {
            if group.node_id == self.node_id {
                self.sink.deliver_local(&group.uids, &stored);
                continue;
            }
            let batch = DeliverBatch {
                channel_id: channel_id.to_string(),
                channel_type,
                uids: group.uids.clone(),
                messages: stored.clone(),
            };
            let body = rpc::encode_bincode(&batch)?;
            self.transport
                .request(group.node_id, paths::CHANNEL_DELIVER, body)
                .await?;
        }
        Ok(())
    }

    async fn forward(
        &self,
        leader: NodeId,
        channel_id: &str,
        channel_type: ChannelType,
        messages: &[ChannelMessage],
    ) -> Result<()> {
        let batch = ForwardBatch {
            channel_id: channel_id.to_string(),
            channel_type,
            messages: messages.iter().map(StoredMessage::from_channel_message).collect(),
            from_node: self.node_id,
        };
        let body = rpc::encode_bincode(&batch)?;
        self.transport
            .request(leader, paths::CHANNEL_PROPOSE_FORWARD, body)
            .await?;
        Ok(())
    }
}

// -------------------------------------------------------------- request

/// [`ReactorRequest`] for the channel replication reactor.
struct ChannelRequest {
    node_id: NodeId,
    resolver: Arc<ChannelConfigResolver>,
    log_store: MessageLogStore,
    transport: Arc<dyn NodeTransport>,
}

#[async_trait]
impl ReactorRequest for ChannelRequest {
    async fn get_config(&self, handler_key: &str) -> reverb_cluster::Result<Option<ReplicaConfig>> {
        let Some((channel_id, channel_type)) = channel_from_key(handler_key) else {
            return Err(ClusterError::NoConfig(handler_key.to_string()));
        };
        let config = self.resolver.load_or_create(&channel_id, channel_type).await?;
        Ok(Some(cluster_to_replica_config(&config)))
    }

    async fn get_leader_term_start_index(
        &self,
        handler_key: &str,
        leader: NodeId,
        term: Term,
    ) -> reverb_cluster::Result<LogIndex> {
        if leader == self.node_id {
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

    async fn append_logs(
        &self,
        handler_key: &str,
        entries: &[LogEntry],
    ) -> reverb_cluster::Result<()> {
        match self.log_store.append_logs(handler_key, entries) {
            Ok(()) => Ok(()),
            Err(e @ StorageError::NonContiguousAppend { .. }) => {
                panic!("channel log append contract violated: {}", e);
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn role_transition(
        &self,
        handler_key: &str,
        transition: RoleTransition,
    ) -> reverb_cluster::Result<()> {
        let Some((channel_id, channel_type)) = channel_from_key(handler_key) else {
            return Err(ClusterError::NoConfig(handler_key.to_string()));
        };
        self.resolver
            .record_transition(&channel_id, channel_type, transition)
            .await
    }

    async fn on_elected(
        &self,
        handler_key: &str,
        term: Term,
        leader: NodeId,
    ) -> reverb_cluster::Result<()> {
        let Some((channel_id, channel_type)) = channel_from_key(handler_key) else {
            return Err(ClusterError::NoConfig(handler_key.to_string()));
        };
        self.resolver
            .record_election(&channel_id, channel_type, leader, term)
            .await
    }
}

// -------------------------------------------------------------- storage

/// Storage surface of one channel's replicated message log. Apply means
/// "visible for delivery": the pipeline drives fan-out from its queue, so
/// apply only advances the watermark.
struct ChannelHandlerStorage {
    key: String,
    log_store: MessageLogStore,
}

#[async_trait]
impl HandlerStorage for ChannelHandlerStorage {
    fn last_index(&self) -> reverb_cluster::Result<LogIndex> {
        Ok(self.log_store.last_index(&self.key))
    }

    fn last_term(&self) -> reverb_cluster::Result<Term> {
        Ok(self.log_store.last_term(&self.key)?)
    }

    fn applied_index(&self) -> reverb_cluster::Result<LogIndex> {
        Ok(self.log_store.applied_index(&self.key))
    }

    fn committed_index(&self) -> reverb_cluster::Result<LogIndex> {
        Ok(self.log_store.committed_index(&self.key))
    }

    fn set_committed_index(&self, index: LogIndex) -> reverb_cluster::Result<()> {
        self.log_store.set_committed_index(&self.key, index);
        Ok(())
    }

    fn leader_last_term(&self) -> reverb_cluster::Result<Term> {
        Ok(self.log_store.leader_last_term(&self.key))
    }

    fn leader_term_start_index(&self, term: Term) -> reverb_cluster::Result<LogIndex> {
        Ok(self.log_store.leader_term_start_index(&self.key, term))
    }

    fn set_leader_term_start_index(&self, term: Term, index: LogIndex) -> reverb_cluster::Result<()> {
        self.log_store.set_leader_term_start_index(&self.key, term, index);
        Ok(())
    }

    fn delete_leader_term_start_index_greater_than_term(&self, term: Term) -> reverb_cluster::Result<()> {
        self.log_store
            .delete_leader_term_start_index_greater_than_term(&self.key, term);
        Ok(())
    }

    fn logs(&self, start: LogIndex, end_exclusive: LogIndex) -> reverb_cluster::Result<Vec<LogEntry>> {
        Ok(self.log_store.logs(&self.key, start, end_exclusive)?)
    }

    fn truncate_logs_to(&self, index: LogIndex) -> reverb_cluster::Result<()> {
        Ok(self.log_store.truncate_logs_to(&self.key, index)?)
    }

    async fn apply_logs(&self, start: LogIndex, end_exclusive: LogIndex) -> reverb_cluster::Result<u64> {
        let applied = self.log_store.applied_index(&self.key);
        let start = start.max(applied + 1);
        if start >= end_exclusive {
            return Ok(0);
        }
        let entries = self.log_store.logs(&self.key, start, end_exclusive)?;
        let bytes = entries.iter().map(|e| e.wire_size() as u64).sum();
        self.log_store.set_applied_index(&self.key, end_exclusive - 1);
        Ok(bytes)
    }
}

// -------------------------------------------------------------- service

/// Transport dispatcher. Installed after assembly; requests arriving
/// before installation answer with a retriable error.
#[derive(Default)]
struct NodeService {
    inner: RwLock<Option<ServiceInner>>,
}

#[derive(Clone)]
struct ServiceInner {
    node_id: NodeId,
    slots: Arc<SlotManager>,
    slot_reactor: Arc<Reactor>,
    channel_reactor: Arc<Reactor>,
    resolver: Arc<ChannelConfigResolver>,
    log_store: MessageLogStore,
    pipeline: Arc<ChannelReactor>,
    host: Arc<BrokerHost>,
    sink: Arc<dyn DeliverSink>,
}

impl NodeService {
    fn install(&self, broker: &Arc<Broker>) {
        *self.inner.write() = Some(ServiceInner {
            node_id: broker.node_id,
            slots: broker.slots.clone(),
            slot_reactor: broker.slot_reactor.clone(),
            channel_reactor: broker.channel_reactor.clone(),
            resolver: broker.resolver.clone(),
            log_store: broker.log_store.clone(),
            pipeline: broker.pipeline.clone(),
            host: broker.host.clone(),
            sink: broker.host.sink.clone(),
        });
    }
}

impl TransportService for NodeService {
    fn handle(&self, path: String, payload: Bytes) -> BoxFuture<'static, reverb_cluster::Result<Bytes>> {
        let inner = self.inner.read().clone();
        Box::pin(async move {
            let Some(inner) = inner else {
                return Err(ClusterError::Stopped);
            };
            inner.dispatch(path, payload).await
        })
    }
}

impl ServiceInner {
    async fn dispatch(&self, path: String, payload: Bytes) -> reverb_cluster::Result<Bytes> {
        match path.as_str() {
            paths::CHANNEL_LEADER_TERM_START_INDEX => {
                let req = rpc::LeaderTermStartIndexReq::decode(payload)?;
                let index =
                    rpc::serve_leader_term_start_index(&self.log_store, &req.handler_key, req.term);
                Ok(rpc::encode_index_response(index))
            }
            paths::CHANNEL_CLUSTER_CONFIG => {
                let req: ChannelConfigReq = rpc::decode_bincode(&payload)?;
                let config = self.resolver.handle_config_fetch(req).await?;
                rpc::encode_bincode(&config)
            }
            paths::CHANNEL_CLUSTER_CONFIG_PROPOSE => {
                let config: reverb_storage::ChannelClusterConfig = rpc::decode_bincode(&payload)?;
                self.resolver.handle_config_propose(config).await?;
                Ok(Bytes::new())
            }
            paths::SLOT_LOG_SYNC | paths::SLOT_LOG_APPEND => {
                let envelope = StepEnvelope::decode(payload)?;
                if let Some(slot) = parse_slot_key(&envelope.handler_key) {
                    let _ = self.slots.ensure_handler(slot).await;
                }
                if let Err(e) = self
                    .slot_reactor
                    .step(&envelope.handler_key, envelope.message)
                    .await
                {
                    debug!(key = %envelope.handler_key, error = %e, "slot step dropped");
                }
                Ok(Bytes::new())
            }
            paths::SLOT_CONFIG_PUSH => {
                let config: reverb_storage::ChannelClusterConfig = rpc::decode_bincode(&payload)?;
                self.slots.config_pushed(&config).await?;
                Ok(Bytes::new())
            }
            paths::CHANNEL_LOG_SYNC | paths::CHANNEL_LOG_APPEND => {
                let envelope = StepEnvelope::decode(payload)?;
                self.host
                    .ensure_channel_handler(&envelope.handler_key)
                    .await
                    .map_err(|e| ClusterError::Transport {
                        peer: self.node_id,
                        details: e.to_string(),
                    })?;
                self.channel_reactor
                    .step(&envelope.handler_key, envelope.message)
                    .await?;
                Ok(Bytes::new())
            }
            paths::CHANNEL_PROPOSE_FORWARD => {
                let batch: ForwardBatch = rpc::decode_bincode(&payload)?;
                let messages: Vec<ChannelMessage> = batch
                    .messages
                    .iter()
                    .map(|stored| ChannelMessage {
                        message_id: stored.message_id,
                        index: 0,
                        from_uid: stored.from_uid.clone(),
                        from_node: batch.from_node,
                        channel_id: batch.channel_id.clone(),
                        channel_type: batch.channel_type,
                        payload: Bytes::from(stored.payload.clone()),
                        is_encrypt: false,
                        dropped: false,
                    })
                    .collect();
                self.pipeline
                    .send(&batch.channel_id, batch.channel_type, messages)
                    .await
                    .map_err(|e| ClusterError::Transport {
                        peer: self.node_id,
                        details: e.to_string(),
                    })?;
                Ok(Bytes::new())
            }
            paths::CHANNEL_DELIVER => {
                let batch: DeliverBatch = rpc::decode_bincode(&payload)?;
                self.sink.deliver_local(&batch.uids, &batch.messages);
                Ok(Bytes::new())
            }
            other => {
                warn!(path = %other, "unknown rpc path");
                Err(ClusterError::Core(reverb_core::Error::Decode(format!(
                    "unknown path {}",
                    other
                ))))
            }
        }
    }
}
