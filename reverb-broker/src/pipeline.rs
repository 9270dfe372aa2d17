//! The channel pipeline reactor.
//!
//! Channels shard across a fixed pool of single-threaded sub loops, the
//! same scheduling shape as the replication reactor: each loop drains its
//! channels' `ready()` batches and hands stage work to detached tasks; the
//! results re-enter as events, so per-channel stage transitions stay
//! totally ordered.

use crate::channel::{Channel, ChannelAction, ChannelBudgets, ChannelRole, ChannelStatus};
use crate::error::{BrokerError, Result};
use crate::message::ChannelMessage;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use reverb_core::{channel_key, fnv1a, ChannelType, NodeId};
use reverb_cluster::ClusterError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Per-sub inbound queue depth.
const SUB_QUEUE_DEPTH: usize = 4096;

/// Host surface the pipeline drives its stages through.
#[async_trait]
pub trait PipelineHost: Send + Sync + 'static {
    /// Resolve the channel's leader, registering the local replication
    /// handler when this node is a member. Returns the leader node.
    async fn resolve_channel(&self, channel_id: &str, channel_type: ChannelType) -> Result<NodeId>;

    /// Decrypt one payload.
    fn decrypt(&self, msg: &ChannelMessage) -> Result<Bytes>;

    /// Whether the sender may publish to the channel.
    async fn check_permission(&self, msg: &ChannelMessage) -> Result<bool>;

    /// Propose the batch to the channel's replicated log and wait for
    /// commit.
    async fn store(&self, key: &str, messages: &[ChannelMessage]) -> Result<()>;

    /// Fan the batch out to subscribers.
    async fn deliver(
        &self,
        channel_id: &str,
        channel_type: ChannelType,
        messages: &[ChannelMessage],
    ) -> Result<()>;

    /// Ship the batch to the channel leader.
    async fn forward(
        &self,
        leader: NodeId,
        channel_id: &str,
        channel_type: ChannelType,
        messages: &[ChannelMessage],
    ) -> Result<()>;
}

/// Pipeline construction options.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// This node's id.
    pub node_id: NodeId,
    /// Number of channel sub loops.
    pub sub_count: usize,
    /// Tick interval.
    pub tick_interval: Duration,
    /// Ticks without traffic before an idle channel is evicted.
    pub idle_ttl_ticks: u64,
    /// Stage byte budgets.
    pub budgets: ChannelBudgets,
}

/// Cursor snapshot for observability and tests.
#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    /// Current role.
    pub role: ChannelRole,
    /// Channel leader.
    pub leader: NodeId,
    /// Newest accepted index.
    pub last_index: u64,
    /// Deliver done cursor.
    pub delivered_index: u64,
    /// Forward done cursor.
    pub forwarded_index: u64,
}

enum PipelineEvent {
    Send {
        channel_id: String,
        channel_type: ChannelType,
        messages: Vec<ChannelMessage>,
    },
    InitResult {
        key: String,
        leader: Result<NodeId>,
    },
    DecryptResult {
        key: String,
        last_index: u64,
        decrypted: Vec<(u64, Bytes)>,
        dropped: Vec<u64>,
    },
    PermissionResult {
        key: String,
        last_index: u64,
        rejected: Vec<u64>,
        ok: bool,
    },
    StorageResult {
        key: String,
        last_index: u64,
        ok: bool,
        not_leader: bool,
    },
    DeliverResult {
        key: String,
        last_index: u64,
        ok: bool,
    },
    ForwardResult {
        key: String,
        last_index: u64,
        ok: bool,
    },
    ConfigChanged {
        key: String,
        leader: NodeId,
    },
    Snapshot {
        key: String,
        reply: oneshot::Sender<Option<ChannelSnapshot>>,
    },
}

struct PipelineShared {
    opts: PipelineOptions,
    host: Arc<dyn PipelineHost>,
}

/// The channel pipeline scheduler.
pub struct ChannelReactor {
    shared: Arc<PipelineShared>,
    subs: Vec<mpsc::Sender<PipelineEvent>>,
    registry: Arc<DashMap<String, ()>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ChannelReactor {
    /// Create and start the pipeline loops.
    pub fn new(opts: PipelineOptions, host: Arc<dyn PipelineHost>) -> Arc<Self> {
        let shared = Arc::new(PipelineShared { opts, host });
        let registry = Arc::new(DashMap::new());
        let mut subs = Vec::with_capacity(shared.opts.sub_count);
        let mut tasks = Vec::with_capacity(shared.opts.sub_count);
        for _ in 0..shared.opts.sub_count {
            let (tx, rx) = mpsc::channel(SUB_QUEUE_DEPTH);
            let sub = PipelineSub {
                shared: shared.clone(),
                rx,
                tx: tx.clone(),
                registry: registry.clone(),
                channels: HashMap::new(),
            };
            tasks.push(tokio::spawn(sub.run()));
            subs.push(tx);
        }
        Arc::new(Self {
            shared,
            subs,
            registry,
            tasks: Mutex::new(tasks),
        })
    }

    fn sub_of(&self, key: &str) -> &mpsc::Sender<PipelineEvent> {
        let idx = (fnv1a(key.as_bytes()) % self.subs.len() as u64) as usize;
        &self.subs[idx]
    }

    /// Enqueue publishes on a channel, creating it on first use.
    pub async fn send(
        &self,
        channel_id: &str,
        channel_type: ChannelType,
        messages: Vec<ChannelMessage>,
    ) -> Result<()> {
        let key = channel_key(channel_id, channel_type);
        self.sub_of(&key)
            .send(PipelineEvent::Send {
                channel_id: channel_id.to_string(),
                channel_type,
                messages,
            })
            .await
            .map_err(|_| BrokerError::Stopped)
    }

    /// A channel's cluster config changed; re-derive its role.
    pub async fn config_changed(&self, key: &str, leader: NodeId) -> Result<()> {
        if !self.registry.contains_key(key) {
            return Ok(());
        }
        self.sub_of(key)
            .send(PipelineEvent::ConfigChanged {
                key: key.to_string(),
                leader,
            })
            .await
            .map_err(|_| BrokerError::Stopped)
    }

    /// Snapshot one channel's cursors.
    pub async fn snapshot(&self, channel_id: &str, channel_type: ChannelType) -> Option<ChannelSnapshot> {
        let key = channel_key(channel_id, channel_type);
        let (reply, rx) = oneshot::channel();
        self.sub_of(&key)
            .send(PipelineEvent::Snapshot { key, reply })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Number of live channels.
    pub fn channel_len(&self) -> usize {
        self.registry.len()
    }

    /// Stop the pipeline loops.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for ChannelReactor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PipelineSub {
    shared: Arc<PipelineShared>,
    rx: mpsc::Receiver<PipelineEvent>,
    tx: mpsc::Sender<PipelineEvent>,
    registry: Arc<DashMap<String, ()>>,
    channels: HashMap<String, Channel>,
}

impl PipelineSub {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.shared.opts.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.on_tick(),
                event = self.rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event);
                    while let Ok(event) = self.rx.try_recv() {
                        self.handle_event(event);
                    }
                }
            }
        }
    }

    fn on_tick(&mut self) {
        let ttl = self.shared.opts.idle_ttl_ticks;
        let mut evict = Vec::new();
        for (key, channel) in self.channels.iter_mut() {
            channel.idle_ticks += 1;
            if channel.queue.is_empty() && channel.idle_ticks > ttl {
                evict.push(key.clone());
            }
        }
        for key in evict {
            self.channels.remove(&key);
            self.registry.remove(&key);
            debug!(channel = %key, "idle channel evicted");
        }
        let keys: Vec<String> = self.channels.keys().cloned().collect();
        for key in keys {
            self.drive(&key);
        }
    }

    fn handle_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Send {
                channel_id,
                channel_type,
                messages,
            } => {
                let key = channel_key(&channel_id, channel_type);
                let budgets = self.shared.opts.budgets.clone();
                let channel = self
                    .channels
                    .entry(key.clone())
                    .or_insert_with(|| Channel::new(&channel_id, channel_type, budgets));
                self.registry.insert(key.clone(), ());
                for message in messages {
                    channel.queue.append(message);
                }
                channel.idle_ticks = 0;
                self.drive(&key);
            }
            PipelineEvent::InitResult { key, leader } => {
                let local = self.shared.opts.node_id;
                if let Some(channel) = self.channels.get_mut(&key) {
                    match leader {
                        Ok(leader) => channel.on_init(leader, local),
                        Err(e) => {
                            warn!(channel = %key, error = %e, "channel init failed");
                            channel.on_init_failed();
                        }
                    }
                }
                self.drive(&key);
            }
            PipelineEvent::DecryptResult {
                key,
                last_index,
                decrypted,
                dropped,
            } => {
                if let Some(channel) = self.channels.get_mut(&key) {
                    for (index, payload) in decrypted {
                        channel.queue.set_decrypted(index, payload);
                    }
                    for index in dropped {
                        channel.queue.mark_dropped(index);
                    }
                    channel.on_decrypted(last_index);
                }
                self.drive(&key);
            }
            PipelineEvent::PermissionResult {
                key,
                last_index,
                rejected,
                ok,
            } => {
                if let Some(channel) = self.channels.get_mut(&key) {
                    if ok {
                        for index in rejected {
                            channel.queue.mark_dropped(index);
                        }
                        channel.on_permission_checked(last_index);
                    } else {
                        channel.on_permission_failed();
                    }
                }
                self.drive(&key);
            }
            PipelineEvent::StorageResult {
                key,
                last_index,
                ok,
                not_leader,
            } => {
                if let Some(channel) = self.channels.get_mut(&key) {
                    if ok {
                        channel.on_stored(last_index);
                    } else if not_leader {
                        // Role changed under us; resolve again and
                        // re-propose on the new leader.
                        channel.on_store_failed();
                        channel.status = ChannelStatus::Uninitialized;
                    } else {
                        channel.on_store_failed();
                    }
                }
                self.drive(&key);
            }
            PipelineEvent::DeliverResult { key, last_index, ok } => {
                if let Some(channel) = self.channels.get_mut(&key) {
                    if ok {
                        channel.on_delivered(last_index);
                    } else {
                        channel.on_deliver_failed();
                    }
                }
                self.drive(&key);
            }
            PipelineEvent::ForwardResult { key, last_index, ok } => {
                if let Some(channel) = self.channels.get_mut(&key) {
                    if ok {
                        channel.on_forwarded(last_index);
                    } else {
                        channel.on_forward_failed();
                    }
                }
                self.drive(&key);
            }
            PipelineEvent::ConfigChanged { key, leader } => {
                let local = self.shared.opts.node_id;
                if let Some(channel) = self.channels.get_mut(&key) {
                    if !channel.is_initialized() {
                        return;
                    }
                    let new_role = if leader == local {
                        ChannelRole::Leader
                    } else {
                        ChannelRole::Proxy
                    };
                    if channel.role != new_role || channel.leader != leader {
                        if new_role == ChannelRole::Leader {
                            channel.become_leader();
                        } else {
                            channel.become_proxy(leader);
                        }
                    }
                }
                self.drive(&key);
            }
            PipelineEvent::Snapshot { key, reply } => {
                let snapshot = self.channels.get(&key).map(|c| ChannelSnapshot {
                    role: c.role,
                    leader: c.leader,
                    last_index: c.queue.last_index,
                    delivered_index: c.queue.delivered_index,
                    forwarded_index: c.queue.forwarded_index,
                });
                let _ = reply.send(snapshot);
            }
        }
    }

    fn drive(&mut self, key: &str) {
        let actions = match self.channels.get_mut(key) {
            Some(channel) if channel.has_ready() => channel.ready(),
            _ => return,
        };
        let (channel_id, channel_type) = match self.channels.get(key) {
            Some(c) => (c.channel_id.clone(), c.channel_type),
            None => return,
        };
        for action in actions {
            self.launch(key, &channel_id, channel_type, action);
        }
    }

    fn launch(&self, key: &str, channel_id: &str, channel_type: ChannelType, action: ChannelAction) {
        let host = self.shared.host.clone();
        let tx = self.tx.clone();
        let key = key.to_string();
        let channel_id = channel_id.to_string();
        match action {
            ChannelAction::Init => {
                tokio::spawn(async move {
                    let leader = host.resolve_channel(&channel_id, channel_type).await;
                    let _ = tx.send(PipelineEvent::InitResult { key, leader }).await;
                });
            }
            ChannelAction::Decrypt { messages } => {
                tokio::spawn(async move {
                    let last_index = messages.last().map_or(0, |m| m.index);
                    let mut decrypted = Vec::new();
                    let mut dropped = Vec::new();
                    for msg in &messages {
                        if !msg.is_encrypt || msg.dropped {
                            continue;
                        }
                        match host.decrypt(msg) {
                            Ok(payload) => decrypted.push((msg.index, payload)),
                            Err(e) => {
                                warn!(channel = %key, message_id = msg.message_id, error = %e, "decrypt failed, dropping");
                                dropped.push(msg.index);
                            }
                        }
                    }
                    let _ = tx
                        .send(PipelineEvent::DecryptResult {
                            key,
                            last_index,
                            decrypted,
                            dropped,
                        })
                        .await;
                });
            }
            ChannelAction::PermissionCheck { messages } => {
                tokio::spawn(async move {
                    let last_index = messages.last().map_or(0, |m| m.index);
                    let mut rejected = Vec::new();
                    let mut ok = true;
                    for msg in &messages {
                        if msg.dropped {
                            continue;
                        }
                        match host.check_permission(msg).await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(channel = %key, from = %msg.from_uid, "send rejected by permission check");
                                rejected.push(msg.index);
                            }
                            Err(e) => {
                                warn!(channel = %key, error = %e, "permission check failed");
                                ok = false;
                                break;
                            }
                        }
                    }
                    let _ = tx
                        .send(PipelineEvent::PermissionResult {
                            key,
                            last_index,
                            rejected,
                            ok,
                        })
                        .await;
                });
            }
            ChannelAction::Storage { messages } => {
                tokio::spawn(async move {
                    let last_index = messages.last().map_or(0, |m| m.index);
                    let survivors: Vec<ChannelMessage> =
                        messages.into_iter().filter(|m| !m.dropped).collect();
                    let result = if survivors.is_empty() {
                        Ok(())
                    } else {
                        host.store(&key, &survivors).await
                    };
                    let (ok, not_leader) = match &result {
                        Ok(()) => (true, false),
                        Err(BrokerError::Cluster(ClusterError::NotLeader { .. })) => (false, true),
                        Err(e) => {
                            warn!(channel = %key, error = %e, "storage stage failed");
                            (false, false)
                        }
                    };
                    let _ = tx
                        .send(PipelineEvent::StorageResult {
                            key,
                            last_index,
                            ok,
                            not_leader,
                        })
                        .await;
                });
            }
            ChannelAction::Deliver { messages } => {
                tokio::spawn(async move {
                    let last_index = messages.last().map_or(0, |m| m.index);
                    let survivors: Vec<ChannelMessage> =
                        messages.into_iter().filter(|m| !m.dropped).collect();
                    let result = if survivors.is_empty() {
                        Ok(())
                    } else {
                        host.deliver(&channel_id, channel_type, &survivors).await
                    };
                    if let Err(e) = &result {
                        warn!(channel = %key, error = %e, "deliver stage failed");
                    }
                    let _ = tx
                        .send(PipelineEvent::DeliverResult {
                            key,
                            last_index,
                            ok: result.is_ok(),
                        })
                        .await;
                });
            }
            ChannelAction::Forward { leader, messages } => {
                tokio::spawn(async move {
                    let last_index = messages.last().map_or(0, |m| m.index);
                    let survivors: Vec<ChannelMessage> =
                        messages.into_iter().filter(|m| !m.dropped).collect();
                    let result = if survivors.is_empty() {
                        Ok(())
                    } else {
                        host.forward(leader, &channel_id, channel_type, &survivors).await
                    };
                    if let Err(e) = &result {
                        warn!(channel = %key, leader = %leader, error = %e, "forward stage failed");
                    }
                    let _ = tx
                        .send(PipelineEvent::ForwardResult {
                            key,
                            last_index,
                            ok: result.is_ok(),
                        })
                        .await;
                });
            }
        }
    }
}
