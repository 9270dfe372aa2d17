//! One sub-reactor loop.

use super::{HandlerInfo, Shared, SubEvent};
use crate::error::{ClusterError, Result};
use crate::replica::{
    Message, MessageKind, Replica, ReplicaEvent, RestoredState, Role, NO_CONFLICT,
};
use crate::traits::{HandlerStorage, RoleTransition};
use reverb_core::{LogIndex, Term};
use reverb_storage::LogEntry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// Entry cap for one sync response.
const MAX_SYNC_BATCH: u64 = 1024;

struct HandlerState {
    replica: Replica,
    storage: Arc<dyn HandlerStorage>,
    /// Proposal waiters keyed by the index they wait for.
    waiters: Vec<(LogIndex, oneshot::Sender<Result<LogIndex>>)>,
}

/// Single-threaded owner of a shard of handlers.
pub(crate) struct SubReactor {
    idx: usize,
    shared: Arc<Shared>,
    rx: mpsc::Receiver<SubEvent>,
    tx: mpsc::Sender<SubEvent>,
    handlers: HashMap<String, HandlerState>,
}

impl SubReactor {
    pub(crate) fn new(
        idx: usize,
        shared: Arc<Shared>,
        rx: mpsc::Receiver<SubEvent>,
        tx: mpsc::Sender<SubEvent>,
    ) -> Self {
        Self {
            idx,
            shared,
            rx,
            tx,
            handlers: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.shared.opts.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let keys: Vec<String> = self.handlers.keys().cloned().collect();
                    for key in keys {
                        if let Some(h) = self.handlers.get_mut(&key) {
                            h.replica.tick();
                        }
                        self.process_ready(&key);
                    }
                }
                event = self.rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event);
                    // Drain whatever else is queued before sleeping again.
                    while let Ok(event) = self.rx.try_recv() {
                        self.handle_event(event);
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: SubEvent) {
        match event {
            SubEvent::Add { key, storage } => self.add_handler(key, storage),
            SubEvent::Remove { key } => {
                self.remove_handler(&key);
            }
            SubEvent::Step { key, message } => {
                match self.handlers.get_mut(&key) {
                    Some(h) => h.replica.step(message),
                    None => {
                        debug!(key = %key, "step for unknown handler dropped");
                        return;
                    }
                }
                self.process_ready(&key);
            }
            SubEvent::Propose { key, datas, reply } => {
                let Some(h) = self.handlers.get_mut(&key) else {
                    let _ = reply.send(Err(ClusterError::HandlerNotFound(key)));
                    return;
                };
                if h.replica.role() != Role::Leader {
                    let _ = reply.send(Err(ClusterError::NotLeader {
                        key,
                        leader: h.replica.leader(),
                    }));
                    return;
                }
                match h.replica.propose(datas) {
                    Some(last) => {
                        h.waiters.push((last, reply));
                        self.process_ready(&key);
                    }
                    None => {
                        let _ = reply.send(Err(ClusterError::ProposalRejected {
                            key,
                            reason: "proposals paused by applied/committed lag".into(),
                        }));
                    }
                }
            }
            SubEvent::UpdateConfig { key, config } => {
                if let Some(h) = self.handlers.get_mut(&key) {
                    h.replica.adopt_config(config);
                }
                self.process_ready(&key);
            }
            SubEvent::Info { key, reply } => {
                let info = self.handlers.get(&key).map(|h| HandlerInfo {
                    role: h.replica.role(),
                    leader: h.replica.leader(),
                    term: h.replica.term(),
                    last_index: h.replica.last_index(),
                    committed_index: h.replica.committed_index(),
                    applied_index: h.replica.applied_index(),
                    config: h.replica.config().clone(),
                });
                let _ = reply.send(info);
            }
        }
    }

    fn add_handler(&mut self, key: String, storage: Arc<dyn HandlerStorage>) {
        if self.handlers.contains_key(&key) {
            return;
        }
        let restored = match Self::restore(storage.as_ref()) {
            Ok(restored) => restored,
            Err(e) => {
                error!(key = %key, error = %e, "restore failed, starting empty");
                RestoredState::default()
            }
        };
        let replica = Replica::new(
            key.clone(),
            self.shared.opts.node_id,
            self.shared.opts.replica.clone(),
            restored,
        );
        self.shared.registry.insert(key.clone(), self.idx);
        self.handlers.insert(
            key.clone(),
            HandlerState {
                replica,
                storage,
                waiters: Vec::new(),
            },
        );
        self.process_ready(&key);
    }

    fn remove_handler(&mut self, key: &str) {
        if let Some(mut state) = self.handlers.remove(key) {
            self.shared.registry.remove(key);
            for (_, reply) in state.waiters.drain(..) {
                let _ = reply.send(Err(ClusterError::HandlerNotFound(key.to_string())));
            }
            debug!(key = %key, "handler removed");
        }
    }

    fn restore(storage: &dyn HandlerStorage) -> Result<RestoredState> {
        Ok(RestoredState {
            last_index: storage.last_index()?,
            last_term: storage.last_term()?,
            committed: storage.committed_index()?,
            applied: storage.applied_index()?,
            last_leader_term: storage.leader_last_term()?,
        })
    }

    fn process_ready(&mut self, key: &str) {
        loop {
            let (messages, events, storage) = match self.handlers.get_mut(key) {
                Some(h) if h.replica.has_ready() => {
                    (h.replica.ready(), h.replica.take_events(), h.storage.clone())
                }
                _ => break,
            };
            for event in events {
                if self.handle_replica_event(key, event) {
                    return;
                }
            }
            for message in messages {
                self.dispatch(key, storage.clone(), message);
            }
        }
        self.complete_waiters(key);
    }

    /// Returns true when the handler was removed.
    fn handle_replica_event(&mut self, key: &str, event: ReplicaEvent) -> bool {
        match event {
            ReplicaEvent::ElectedLeader { term } => {
                let shared = self.shared.clone();
                let key = key.to_string();
                let leader = self.shared.opts.node_id;
                tokio::spawn(async move {
                    let Ok(_permit) = shared.pools.transition.clone().acquire_owned().await else {
                        return;
                    };
                    // The arbitrating slot may itself be mid-failover;
                    // keep trying until the result lands.
                    for attempt in 0u32.. {
                        match shared.request.on_elected(&key, term, leader).await {
                            Ok(()) => return,
                            Err(e) if attempt < 10 => {
                                warn!(key = %key, attempt, error = %e, "persisting election result failed, retrying");
                                tokio::time::sleep(shared.opts.req_timeout / 4).await;
                            }
                            Err(e) => {
                                error!(key = %key, error = %e, "persisting election result failed");
                                return;
                            }
                        }
                    }
                });
                false
            }
            ReplicaEvent::AppliedTo { .. } => false,
            ReplicaEvent::RemoveMe => {
                self.remove_handler(key);
                true
            }
        }
    }

    fn complete_waiters(&mut self, key: &str) {
        let after_applied = self.shared.opts.is_committed_after_applied;
        let Some(h) = self.handlers.get_mut(key) else {
            return;
        };
        let threshold = if after_applied {
            h.replica.applied_index()
        } else {
            h.replica.committed_index()
        };
        if h.waiters.iter().all(|(index, _)| *index > threshold) {
            return;
        }
        let mut remaining = Vec::with_capacity(h.waiters.len());
        for (index, reply) in h.waiters.drain(..) {
            if index <= threshold {
                let _ = reply.send(Ok(index));
            } else {
                remaining.push((index, reply));
            }
        }
        h.waiters = remaining;
    }

    fn dispatch(&mut self, key: &str, storage: Arc<dyn HandlerStorage>, message: Message) {
        match message.kind {
            MessageKind::Init => self.spawn_init(key),
            MessageKind::LogConflictCheck => self.spawn_conflict_check(key, storage, message),
            MessageKind::StoreAppend => self.spawn_store_append(key, storage, message),
            MessageKind::ApplyLogs => self.spawn_apply(key, storage, message),
            MessageKind::SyncGetResp => self.spawn_sync_serve(key, storage, message),
            MessageKind::SyncGet
            | MessageKind::Ping
            | MessageKind::Pong
            | MessageKind::VoteReq
            | MessageKind::VoteResp => self.spawn_send(key, message),
            MessageKind::LearnerToFollower
            | MessageKind::LearnerToLeader
            | MessageKind::FollowerToLeader => self.spawn_transition(key, message),
            other => debug!(key = %key, kind = ?other, "unroutable ready message"),
        }
    }

    fn spawn_init(&self, key: &str) {
        let shared = self.shared.clone();
        let tx = self.tx.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let Ok(_permit) = shared.pools.init.clone().acquire_owned().await else {
                return;
            };
            let result =
                tokio::time::timeout(shared.opts.req_timeout, shared.request.get_config(&key))
                    .await;
            let message = match result {
                Ok(Ok(Some(config))) => {
                    let mut m = Message::new(MessageKind::InitResp);
                    m.config = Some(config);
                    m
                }
                Ok(Ok(None)) => Message::new(MessageKind::InitResp),
                Ok(Err(e)) => {
                    warn!(key = %key, error = %e, "config resolution failed");
                    Message::reject_of(MessageKind::InitResp)
                }
                Err(_) => {
                    warn!(key = %key, "config resolution timed out");
                    Message::reject_of(MessageKind::InitResp)
                }
            };
            let _ = tx.send(SubEvent::Step { key, message }).await;
        });
    }

    fn spawn_conflict_check(&self, key: &str, storage: Arc<dyn HandlerStorage>, message: Message) {
        let shared = self.shared.clone();
        let tx = self.tx.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let Ok(_permit) = shared.pools.conflict.clone().acquire_owned().await else {
                return;
            };
            let step = if message.term.is_zero() {
                // No local leader term: nothing can conflict.
                let mut m = Message::new(MessageKind::LogConflictCheckResp);
                m.index = NO_CONFLICT;
                m
            } else {
                let result = tokio::time::timeout(
                    shared.opts.req_timeout,
                    shared
                        .request
                        .get_leader_term_start_index(&key, message.to, message.term),
                )
                .await;
                match result {
                    Ok(Ok(0)) => {
                        let mut m = Message::new(MessageKind::LogConflictCheckResp);
                        m.index = NO_CONFLICT;
                        m
                    }
                    Ok(Ok(leader_index)) => {
                        match Self::resolve_conflict(storage.as_ref(), leader_index, message.term) {
                            Ok((last_index, last_term)) => {
                                let mut m = Message::new(MessageKind::LogConflictCheckResp);
                                m.index = last_index;
                                m.log_term = last_term;
                                m
                            }
                            Err(e) => {
                                error!(key = %key, error = %e, "conflict resolution failed");
                                Message::reject_of(MessageKind::LogConflictCheckResp)
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(key = %key, leader = %message.to, error = %e, "term start index lookup failed");
                        Message::reject_of(MessageKind::LogConflictCheckResp)
                    }
                    Err(_) => {
                        warn!(key = %key, leader = %message.to, "term start index lookup timed out");
                        Message::reject_of(MessageKind::LogConflictCheckResp)
                    }
                }
            };
            let _ = tx.send(SubEvent::Step { key, message: step }).await;
        });
    }

    /// The follower half of the conflict check: reconcile the local term
    /// map against the index the leader answered, then cut the log back
    /// to the last index both sides agree on. Committed entries survive
    /// because the cut never goes below applied + 1.
    fn resolve_conflict(
        storage: &dyn HandlerStorage,
        leader_index: LogIndex,
        term: Term,
    ) -> Result<(LogIndex, Term)> {
        let local_start = storage.leader_term_start_index(term)?;
        if local_start == 0 {
            storage.set_leader_term_start_index(term, leader_index)?;
        } else if local_start > leader_index {
            storage.set_leader_term_start_index(term, leader_index)?;
            storage.delete_leader_term_start_index_greater_than_term(term)?;
        }
        let applied = storage.applied_index()?;
        let truncate_to = leader_index.min(applied + 1).max(applied);
        storage.truncate_logs_to(truncate_to)?;
        Ok((storage.last_index()?, storage.last_term()?))
    }

    fn spawn_store_append(&self, key: &str, storage: Arc<dyn HandlerStorage>, message: Message) {
        let shared = self.shared.clone();
        let tx = self.tx.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let Ok(_permit) = shared.pools.append.clone().acquire_owned().await else {
                return;
            };
            let last_index = message.logs.last().map_or(0, |l| l.index);
            let result = tokio::time::timeout(
                shared.opts.req_timeout,
                shared.request.append_logs(&key, &message.logs),
            )
            .await;
            let step = match result {
                Ok(Ok(())) => {
                    for log in &message.logs {
                        // First entry of a newly seen term pins that
                        // term's start index.
                        match storage.leader_term_start_index(log.term) {
                            Ok(0) => {
                                if let Err(e) =
                                    storage.set_leader_term_start_index(log.term, log.index)
                                {
                                    error!(key = %key, term = %log.term, error = %e, "recording term start failed");
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!(key = %key, term = %log.term, error = %e, "term start lookup failed")
                            }
                        }
                    }
                    let mut m = Message::new(MessageKind::StoreAppendResp);
                    m.index = last_index;
                    m
                }
                Ok(Err(e)) => {
                    warn!(key = %key, error = %e, "append failed");
                    Message::reject_of(MessageKind::StoreAppendResp)
                }
                Err(_) => {
                    warn!(key = %key, "append timed out");
                    Message::reject_of(MessageKind::StoreAppendResp)
                }
            };
            let _ = tx.send(SubEvent::Step { key, message: step }).await;
        });
    }

    fn spawn_apply(&self, key: &str, storage: Arc<dyn HandlerStorage>, message: Message) {
        let shared = self.shared.clone();
        let tx = self.tx.clone();
        let key = key.to_string();
        let after_applied = self.shared.opts.is_committed_after_applied;
        tokio::spawn(async move {
            let Ok(_permit) = shared.pools.apply.clone().acquire_owned().await else {
                return;
            };
            let start = message.index + 1;
            let end = message.committed_index + 1;
            if !after_applied {
                if let Err(e) = storage.set_committed_index(message.committed_index) {
                    error!(key = %key, error = %e, "persisting committed watermark failed");
                }
            }
            let result =
                tokio::time::timeout(shared.opts.req_timeout, storage.apply_logs(start, end))
                    .await;
            let step = match result {
                Ok(Ok(applied_size)) => {
                    if after_applied {
                        if let Err(e) = storage.set_committed_index(message.committed_index) {
                            error!(key = %key, error = %e, "persisting committed watermark failed");
                        }
                    }
                    let mut m = Message::new(MessageKind::ApplyLogsResp);
                    m.index = message.committed_index;
                    m.applied_size = applied_size;
                    m
                }
                Ok(Err(e)) => {
                    warn!(key = %key, error = %e, "apply failed");
                    Message::reject_of(MessageKind::ApplyLogsResp)
                }
                Err(_) => {
                    warn!(key = %key, "apply timed out");
                    Message::reject_of(MessageKind::ApplyLogsResp)
                }
            };
            let _ = tx.send(SubEvent::Step { key, message: step }).await;
        });
    }

    /// Serve a sync response: fill the entries from the local log, then
    /// ship the frame to the follower.
    fn spawn_sync_serve(&self, key: &str, storage: Arc<dyn HandlerStorage>, message: Message) {
        if message.to.is_none() {
            debug!(key = %key, "sync response without a target dropped");
            return;
        }
        let shared = self.shared.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let Ok(_permit) = shared.pools.get_logs.clone().acquire_owned().await else {
                return;
            };
            let start = message.index;
            let fetched: Result<Vec<LogEntry>> = (|| {
                let last = storage.last_index()?;
                if start > last || start == 0 {
                    return Ok(Vec::new());
                }
                let end = (last + 1).min(start + MAX_SYNC_BATCH);
                storage.logs(start, end)
            })();
            match fetched {
                Ok(logs) => {
                    if let Some(first) = logs.first() {
                        // A served batch starting anywhere but the asked
                        // index is a broken log store.
                        assert_eq!(
                            first.index, start,
                            "log gap serving sync for {}: want {}, got {}",
                            key, start, first.index
                        );
                    }
                    let mut out = message;
                    out.logs = logs;
                    let to = out.to;
                    if let Err(e) = shared.sender.send(to, &key, out).await {
                        warn!(key = %key, peer = %to, error = %e, "sync response send failed");
                    }
                }
                Err(e) => {
                    error!(key = %key, error = %e, "serving sync read failed");
                }
            }
        });
    }

    fn spawn_send(&self, key: &str, message: Message) {
        if message.to.is_none() {
            debug!(key = %key, kind = ?message.kind, "wire message without target dropped");
            return;
        }
        let shared = self.shared.clone();
        let tx = self.tx.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let to = message.to;
            let kind = message.kind;
            if let Err(e) = shared.sender.send(to, &key, message).await {
                warn!(key = %key, peer = %to, kind = ?kind, error = %e, "send failed");
                if kind == MessageKind::SyncGet {
                    // Unblock the follower's sync state so it re-resolves.
                    let _ = tx
                        .send(SubEvent::Step {
                            key,
                            message: Message::reject_of(MessageKind::SyncGetResp),
                        })
                        .await;
                }
            }
        });
    }

    fn spawn_transition(&self, key: &str, message: Message) {
        let shared = self.shared.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let Ok(_permit) = shared.pools.transition.clone().acquire_owned().await else {
                return;
            };
            let transition = RoleTransition {
                kind: message.kind,
                peer: message.transition_peer,
                term: message.term,
            };
            if let Err(e) = shared.request.role_transition(&key, transition).await {
                warn!(key = %key, peer = %transition.peer, error = %e, "role transition failed");
            }
        });
    }
}
