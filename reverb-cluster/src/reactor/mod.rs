//! Handler registry and sub-reactor scheduler.
//!
//! A [`Reactor`] owns a fixed pool of sub-reactor loops; handlers shard
//! across them by key hash. Each sub-reactor serializes `step()` calls for
//! its handlers while all I/O runs in bounded worker pools whose results
//! re-enter as further step messages, preserving per-handler ordering.

mod sub;

use crate::error::{ClusterError, Result};
use crate::replica::{Message, ReplicaConfig, ReplicaOptions, Role};
use crate::traits::{HandlerStorage, ReactorRequest, ReactorSender};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use reverb_core::{fnv1a, LogIndex, NodeId, Term};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::info;

/// Bound on concurrent store appends across a reactor.
const APPEND_POOL: usize = 1000;
/// Bound on concurrent applies across a reactor.
const APPLY_POOL: usize = 1000;
/// Log reads serve one at a time, in request order.
const GET_LOGS_POOL: usize = 1;
/// Bound on concurrent config resolutions.
const INIT_POOL: usize = 64;
/// Bound on concurrent conflict checks.
const CONFLICT_POOL: usize = 64;
/// Bound on concurrent role-transition proposals.
const TRANSITION_POOL: usize = 16;

/// Per-sub inbound queue depth.
const SUB_QUEUE_DEPTH: usize = 4096;

/// Reactor construction options.
#[derive(Debug, Clone)]
pub struct ReactorOptions {
    /// This node's id.
    pub node_id: NodeId,
    /// Reactor name, used in logs ("channel" or "slot").
    pub name: &'static str,
    /// Number of sub-reactor loops.
    pub sub_count: usize,
    /// Sub-reactor tick interval.
    pub tick_interval: Duration,
    /// Worker deadline and request timeout.
    pub req_timeout: Duration,
    /// State machine tunables.
    pub replica: ReplicaOptions,
    /// When true, `propose_and_wait` completes after apply rather than
    /// after commit.
    pub is_committed_after_applied: bool,
}

/// Snapshot of one handler's replication state.
#[derive(Debug, Clone)]
pub struct HandlerInfo {
    /// Current role.
    pub role: Role,
    /// Current leader, zero when unknown.
    pub leader: NodeId,
    /// Current term.
    pub term: Term,
    /// Persisted log tail.
    pub last_index: LogIndex,
    /// Committed watermark.
    pub committed_index: LogIndex,
    /// Applied watermark.
    pub applied_index: LogIndex,
    /// Current config.
    pub config: ReplicaConfig,
}

/// Events a sub-reactor consumes.
pub(crate) enum SubEvent {
    /// Register a handler.
    Add {
        key: String,
        storage: Arc<dyn HandlerStorage>,
    },
    /// Deregister a handler, failing its waiters.
    Remove { key: String },
    /// Feed a step message to a handler.
    Step { key: String, message: Message },
    /// Propose entries; `reply` fires at commit (or apply, per options).
    Propose {
        key: String,
        datas: Vec<Bytes>,
        reply: oneshot::Sender<Result<LogIndex>>,
    },
    /// Adopt an updated config.
    UpdateConfig { key: String, config: ReplicaConfig },
    /// Query replication state.
    Info {
        key: String,
        reply: oneshot::Sender<Option<HandlerInfo>>,
    },
}

/// Worker pools shared by all sub-reactors of one reactor.
pub(crate) struct WorkerPools {
    pub(crate) append: Arc<Semaphore>,
    pub(crate) apply: Arc<Semaphore>,
    pub(crate) get_logs: Arc<Semaphore>,
    pub(crate) init: Arc<Semaphore>,
    pub(crate) conflict: Arc<Semaphore>,
    pub(crate) transition: Arc<Semaphore>,
}

impl WorkerPools {
    fn new() -> Self {
        Self {
            append: Arc::new(Semaphore::new(APPEND_POOL)),
            apply: Arc::new(Semaphore::new(APPLY_POOL)),
            get_logs: Arc::new(Semaphore::new(GET_LOGS_POOL)),
            init: Arc::new(Semaphore::new(INIT_POOL)),
            conflict: Arc::new(Semaphore::new(CONFLICT_POOL)),
            transition: Arc::new(Semaphore::new(TRANSITION_POOL)),
        }
    }
}

/// State shared between a reactor's sub loops and their workers.
pub(crate) struct Shared {
    pub(crate) opts: ReactorOptions,
    pub(crate) request: Arc<dyn ReactorRequest>,
    pub(crate) sender: Arc<dyn ReactorSender>,
    pub(crate) pools: WorkerPools,
    pub(crate) registry: Arc<DashMap<String, usize>>,
}

/// The handler registry and scheduler.
pub struct Reactor {
    shared: Arc<Shared>,
    subs: Vec<mpsc::Sender<SubEvent>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Reactor {
    /// Create and start a reactor.
    pub fn new(
        opts: ReactorOptions,
        request: Arc<dyn ReactorRequest>,
        sender: Arc<dyn ReactorSender>,
    ) -> Arc<Self> {
        let registry = Arc::new(DashMap::new());
        let shared = Arc::new(Shared {
            opts,
            request,
            sender,
            pools: WorkerPools::new(),
            registry,
        });

        let mut subs = Vec::with_capacity(shared.opts.sub_count);
        let mut tasks = Vec::with_capacity(shared.opts.sub_count);
        for idx in 0..shared.opts.sub_count {
            let (tx, rx) = mpsc::channel(SUB_QUEUE_DEPTH);
            let sub = sub::SubReactor::new(idx, shared.clone(), rx, tx.clone());
            tasks.push(tokio::spawn(sub.run()));
            subs.push(tx);
        }
        info!(name = shared.opts.name, subs = shared.opts.sub_count, "reactor started");
        Arc::new(Self {
            shared,
            subs,
            tasks: Mutex::new(tasks),
        })
    }

    fn sub_of(&self, key: &str) -> &mpsc::Sender<SubEvent> {
        let idx = (fnv1a(key.as_bytes()) % self.subs.len() as u64) as usize;
        &self.subs[idx]
    }

    async fn send_event(&self, key: &str, event: SubEvent) -> Result<()> {
        self.sub_of(key)
            .send(event)
            .await
            .map_err(|_| ClusterError::Stopped)
    }

    /// Register a handler under `key`.
    pub async fn add_handler(&self, key: &str, storage: Arc<dyn HandlerStorage>) -> Result<()> {
        // Visible in the registry immediately, so a step racing the Add
        // event is queued rather than refused.
        let idx = (fnv1a(key.as_bytes()) % self.subs.len() as u64) as usize;
        self.shared.registry.insert(key.to_string(), idx);
        self.send_event(
            key,
            SubEvent::Add {
                key: key.to_string(),
                storage,
            },
        )
        .await
    }

    /// Deregister the handler under `key`.
    pub async fn remove_handler(&self, key: &str) -> Result<()> {
        self.send_event(key, SubEvent::Remove { key: key.to_string() }).await
    }

    /// Whether a handler is registered under `key`.
    pub fn handler_exists(&self, key: &str) -> bool {
        self.shared.registry.contains_key(key)
    }

    /// Number of registered handlers.
    pub fn handler_len(&self) -> usize {
        self.shared.registry.len()
    }

    /// Feed a step message to the handler under `key`.
    pub async fn step(&self, key: &str, message: Message) -> Result<()> {
        if !self.handler_exists(key) {
            return Err(ClusterError::HandlerNotFound(key.to_string()));
        }
        self.send_event(
            key,
            SubEvent::Step {
                key: key.to_string(),
                message,
            },
        )
        .await
    }

    /// Adopt an updated config on the handler under `key`.
    pub async fn update_config(&self, key: &str, config: ReplicaConfig) -> Result<()> {
        self.send_event(
            key,
            SubEvent::UpdateConfig {
                key: key.to_string(),
                config,
            },
        )
        .await
    }

    /// Snapshot the replication state of the handler under `key`.
    pub async fn handler_info(&self, key: &str) -> Option<HandlerInfo> {
        let (reply, rx) = oneshot::channel();
        self.send_event(
            key,
            SubEvent::Info {
                key: key.to_string(),
                reply,
            },
        )
        .await
        .ok()?;
        rx.await.ok().flatten()
    }

    /// Propose `datas` to the handler under `key` and wait until the batch
    /// is committed (and applied, when so configured) or `timeout` fires.
    /// Returns the index of the last proposed entry.
    pub async fn propose_and_wait(
        &self,
        key: &str,
        datas: Vec<Bytes>,
        timeout: Duration,
    ) -> Result<LogIndex> {
        if !self.handler_exists(key) {
            return Err(ClusterError::HandlerNotFound(key.to_string()));
        }
        let (reply, rx) = oneshot::channel();
        self.send_event(
            key,
            SubEvent::Propose {
                key: key.to_string(),
                datas,
                reply,
            },
        )
        .await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClusterError::Stopped),
            Err(_) => Err(ClusterError::ProposalTimeout {
                key: key.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Stop all sub-reactors. In-flight workers are abandoned.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(name = self.shared.opts.name, "reactor stopped");
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}
