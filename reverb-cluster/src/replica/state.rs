//! The replication state machine.

use super::{
    Message, MessageKind, Progress, ReplicaConfig, ReplicaEvent, Role, NO_CONFLICT,
};
use bytes::Bytes;
use reverb_core::{LogIndex, NodeId, Term};
use reverb_storage::LogEntry;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Ticks a worker-rejected operation waits before it is re-driven.
const REJECT_BACKOFF_TICKS: u64 = 2;

/// Progress idle ticks after which a peer is considered unresponsive and
/// its in-flight window halves (probing).
const PROBE_IDLE_TICKS: u64 = 8;

/// Tunables for one replica, lifted from the node config.
#[derive(Debug, Clone)]
pub struct ReplicaOptions {
    /// Ticks without leader contact before campaigning.
    pub election_timeout_ticks: u64,
    /// Ticks between leader heartbeats.
    pub heartbeat_interval_ticks: u64,
    /// Whether the applied/committed gap pauses proposals.
    pub auto_slow_down: bool,
    /// Entry gap that triggers the pause.
    pub slow_down_threshold: u64,
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self {
            election_timeout_ticks: 10,
            heartbeat_interval_ticks: 2,
            auto_slow_down: true,
            slow_down_threshold: 2048,
        }
    }
}

/// Log positions restored from storage when the handler is added.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestoredState {
    /// Tail of the persisted log.
    pub last_index: LogIndex,
    /// Term of the tail entry.
    pub last_term: Term,
    /// Persisted committed watermark.
    pub committed: LogIndex,
    /// Persisted applied watermark.
    pub applied: LogIndex,
    /// Highest term in the local term-start-index map.
    pub last_leader_term: Term,
}

/// Lifecycle phase of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for config resolution.
    Init,
    /// Follower reconciling its log tail against the leader's term map.
    ConflictCheck,
    /// Normal operation.
    Ready,
}

/// Per-handler Raft-derived state machine. See the module docs for the
/// step/ready contract.
#[derive(Debug)]
pub struct Replica {
    key: String,
    node_id: NodeId,
    opts: ReplicaOptions,

    config: ReplicaConfig,
    role: Role,
    phase: Phase,
    term: Term,
    leader: NodeId,

    last_index: LogIndex,
    last_term: Term,
    committed: LogIndex,
    applied: LogIndex,
    last_leader_term: Term,

    /// Entries accepted but not yet persisted by the append worker.
    unstable: Vec<LogEntry>,

    appending: bool,
    applying: bool,
    syncing: bool,
    init_inflight: bool,
    conflict_inflight: bool,
    init_retry_ticks: u64,
    append_retry_ticks: u64,
    apply_retry_ticks: u64,

    /// Follower-side view of the leader's log.
    leader_committed: LogIndex,
    leader_last_index: LogIndex,
    synced_once: bool,

    /// Leader-side progress per peer (followers and learners).
    progress: HashMap<NodeId, Progress>,
    transition_proposed: bool,

    votes: HashMap<NodeId, bool>,
    voted_for: Option<(Term, NodeId)>,
    election_elapsed: u64,
    heartbeat_elapsed: u64,

    outbox: Vec<Message>,
    events: Vec<ReplicaEvent>,
}

impl Replica {
    /// Create a machine for `key` on `node_id`, restored from storage.
    /// The outbox immediately carries the `Init` request.
    pub fn new(key: impl Into<String>, node_id: NodeId, opts: ReplicaOptions, restored: RestoredState) -> Self {
        let mut replica = Self {
            key: key.into(),
            node_id,
            opts,
            config: ReplicaConfig::default(),
            role: Role::Unknown,
            phase: Phase::Init,
            term: Term::default(),
            leader: NodeId::none(),
            last_index: restored.last_index,
            last_term: restored.last_term,
            committed: restored.committed,
            applied: restored.applied,
            last_leader_term: restored.last_leader_term,
            unstable: Vec::new(),
            appending: false,
            applying: false,
            syncing: false,
            init_inflight: false,
            conflict_inflight: false,
            init_retry_ticks: 0,
            append_retry_ticks: 0,
            apply_retry_ticks: 0,
            leader_committed: 0,
            leader_last_index: 0,
            synced_once: false,
            progress: HashMap::new(),
            transition_proposed: false,
            votes: HashMap::new(),
            voted_for: None,
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            outbox: Vec::new(),
            events: Vec::new(),
        };
        replica.schedule();
        replica
    }

    // ---- accessors ----

    /// Handler key this machine drives.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether this node leads the group.
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Current leader, zero when unknown.
    pub fn leader(&self) -> NodeId {
        self.leader
    }

    /// Current term.
    pub fn term(&self) -> Term {
        self.term
    }

    /// Persisted log tail.
    pub fn last_index(&self) -> LogIndex {
        self.last_index
    }

    /// Committed watermark.
    pub fn committed_index(&self) -> LogIndex {
        self.committed
    }

    /// Applied watermark.
    pub fn applied_index(&self) -> LogIndex {
        self.applied
    }

    /// Current config.
    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// Index the next proposed entry would take.
    fn next_log_index(&self) -> LogIndex {
        self.last_index + self.unstable.len() as u64 + 1
    }

    /// Cache the highest locally-known leader term (the reactor owns the
    /// persisted map).
    pub fn set_last_leader_term(&mut self, term: Term) {
        self.last_leader_term = term;
    }

    /// Accept a proposal, assigning indices and the current term.
    /// Returns the index of the last accepted entry, or `None` when
    /// proposals are not being accepted (wrong role, slow-down pause).
    pub fn propose(&mut self, datas: Vec<Bytes>) -> Option<LogIndex> {
        if !self.can_propose() || datas.is_empty() {
            return None;
        }
        self.append_entries(datas);
        let last = self.last_index + self.unstable.len() as u64;
        self.schedule();
        Some(last)
    }

    /// Whether a proposal would be accepted right now.
    pub fn can_propose(&self) -> bool {
        if self.role != Role::Leader || self.phase != Phase::Ready {
            return false;
        }
        if self.opts.auto_slow_down
            && self.committed.saturating_sub(self.applied) > self.opts.slow_down_threshold
        {
            return false;
        }
        true
    }

    // ---- ready protocol ----

    /// Whether [`Self::ready`] would yield messages or events.
    pub fn has_ready(&self) -> bool {
        !self.outbox.is_empty() || !self.events.is_empty()
    }

    /// Drain the outbox.
    pub fn ready(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbox)
    }

    /// Drain pending side effects.
    pub fn take_events(&mut self) -> Vec<ReplicaEvent> {
        std::mem::take(&mut self.events)
    }

    fn send(&mut self, mut msg: Message) {
        msg.from = self.node_id;
        self.outbox.push(msg);
    }

    // ---- step ----

    /// Feed one message. Never blocks; side effects land in the outbox
    /// and event queue.
    pub fn step(&mut self, msg: Message) {
        match msg.kind {
            MessageKind::InitResp => self.on_init_resp(msg),
            MessageKind::LogConflictCheckResp => self.on_conflict_check_resp(msg),
            MessageKind::StoreAppendResp => self.on_store_append_resp(msg),
            MessageKind::SyncGet => self.on_sync_get(msg),
            MessageKind::SyncGetResp => self.on_sync_get_resp(msg),
            MessageKind::ApplyLogsResp => self.on_apply_logs_resp(msg),
            MessageKind::Propose => self.on_propose(msg),
            MessageKind::Ping => self.on_ping(msg),
            MessageKind::Pong => self.on_pong(msg),
            MessageKind::VoteReq => self.on_vote_req(msg),
            MessageKind::VoteResp => self.on_vote_resp(msg),
            // Transition kinds are requests this machine emits; nothing
            // steps them back in. Config changes arrive as InitResp.
            MessageKind::LearnerToFollower
            | MessageKind::LearnerToLeader
            | MessageKind::FollowerToLeader => {}
            MessageKind::Init
            | MessageKind::LogConflictCheck
            | MessageKind::StoreAppend
            | MessageKind::ApplyLogs => {
                debug!(key = %self.key, kind = ?msg.kind, "ignoring worker-request kind as input");
            }
        }
        self.schedule();
    }

    /// Advance timers. Called once per sub-reactor tick.
    pub fn tick(&mut self) {
        self.init_retry_ticks = self.init_retry_ticks.saturating_sub(1);
        self.append_retry_ticks = self.append_retry_ticks.saturating_sub(1);
        self.apply_retry_ticks = self.apply_retry_ticks.saturating_sub(1);

        match self.role {
            Role::Leader => {
                self.heartbeat_elapsed += 1;
                for progress in self.progress.values_mut() {
                    progress.idle_ticks += 1;
                }
                if self.heartbeat_elapsed >= self.opts.heartbeat_interval_ticks {
                    self.heartbeat_elapsed = 0;
                    self.broadcast_ping();
                }
            }
            Role::Follower | Role::Candidate => {
                if self.phase == Phase::Ready && self.config.replicas.contains(&self.node_id) {
                    self.election_elapsed += 1;
                    if self.election_elapsed >= self.randomized_election_timeout() {
                        self.election_elapsed = 0;
                        self.campaign();
                    }
                }
            }
            Role::Learner | Role::Unknown => {}
        }
        self.schedule();
    }

    fn randomized_election_timeout(&self) -> u64 {
        let base = self.opts.election_timeout_ticks;
        // Deterministic per-node stagger; avoids synchronized campaigns
        // without a shared RNG.
        base + (self.node_id.value().wrapping_mul(7) + u64::from(self.term.value()) * 13) % base
    }

    /// Emit whatever the current state calls for, guarded by the
    /// in-flight flags so nothing is emitted twice.
    fn schedule(&mut self) {
        match self.phase {
            Phase::Init => {
                if !self.init_inflight && self.init_retry_ticks == 0 {
                    self.init_inflight = true;
                    self.send(Message::new(MessageKind::Init));
                }
                return;
            }
            Phase::ConflictCheck => {
                if !self.conflict_inflight {
                    self.conflict_inflight = true;
                    let mut msg = Message::new(MessageKind::LogConflictCheck);
                    msg.to = self.leader;
                    msg.term = self.last_leader_term;
                    self.send(msg);
                }
                return;
            }
            Phase::Ready => {}
        }

        // Persist accepted entries.
        if !self.appending && self.append_retry_ticks == 0 && !self.unstable.is_empty() {
            self.appending = true;
            let mut msg = Message::new(MessageKind::StoreAppend);
            msg.index = self.unstable[0].index;
            msg.term = self.term;
            msg.logs = self.unstable.clone();
            self.send(msg);
        }

        // Apply committed entries.
        if !self.applying && self.apply_retry_ticks == 0 && self.committed > self.applied {
            self.applying = true;
            let mut msg = Message::new(MessageKind::ApplyLogs);
            msg.index = self.applied;
            msg.committed_index = self.committed;
            self.send(msg);
        }

        // Pull from the leader.
        if matches!(self.role, Role::Follower | Role::Learner)
            && !self.syncing
            && !self.appending
            && self.unstable.is_empty()
            && !self.leader.is_none()
            && (!self.synced_once
                || self.last_index < self.leader_last_index
                || self.committed < self.leader_committed)
        {
            self.syncing = true;
            let mut msg = Message::new(MessageKind::SyncGet);
            msg.to = self.leader;
            msg.term = self.term;
            msg.index = self.last_index + 1;
            self.send(msg);
        }
    }

    // ---- init & config ----

    fn on_init_resp(&mut self, msg: Message) {
        self.init_inflight = false;
        if msg.reject {
            // Config resolution failed; stay in Init and re-drive after
            // a backoff.
            self.init_retry_ticks = REJECT_BACKOFF_TICKS;
            return;
        }
        match msg.config {
            Some(config) if !config.is_empty() => self.adopt_config(config),
            _ => {
                // Unknown handler: initialized but idle until traffic
                // creates a config.
                self.phase = Phase::Ready;
            }
        }
    }

    /// Adopt a resolved or updated config and derive the local role.
    pub fn adopt_config(&mut self, config: ReplicaConfig) {
        if config.version < self.config.version {
            debug!(key = %self.key, "stale config version ignored");
            return;
        }
        let was_leader = self.role == Role::Leader;
        let role = config.role_of(self.node_id);
        if config.term > self.term {
            self.term = config.term;
        }
        self.leader = config.leader;
        self.transition_proposed = false;
        self.config = config;
        self.role = role;

        match role {
            Role::Leader => {
                self.phase = Phase::Ready;
                if !was_leader {
                    self.progress.clear();
                    for peer in self
                        .config
                        .replicas
                        .iter()
                        .chain(self.config.learners.iter())
                        .copied()
                        .filter(|p| *p != self.node_id)
                        .collect::<Vec<_>>()
                    {
                        self.progress.insert(
                            peer,
                            Progress {
                                match_index: 0,
                                next_index: self.last_index + 1,
                                idle_ticks: 0,
                            },
                        );
                    }
                    self.broadcast_ping();
                    info!(key = %self.key, term = %self.term, "became leader by config");
                }
            }
            Role::Follower | Role::Learner => {
                self.election_elapsed = 0;
                self.syncing = false;
                self.synced_once = false;
                if !self.last_leader_term.is_zero() {
                    self.phase = Phase::ConflictCheck;
                } else {
                    self.phase = Phase::Ready;
                }
                info!(key = %self.key, role = %role, leader = %self.leader, "adopted config");
            }
            Role::Candidate => unreachable!("configs never assign candidate"),
            Role::Unknown => {
                self.phase = Phase::Ready;
                warn!(key = %self.key, "not a member under new config, requesting removal");
                self.events.push(ReplicaEvent::RemoveMe);
            }
        }
    }

    fn on_conflict_check_resp(&mut self, msg: Message) {
        self.conflict_inflight = false;
        if msg.reject {
            // Forced re-initialization per the failure contract.
            self.phase = Phase::Init;
            return;
        }
        if msg.index != NO_CONFLICT {
            // The worker already truncated; adopt the new tail.
            self.last_index = msg.index;
            self.last_term = msg.log_term;
            if self.committed > self.last_index {
                self.committed = self.last_index;
            }
            info!(key = %self.key, tail = self.last_index, "log reconciled against leader");
        }
        self.phase = Phase::Ready;
    }

    // ---- append & commit ----

    fn append_entries(&mut self, datas: Vec<Bytes>) {
        let mut next = self.next_log_index();
        for data in datas {
            self.unstable.push(LogEntry::new(next, self.term, data));
            next += 1;
        }
    }

    fn on_propose(&mut self, msg: Message) {
        if self.role != Role::Leader {
            warn!(key = %self.key, "proposal on non-leader dropped");
            return;
        }
        self.append_entries(msg.logs.into_iter().map(|l| l.data).collect());
    }

    fn on_store_append_resp(&mut self, msg: Message) {
        self.appending = false;
        if msg.reject {
            self.append_retry_ticks = REJECT_BACKOFF_TICKS;
            warn!(key = %self.key, "store append rejected, backing off");
            return;
        }
        let stored_to = msg.index;
        let mut last_term = self.last_term;
        self.unstable.retain(|entry| {
            if entry.index <= stored_to {
                last_term = entry.term;
                false
            } else {
                true
            }
        });
        if stored_to > self.last_index {
            self.last_index = stored_to;
            self.last_term = last_term;
        }
        if last_term > self.last_leader_term {
            self.last_leader_term = last_term;
        }

        match self.role {
            Role::Leader => {
                self.maybe_commit();
                // Wake followers without waiting for the heartbeat tick.
                self.broadcast_ping();
            }
            Role::Follower | Role::Learner => {
                let commit = self.leader_committed.min(self.last_index);
                if commit > self.committed {
                    self.committed = commit;
                }
            }
            _ => {}
        }
    }

    fn quorum_match(&self) -> LogIndex {
        let mut matches: Vec<LogIndex> = vec![self.last_index];
        for replica in &self.config.replicas {
            if *replica == self.node_id {
                continue;
            }
            matches.push(self.progress.get(replica).map_or(0, |p| p.match_index));
        }
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = self.config.quorum();
        if matches.len() < quorum {
            return 0;
        }
        matches[quorum - 1]
    }

    /// Commit by quorum match. Inherited entries commit directly: an
    /// elected leader already holds the longest log among voters, and
    /// config-born leadership is arbitrated by the owning slot's
    /// consensus, with divergent tails cut by the conflict check.
    fn maybe_commit(&mut self) {
        let index = self.quorum_match();
        if index > self.committed {
            self.committed = index;
        }
    }

    // ---- sync (leader side) ----

    fn on_sync_get(&mut self, msg: Message) {
        if self.role != Role::Leader {
            let mut resp = Message::reject_of(MessageKind::SyncGetResp);
            resp.to = msg.from;
            self.send(resp);
            return;
        }
        let peer = msg.from;
        let match_index = msg.index.saturating_sub(1);
        let progress = self.progress.entry(peer).or_default();
        if match_index > progress.match_index {
            progress.match_index = match_index;
        }
        progress.next_index = msg.index;
        progress.idle_ticks = 0;
        self.maybe_commit();
        self.check_transitions();

        // The reactor's get-logs worker fills `logs` before the frame
        // leaves the node.
        let mut resp = Message::new(MessageKind::SyncGetResp);
        resp.to = peer;
        resp.term = self.term;
        resp.index = msg.index;
        resp.committed_index = self.committed;
        self.send(resp);
    }

    /// Emit a role-transition request once a catching-up node has matched
    /// the committed index: the migration target during a relocation, or
    /// any learner otherwise (promotion to follower).
    fn check_transitions(&mut self) {
        if self.transition_proposed {
            return;
        }
        if !self.config.migrating() {
            let candidates: Vec<NodeId> = self.config.learners.clone();
            for learner in candidates {
                let caught_up = self
                    .progress
                    .get(&learner)
                    .map_or(false, |p| p.match_index >= self.committed);
                if caught_up {
                    self.transition_proposed = true;
                    let mut msg = Message::new(MessageKind::LearnerToFollower);
                    msg.transition_peer = learner;
                    msg.term = self.term;
                    info!(key = %self.key, learner = %learner, "learner caught up, proposing promotion");
                    self.send(msg);
                    return;
                }
            }
            return;
        }
        let target = self.config.migrate_to;
        if target == self.node_id {
            return;
        }
        let caught_up = self
            .progress
            .get(&target)
            .map_or(false, |p| p.match_index >= self.committed);
        if !caught_up {
            return;
        }
        let kind = if self.config.is_learner(target) {
            if self.config.migrate_from == self.config.leader {
                MessageKind::LearnerToLeader
            } else {
                MessageKind::LearnerToFollower
            }
        } else if self.config.is_replica(target) && self.config.migrate_from == self.config.leader {
            MessageKind::FollowerToLeader
        } else {
            return;
        };
        self.transition_proposed = true;
        let mut msg = Message::new(kind);
        msg.transition_peer = target;
        msg.term = self.term;
        info!(key = %self.key, target = %target, kind = ?kind, "migration target caught up, proposing transition");
        self.send(msg);
    }

    // ---- sync (follower side) ----

    fn on_sync_get_resp(&mut self, msg: Message) {
        self.syncing = false;
        if msg.reject {
            // The peer no longer leads; re-resolve the config.
            self.phase = Phase::Init;
            return;
        }
        if msg.term > self.term {
            self.term = msg.term;
        }
        if msg.committed_index > self.leader_committed {
            self.leader_committed = msg.committed_index;
        }
        self.synced_once = true;

        let mut expected = self.next_log_index();
        for entry in msg.logs {
            if entry.index < expected {
                continue;
            }
            if entry.index != expected {
                warn!(key = %self.key, want = expected, got = entry.index, "sync gap, dropping tail of batch");
                break;
            }
            self.unstable.push(entry);
            expected += 1;
        }
        if expected - 1 > self.leader_last_index {
            self.leader_last_index = expected - 1;
        }

        if self.unstable.is_empty() {
            // Nothing new; the response still advances the commit.
            let commit = self.leader_committed.min(self.last_index);
            if commit > self.committed {
                self.committed = commit;
            }
        }
    }

    // ---- apply ----

    fn on_apply_logs_resp(&mut self, msg: Message) {
        self.applying = false;
        if msg.reject {
            self.apply_retry_ticks = REJECT_BACKOFF_TICKS;
            warn!(key = %self.key, "apply rejected, backing off");
            return;
        }
        if msg.index > self.applied {
            self.applied = msg.index;
            self.events.push(ReplicaEvent::AppliedTo { index: self.applied });
        }
    }

    // ---- heartbeat ----

    fn broadcast_ping(&mut self) {
        let peers: Vec<NodeId> = self
            .config
            .replicas
            .iter()
            .chain(self.config.learners.iter())
            .copied()
            .filter(|p| *p != self.node_id)
            .collect();
        for peer in peers {
            let mut msg = Message::new(MessageKind::Ping);
            msg.to = peer;
            msg.term = self.term;
            msg.index = self.last_index;
            msg.committed_index = self.committed;
            self.send(msg);
        }
    }

    fn on_ping(&mut self, msg: Message) {
        if msg.term < self.term {
            return;
        }
        let newer_term = msg.term > self.term;
        if newer_term || self.leader != msg.from {
            self.term = msg.term;
            self.leader = msg.from;
            if self.role == Role::Candidate || (self.role == Role::Leader && newer_term) {
                self.role = if self.config.is_learner(self.node_id) {
                    Role::Learner
                } else {
                    Role::Follower
                };
            }
        }
        self.election_elapsed = 0;
        if msg.committed_index > self.leader_committed {
            self.leader_committed = msg.committed_index;
        }
        if msg.index > self.leader_last_index {
            self.leader_last_index = msg.index;
        }
        let commit = self.leader_committed.min(self.last_index);
        if commit > self.committed {
            self.committed = commit;
        }

        let mut pong = Message::new(MessageKind::Pong);
        pong.to = msg.from;
        pong.term = self.term;
        pong.index = self.last_index;
        self.send(pong);
    }

    fn on_pong(&mut self, msg: Message) {
        if self.role != Role::Leader {
            return;
        }
        let acked = msg.index.min(self.last_index);
        if let Some(progress) = self.progress.get_mut(&msg.from) {
            progress.idle_ticks = 0;
            if acked > progress.match_index {
                progress.match_index = acked;
            }
        }
        self.maybe_commit();
        self.check_transitions();
    }

    // ---- elections ----

    fn campaign(&mut self) {
        if !self.config.replicas.contains(&self.node_id) {
            return;
        }
        self.term = self.term.next();
        self.role = Role::Candidate;
        self.leader = NodeId::none();
        self.voted_for = Some((self.term, self.node_id));
        self.votes.clear();
        self.votes.insert(self.node_id, true);
        info!(key = %self.key, term = %self.term, "election started");

        if self.votes.len() >= self.config.quorum() {
            self.become_elected_leader();
            return;
        }
        let peers: Vec<NodeId> = self
            .config
            .replicas
            .iter()
            .copied()
            .filter(|p| *p != self.node_id)
            .collect();
        for peer in peers {
            let mut msg = Message::new(MessageKind::VoteReq);
            msg.to = peer;
            msg.term = self.term;
            msg.log_term = self.last_term;
            msg.index = self.last_index;
            self.send(msg);
        }
    }

    fn on_vote_req(&mut self, msg: Message) {
        if self.role == Role::Leader && msg.term <= self.term {
            let mut resp = Message::reject_of(MessageKind::VoteResp);
            resp.to = msg.from;
            resp.term = self.term;
            self.send(resp);
            return;
        }
        if msg.term > self.term {
            self.term = msg.term;
            if self.role == Role::Leader || self.role == Role::Candidate {
                self.role = Role::Follower;
                self.leader = NodeId::none();
            }
        }
        let up_to_date = (msg.log_term, msg.index) >= (self.last_term, self.last_index);
        let not_voted = match self.voted_for {
            Some((term, node)) => term < msg.term || node == msg.from,
            None => true,
        };
        let grant = msg.term >= self.term && up_to_date && not_voted;
        if grant {
            self.voted_for = Some((msg.term, msg.from));
            self.election_elapsed = 0;
        }

        let mut resp = Message::new(MessageKind::VoteResp);
        resp.to = msg.from;
        resp.term = self.term;
        resp.reject = !grant;
        debug!(key = %self.key, candidate = %msg.from, grant, "vote request");
        self.send(resp);
    }

    fn on_vote_resp(&mut self, msg: Message) {
        if self.role != Role::Candidate || msg.term != self.term || msg.reject {
            return;
        }
        self.votes.insert(msg.from, true);
        if self.votes.len() >= self.config.quorum() {
            self.become_elected_leader();
        }
    }

    fn become_elected_leader(&mut self) {
        self.role = Role::Leader;
        self.leader = self.node_id;
        self.heartbeat_elapsed = 0;
        self.transition_proposed = false;
        self.progress.clear();
        let peers: Vec<NodeId> = self
            .config
            .replicas
            .iter()
            .chain(self.config.learners.iter())
            .copied()
            .filter(|p| *p != self.node_id)
            .collect();
        for peer in peers {
            self.progress.insert(
                peer,
                Progress {
                    match_index: 0,
                    next_index: self.last_index + 1,
                    idle_ticks: 0,
                },
            );
        }
        info!(key = %self.key, term = %self.term, "election won");
        self.events.push(ReplicaEvent::ElectedLeader { term: self.term });
        self.broadcast_ping();
    }

    /// Peers currently considered unresponsive (probing).
    pub fn probing_peers(&self) -> Vec<NodeId> {
        self.progress
            .iter()
            .filter(|(_, p)| p.idle_ticks > PROBE_IDLE_TICKS)
            .map(|(n, _)| *n)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(replicas: &[u64], learners: &[u64], leader: u64, term: u32) -> ReplicaConfig {
        ReplicaConfig {
            replicas: replicas.iter().map(|n| NodeId::new(*n)).collect(),
            learners: learners.iter().map(|n| NodeId::new(*n)).collect(),
            leader: NodeId::new(leader),
            term: Term::new(term),
            version: 1,
            ..Default::default()
        }
    }

    fn replica(node: u64) -> Replica {
        Replica::new("ch", NodeId::new(node), ReplicaOptions::default(), RestoredState::default())
    }

    fn init(r: &mut Replica, cfg: ReplicaConfig) {
        // Drain the Init request the machine emits on creation.
        let ready = r.ready();
        assert!(ready.iter().any(|m| m.kind == MessageKind::Init));
        let mut resp = Message::new(MessageKind::InitResp);
        resp.config = Some(cfg);
        r.step(resp);
    }

    fn propose(r: &mut Replica, data: &[u8]) {
        let mut msg = Message::new(MessageKind::Propose);
        msg.logs = vec![LogEntry::new(0, Term::default(), Bytes::copy_from_slice(data))];
        r.step(msg);
    }

    fn take_kind(msgs: &[Message], kind: MessageKind) -> Option<Message> {
        msgs.iter().find(|m| m.kind == kind).cloned()
    }

    #[test]
    fn test_single_node_propose_commit_apply() {
        let mut r = replica(1);
        init(&mut r, config(&[1], &[], 1, 1));
        assert!(r.is_leader());
        assert!(r.can_propose());

        propose(&mut r, b"hello");
        let ready = r.ready();
        let append = take_kind(&ready, MessageKind::StoreAppend).unwrap();
        assert_eq!(append.logs.len(), 1);
        assert_eq!(append.logs[0].index, 1);
        assert_eq!(append.logs[0].term, Term::new(1));

        let mut resp = Message::new(MessageKind::StoreAppendResp);
        resp.index = 1;
        r.step(resp);
        // Quorum of one: committed immediately, apply scheduled.
        assert_eq!(r.committed_index(), 1);
        let ready = r.ready();
        let apply = take_kind(&ready, MessageKind::ApplyLogs).unwrap();
        assert_eq!(apply.index, 0);
        assert_eq!(apply.committed_index, 1);

        let mut resp = Message::new(MessageKind::ApplyLogsResp);
        resp.index = 1;
        resp.applied_size = 5;
        r.step(resp);
        assert_eq!(r.applied_index(), 1);
        assert!(r
            .take_events()
            .contains(&ReplicaEvent::AppliedTo { index: 1 }));
    }

    #[test]
    fn test_follower_syncs_and_commits() {
        let mut r = replica(2);
        init(&mut r, config(&[1, 2], &[], 1, 1));
        assert_eq!(r.role(), Role::Follower);

        let ready = r.ready();
        let sync = take_kind(&ready, MessageKind::SyncGet).unwrap();
        assert_eq!(sync.to, NodeId::new(1));
        assert_eq!(sync.index, 1);

        let mut resp = Message::new(MessageKind::SyncGetResp);
        resp.from = NodeId::new(1);
        resp.term = Term::new(1);
        resp.committed_index = 2;
        resp.logs = vec![
            LogEntry::new(1, Term::new(1), Bytes::from_static(b"a")),
            LogEntry::new(2, Term::new(1), Bytes::from_static(b"b")),
        ];
        r.step(resp);

        let ready = r.ready();
        let append = take_kind(&ready, MessageKind::StoreAppend).unwrap();
        assert_eq!(append.logs.len(), 2);
        let mut resp = Message::new(MessageKind::StoreAppendResp);
        resp.index = 2;
        r.step(resp);

        assert_eq!(r.last_index(), 2);
        assert_eq!(r.committed_index(), 2);
        let ready = r.ready();
        assert!(take_kind(&ready, MessageKind::ApplyLogs).is_some());
    }

    #[test]
    fn test_leader_commits_on_majority_match() {
        let mut r = replica(1);
        init(&mut r, config(&[1, 2, 3], &[], 1, 1));
        propose(&mut r, b"x");
        let mut resp = Message::new(MessageKind::StoreAppendResp);
        resp.index = 1;
        r.step(resp);
        // Only the leader has the entry.
        assert_eq!(r.committed_index(), 0);

        let mut sync = Message::new(MessageKind::SyncGet);
        sync.from = NodeId::new(2);
        sync.index = 2; // follower already matched index 1
        r.step(sync);
        assert_eq!(r.committed_index(), 1);

        let ready = r.ready();
        let resp = take_kind(&ready, MessageKind::SyncGetResp).unwrap();
        assert_eq!(resp.to, NodeId::new(2));
        assert_eq!(resp.index, 2);
        assert_eq!(resp.committed_index, 1);
    }

    #[test]
    fn test_learner_is_excluded_from_quorum() {
        let mut r = replica(1);
        init(&mut r, config(&[1, 2, 3], &[4], 1, 1));
        propose(&mut r, b"x");
        let mut resp = Message::new(MessageKind::StoreAppendResp);
        resp.index = 1;
        r.step(resp);

        let mut sync = Message::new(MessageKind::SyncGet);
        sync.from = NodeId::new(4); // learner
        sync.index = 2;
        r.step(sync);
        assert_eq!(r.committed_index(), 0);

        let mut sync = Message::new(MessageKind::SyncGet);
        sync.from = NodeId::new(3); // voter
        sync.index = 2;
        r.step(sync);
        assert_eq!(r.committed_index(), 1);
    }

    #[test]
    fn test_election_on_missed_heartbeats() {
        let mut r = replica(2);
        init(&mut r, config(&[1, 2, 3], &[], 1, 1));
        r.ready();

        // No pings arrive; eventually the follower campaigns.
        for _ in 0..64 {
            r.tick();
            if r.role() == Role::Candidate {
                break;
            }
        }
        assert_eq!(r.role(), Role::Candidate);
        assert_eq!(r.term(), Term::new(2));
        let ready = r.ready();
        let vote = take_kind(&ready, MessageKind::VoteReq).unwrap();
        assert_eq!(vote.term, Term::new(2));

        let mut resp = Message::new(MessageKind::VoteResp);
        resp.from = NodeId::new(3);
        resp.term = Term::new(2);
        r.step(resp);
        assert!(r.is_leader());
        assert!(r
            .take_events()
            .contains(&ReplicaEvent::ElectedLeader { term: Term::new(2) }));
    }

    #[test]
    fn test_vote_granted_once_per_term() {
        let mut r = replica(3);
        init(&mut r, config(&[1, 2, 3], &[], 1, 1));
        r.ready();

        let mut req = Message::new(MessageKind::VoteReq);
        req.from = NodeId::new(2);
        req.term = Term::new(2);
        req.log_term = Term::default();
        req.index = 0;
        r.step(req.clone());
        let ready = r.ready();
        let resp = take_kind(&ready, MessageKind::VoteResp).unwrap();
        assert!(!resp.reject);

        // A different candidate in the same term is refused.
        req.from = NodeId::new(1);
        r.step(req);
        let ready = r.ready();
        let resp = take_kind(&ready, MessageKind::VoteResp).unwrap();
        assert!(resp.reject);
    }

    #[test]
    fn test_vote_rejected_for_stale_log() {
        let mut r = Replica::new(
            "ch",
            NodeId::new(3),
            ReplicaOptions::default(),
            RestoredState {
                last_index: 5,
                last_term: Term::new(1),
                committed: 5,
                applied: 5,
                last_leader_term: Term::default(),
            },
        );
        init(&mut r, config(&[1, 2, 3], &[], 1, 1));
        r.ready();

        let mut req = Message::new(MessageKind::VoteReq);
        req.from = NodeId::new(2);
        req.term = Term::new(2);
        req.log_term = Term::new(1);
        req.index = 3; // behind our index 5
        r.step(req);
        let ready = r.ready();
        assert!(take_kind(&ready, MessageKind::VoteResp).unwrap().reject);
    }

    #[test]
    fn test_conflict_check_reconciles_tail() {
        let mut r = Replica::new(
            "ch",
            NodeId::new(2),
            ReplicaOptions::default(),
            RestoredState {
                last_index: 9,
                last_term: Term::new(3),
                committed: 4,
                applied: 4,
                last_leader_term: Term::new(3),
            },
        );
        init(&mut r, config(&[1, 2], &[], 1, 4));
        // A local leader term exists, so the machine reconciles first.
        let ready = r.ready();
        let check = take_kind(&ready, MessageKind::LogConflictCheck).unwrap();
        assert_eq!(check.to, NodeId::new(1));
        assert_eq!(check.term, Term::new(3));
        assert!(!r.can_propose());

        let mut resp = Message::new(MessageKind::LogConflictCheckResp);
        resp.index = 5; // post-truncate tail computed by the worker
        resp.log_term = Term::new(2);
        r.step(resp);
        assert_eq!(r.last_index(), 5);
        // Sync resumes from the reconciled tail.
        let ready = r.ready();
        assert_eq!(take_kind(&ready, MessageKind::SyncGet).unwrap().index, 6);
    }

    #[test]
    fn test_conflict_check_reject_forces_reinit() {
        let mut r = Replica::new(
            "ch",
            NodeId::new(2),
            ReplicaOptions::default(),
            RestoredState {
                last_index: 3,
                last_term: Term::new(1),
                committed: 3,
                applied: 3,
                last_leader_term: Term::new(1),
            },
        );
        init(&mut r, config(&[1, 2], &[], 1, 1));
        r.ready();
        r.step(Message::reject_of(MessageKind::LogConflictCheckResp));
        let ready = r.ready();
        assert!(take_kind(&ready, MessageKind::Init).is_some());
    }

    #[test]
    fn test_ping_advances_commit_and_answers_pong() {
        let mut r = replica(2);
        init(&mut r, config(&[1, 2], &[], 1, 1));
        r.ready();
        // Stored two entries via sync.
        let mut resp = Message::new(MessageKind::SyncGetResp);
        resp.from = NodeId::new(1);
        resp.logs = vec![
            LogEntry::new(1, Term::new(1), Bytes::from_static(b"a")),
            LogEntry::new(2, Term::new(1), Bytes::from_static(b"b")),
        ];
        r.step(resp);
        let mut resp = Message::new(MessageKind::StoreAppendResp);
        resp.index = 2;
        r.step(resp);
        r.ready();

        let mut ping = Message::new(MessageKind::Ping);
        ping.from = NodeId::new(1);
        ping.term = Term::new(1);
        ping.index = 2;
        ping.committed_index = 2;
        r.step(ping);
        assert_eq!(r.committed_index(), 2);
        let ready = r.ready();
        let pong = take_kind(&ready, MessageKind::Pong).unwrap();
        assert_eq!(pong.to, NodeId::new(1));
        assert_eq!(pong.index, 2);
    }

    #[test]
    fn test_auto_slow_down_pauses_proposals() {
        let mut r = Replica::new(
            "ch",
            NodeId::new(1),
            ReplicaOptions {
                slow_down_threshold: 1,
                ..Default::default()
            },
            RestoredState::default(),
        );
        init(&mut r, config(&[1], &[], 1, 1));
        for data in [b"a", b"b", b"c"] {
            propose(&mut r, data);
        }
        let mut resp = Message::new(MessageKind::StoreAppendResp);
        resp.index = 3;
        r.step(resp);
        // committed 3, applied 0: gap beyond threshold pauses intake.
        assert_eq!(r.committed_index(), 3);
        assert!(!r.can_propose());

        let mut resp = Message::new(MessageKind::ApplyLogsResp);
        resp.index = 3;
        r.step(resp);
        assert!(r.can_propose());
    }

    #[test]
    fn test_migration_transition_emitted_when_caught_up() {
        let mut r = replica(1);
        let mut cfg = config(&[1, 2], &[3], 1, 1);
        cfg.migrate_from = NodeId::new(1);
        cfg.migrate_to = NodeId::new(3);
        init(&mut r, cfg);
        propose(&mut r, b"x");
        let mut resp = Message::new(MessageKind::StoreAppendResp);
        resp.index = 1;
        r.step(resp);
        let mut sync = Message::new(MessageKind::SyncGet);
        sync.from = NodeId::new(2);
        sync.index = 2;
        r.step(sync);
        assert_eq!(r.committed_index(), 1);
        r.ready();

        // Learner catches up to the committed index.
        let mut sync = Message::new(MessageKind::SyncGet);
        sync.from = NodeId::new(3);
        sync.index = 2;
        r.step(sync);
        let ready = r.ready();
        let transition = take_kind(&ready, MessageKind::LearnerToLeader).unwrap();
        assert_eq!(transition.transition_peer, NodeId::new(3));
    }

    #[test]
    fn test_unknown_role_requests_removal() {
        let mut r = replica(9);
        init(&mut r, config(&[1, 2], &[], 1, 1));
        assert!(r.take_events().contains(&ReplicaEvent::RemoveMe));
    }

    #[test]
    fn test_append_reject_backs_off_then_retries() {
        let mut r = replica(1);
        init(&mut r, config(&[1], &[], 1, 1));
        propose(&mut r, b"x");
        assert!(take_kind(&r.ready(), MessageKind::StoreAppend).is_some());

        r.step(Message::reject_of(MessageKind::StoreAppendResp));
        // Backoff: nothing re-emitted immediately.
        assert!(take_kind(&r.ready(), MessageKind::StoreAppend).is_none());
        r.tick();
        r.tick();
        let ready = r.ready();
        let append = take_kind(&ready, MessageKind::StoreAppend).unwrap();
        assert_eq!(append.logs[0].index, 1);
    }

    #[test]
    fn test_elected_leader_serves_inherited_log() {
        let mut r = Replica::new(
            "ch",
            NodeId::new(2),
            ReplicaOptions::default(),
            RestoredState {
                last_index: 4,
                last_term: Term::new(1),
                committed: 4,
                applied: 4,
                last_leader_term: Term::default(),
            },
        );
        init(&mut r, config(&[1, 2], &[], 1, 1));
        r.ready();
        for _ in 0..64 {
            r.tick();
            if r.role() == Role::Candidate {
                break;
            }
        }
        let mut resp = Message::new(MessageKind::VoteResp);
        resp.from = NodeId::new(1);
        resp.term = r.term();
        r.step(resp);
        assert!(r.is_leader());
        // The inherited log is announced to followers immediately.
        let ready = r.ready();
        let ping = take_kind(&ready, MessageKind::Ping).unwrap();
        assert_eq!(ping.index, 4);

        // A new proposal lands at exactly last + 1.
        propose(&mut r, b"next");
        let ready = r.ready();
        let append = take_kind(&ready, MessageKind::StoreAppend).unwrap();
        assert_eq!(append.logs[0].index, 5);
        assert_eq!(append.logs[0].term, r.term());
    }
}
