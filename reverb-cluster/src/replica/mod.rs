//! Per-handler replication state machine.
//!
//! One [`Replica`] drives one handler's log (a channel log or a slot log).
//! The machine is synchronous: the owning sub-reactor feeds it inbound
//! [`Message`]s through [`Replica::step`], calls [`Replica::tick`] on its
//! timer, and drains the outbox with [`Replica::ready`]. All I/O — storing
//! appends, serving log reads, applying committed entries, resolving
//! config — happens in reactor workers which report back as further step
//! messages, so the machine itself never blocks.

mod codec;
mod state;

pub use codec::StepEnvelope;
pub use state::{Replica, ReplicaOptions, RestoredState};

use reverb_core::{LogIndex, NodeId, Term};
use reverb_storage::LogEntry;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel index meaning "no conflict" in a conflict-check response.
pub const NO_CONFLICT: LogIndex = LogIndex::MAX;

/// Role of a replica within its handler's group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Accepts proposals, replicates to followers, advances commit.
    Leader,
    /// Votes and syncs from the leader.
    Follower,
    /// Syncs from the leader but is excluded from quorum.
    Learner,
    /// Transient election state.
    Candidate,
    /// Not part of the group; the reactor removes such handlers.
    Unknown,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leader => write!(f, "leader"),
            Self::Follower => write!(f, "follower"),
            Self::Learner => write!(f, "learner"),
            Self::Candidate => write!(f, "candidate"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Group membership and leadership for one handler, as resolved by the
/// cluster config layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Voting replicas. Contains the leader.
    pub replicas: Vec<NodeId>,
    /// Catching-up replicas, excluded from quorum.
    pub learners: Vec<NodeId>,
    /// Current leader, zero when none elected yet.
    pub leader: NodeId,
    /// Current term.
    pub term: Term,
    /// Source of an in-progress replica relocation.
    pub migrate_from: NodeId,
    /// Target of an in-progress replica relocation.
    pub migrate_to: NodeId,
    /// Monotonic config version.
    pub version: u64,
}

impl ReplicaConfig {
    /// Role of `node` under this config.
    pub fn role_of(&self, node: NodeId) -> Role {
        if self.leader == node {
            Role::Leader
        } else if self.learners.contains(&node) {
            Role::Learner
        } else if self.replicas.contains(&node) {
            Role::Follower
        } else {
            Role::Unknown
        }
    }

    /// Votes needed for commit or election.
    pub fn quorum(&self) -> usize {
        self.replicas.len() / 2 + 1
    }

    /// Whether the config carries no membership at all.
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty() && self.leader.is_none()
    }

    /// Whether `node` is a voting replica.
    pub fn is_replica(&self, node: NodeId) -> bool {
        self.replicas.contains(&node)
    }

    /// Whether `node` is a learner.
    pub fn is_learner(&self, node: NodeId) -> bool {
        self.learners.contains(&node)
    }

    /// Whether a replica relocation is in progress.
    pub fn migrating(&self) -> bool {
        !self.migrate_from.is_none() && !self.migrate_to.is_none()
    }
}

/// Message kinds exchanged between the state machine, the reactor workers,
/// and peer nodes. Worker-facing kinds never cross the wire; the sync,
/// heartbeat, and vote kinds do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Handler wants its config resolved (to the init worker).
    Init = 1,
    /// Config resolution result.
    InitResp = 2,
    /// Follower wants its log checked against the leader's term map.
    LogConflictCheck = 3,
    /// Conflict-check result; `index` is the post-truncate tail.
    LogConflictCheckResp = 4,
    /// Entries to persist (to the append worker).
    StoreAppend = 5,
    /// Persisted up to `index`.
    StoreAppendResp = 6,
    /// Follower → leader: send me entries from `index`.
    SyncGet = 7,
    /// Leader → follower: entries plus my committed index.
    SyncGetResp = 8,
    /// Committed entries to apply (to the apply worker).
    ApplyLogs = 9,
    /// Applied up to `index`; `applied_size` feeds flow control.
    ApplyLogsResp = 10,
    /// New entries from the local proposer.
    Propose = 11,
    /// Leader heartbeat carrying committed and last index.
    Ping = 12,
    /// Heartbeat ack.
    Pong = 13,
    /// Election vote request; `log_term`/`index` describe the candidate log.
    VoteReq = 14,
    /// Election vote answer; `reject` means denied.
    VoteResp = 15,
    /// Promote a caught-up learner to follower (to the transition worker).
    LearnerToFollower = 16,
    /// Hand leadership to a caught-up learner.
    LearnerToLeader = 17,
    /// Hand leadership to a caught-up follower.
    FollowerToLeader = 18,
}

impl MessageKind {
    /// Convert from the wire discriminant.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Init,
            2 => Self::InitResp,
            3 => Self::LogConflictCheck,
            4 => Self::LogConflictCheckResp,
            5 => Self::StoreAppend,
            6 => Self::StoreAppendResp,
            7 => Self::SyncGet,
            8 => Self::SyncGetResp,
            9 => Self::ApplyLogs,
            10 => Self::ApplyLogsResp,
            11 => Self::Propose,
            12 => Self::Ping,
            13 => Self::Pong,
            14 => Self::VoteReq,
            15 => Self::VoteResp,
            16 => Self::LearnerToFollower,
            17 => Self::LearnerToLeader,
            18 => Self::FollowerToLeader,
        _ => return None,
        })
    }

    /// Whether the kind travels between nodes (vs. reactor workers).
    pub fn is_wire(&self) -> bool {
        matches!(
            self,
            Self::SyncGet
                | Self::SyncGetResp
                | Self::Ping
                | Self::Pong
                | Self::VoteReq
                | Self::VoteResp
        )
    }
}

/// One step message. A single struct rather than per-kind payload types:
/// the reactor routes on `(kind, to)` and the overlap between kinds is
/// nearly total, the same shape message-driven consensus cores use.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// What the message is.
    pub kind: MessageKind,
    /// Sender node, zero for local worker results.
    pub from: NodeId,
    /// Target node, zero for local worker requests.
    pub to: NodeId,
    /// Sender's term (candidate's new term on `VoteReq`).
    pub term: Term,
    /// Term of the sender's last log entry (`VoteReq` only).
    pub log_term: Term,
    /// Kind-specific index: sync start, append tail, conflict tail…
    pub index: LogIndex,
    /// Sender's committed index where relevant.
    pub committed_index: LogIndex,
    /// Bytes applied, reported by the apply worker.
    pub applied_size: u64,
    /// Log entries in flight.
    pub logs: Vec<LogEntry>,
    /// Resolved config (`InitResp`).
    pub config: Option<ReplicaConfig>,
    /// Affected node for role transitions.
    pub transition_peer: NodeId,
    /// The worker or peer refused; the machine decides retry vs. re-init.
    pub reject: bool,
}

impl Message {
    /// A blank message of the given kind; builders fill the rest.
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            from: NodeId::none(),
            to: NodeId::none(),
            term: Term::default(),
            log_term: Term::default(),
            index: 0,
            committed_index: 0,
            applied_size: 0,
            logs: Vec::new(),
            config: None,
            transition_peer: NodeId::none(),
            reject: false,
        }
    }

    /// A rejection response of the given kind.
    pub fn reject_of(kind: MessageKind) -> Self {
        let mut msg = Self::new(kind);
        msg.reject = true;
        msg
    }
}

/// Side effects the reactor must perform after a step batch, beyond
/// sending messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaEvent {
    /// The machine won an election; the host persists the new leadership.
    ElectedLeader {
        /// The won term.
        term: Term,
    },
    /// Applied advanced; waiters at or below `index` may complete.
    AppliedTo {
        /// New applied index.
        index: LogIndex,
    },
    /// The machine's role under the latest config is `Unknown`.
    RemoveMe,
}

/// Leader-side view of one peer's progress.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    /// Highest index known persisted on the peer.
    pub match_index: LogIndex,
    /// Next index the peer will ask for.
    pub next_index: LogIndex,
    /// Ticks since the peer last contacted us.
    pub idle_ticks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_of() {
        let config = ReplicaConfig {
            replicas: vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)],
            learners: vec![NodeId::new(4)],
            leader: NodeId::new(1),
            term: Term::new(1),
            ..Default::default()
        };
        assert_eq!(config.role_of(NodeId::new(1)), Role::Leader);
        assert_eq!(config.role_of(NodeId::new(2)), Role::Follower);
        assert_eq!(config.role_of(NodeId::new(4)), Role::Learner);
        assert_eq!(config.role_of(NodeId::new(9)), Role::Unknown);
        assert_eq!(config.quorum(), 2);
    }

    #[test]
    fn test_kind_wire_split() {
        assert!(MessageKind::SyncGet.is_wire());
        assert!(MessageKind::VoteReq.is_wire());
        assert!(!MessageKind::StoreAppend.is_wire());
        assert!(!MessageKind::ApplyLogs.is_wire());
    }

    #[test]
    fn test_kind_discriminants_roundtrip() {
        for value in 1u8..=18 {
            let kind = MessageKind::from_u8(value).unwrap();
            assert_eq!(kind as u8, value);
        }
        assert!(MessageKind::from_u8(0).is_none());
        assert!(MessageKind::from_u8(19).is_none());
    }
}
