//! # Core Types
//!
//! Fundamental identifiers used throughout the Reverb cluster.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Unique identifier for a node in the cluster.
///
/// Nodes are addressed by a small integer assigned at deployment time; the
/// wire protocol carries them as varints, so they are `u64` rather than a
/// random UUID.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(u64);

impl NodeId {
    /// Create a node ID from its numeric value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the underlying value.
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// The zero node ID, used as "no node" in configs and progress maps.
    pub const fn none() -> Self {
        Self(0)
    }

    /// Whether this is the "no node" placeholder.
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<NodeId> for u64 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

/// Term number for the replication protocol.
///
/// Incremented only on leader change; `u32` matches the committed log-entry
/// wire format.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Term(u32);

impl Term {
    /// Create a term with the given value.
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the term value.
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// Get the next term without modifying this one.
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Whether the term is zero (no leader has ever been elected).
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Term {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Term> for u32 {
    fn from(term: Term) -> Self {
        term.0
    }
}

/// Log index type for the replicated log. Indices are contiguous from 1;
/// 0 means "no entry".
pub type LogIndex = u64;

/// Numeric partition of the channel-id space. Each slot runs its own
/// consensus group and arbitrates the cluster configs of its channels.
pub type SlotId = u32;

/// Message identifier assigned at ingress. Carries the connection-receive
/// order of a client's packets into the replicated log.
pub type MessageId = u64;

/// Kind of channel, carried alongside the channel id in every key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChannelType {
    /// Person-to-person channel; the channel id is `"{uid}@{uid}"`.
    Person = 1,
    /// Group channel with a stored subscriber list.
    Group = 2,
    /// System channel (server-originated notifications).
    System = 3,
    /// Data channel (no conversation semantics).
    Data = 4,
}

impl ChannelType {
    /// Convert from the wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Person),
            2 => Some(Self::Group),
            3 => Some(Self::System),
            4 => Some(Self::Data),
            _ => None,
        }
    }

    /// The wire byte for this channel type.
    pub const fn as_u8(&self) -> u8 {
        *self as u8
    }
}

impl Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Person => write!(f, "person"),
            Self::Group => write!(f, "group"),
            Self::System => write!(f, "system"),
            Self::Data => write!(f, "data"),
        }
    }
}

/// Build the handler key for a channel.
///
/// Channels and slots share one reactor design; the handler key is the
/// string that names a handler inside a reactor.
pub fn channel_key(channel_id: &str, channel_type: ChannelType) -> String {
    format!("{}-{}", channel_id, channel_type.as_u8())
}

/// Split a handler key back into `(channel_id, channel_type)`.
///
/// Returns `None` when the key was not produced by [`channel_key`].
pub fn channel_from_key(key: &str) -> Option<(String, ChannelType)> {
    let (id, ty) = key.rsplit_once('-')?;
    let ty = ChannelType::from_u8(ty.parse().ok()?)?;
    Some((id.to_string(), ty))
}

/// Handler key for a slot's own consensus group.
pub fn slot_key(slot: SlotId) -> String {
    format!("slot-{}", slot)
}

/// The two uids of a person channel, when the channel id is the fake
/// `"{uid}@{uid}"` form.
pub fn person_channel_uids(channel_id: &str) -> Option<(&str, &str)> {
    channel_id.split_once('@')
}

/// Stable FNV-1a hash used for slot assignment and sub-reactor sharding.
/// Must stay identical on every node, so no `std::hash::RandomState`.
pub fn fnv1a(data: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_roundtrip() {
        let id = NodeId::new(42);
        assert_eq!(id.value(), 42);
        assert_eq!(u64::from(id), 42);
        assert_eq!(NodeId::from(42u64), id);
        assert!(NodeId::none().is_none());
        assert!(!id.is_none());
    }

    #[test]
    fn test_term_ordering() {
        let t1 = Term::new(1);
        let t2 = t1.next();
        assert!(t2 > t1);
        assert_eq!(t2.value(), 2);
        assert!(Term::default().is_zero());
    }

    #[test]
    fn test_channel_type_wire_byte() {
        for ty in [
            ChannelType::Person,
            ChannelType::Group,
            ChannelType::System,
            ChannelType::Data,
        ] {
            assert_eq!(ChannelType::from_u8(ty.as_u8()), Some(ty));
        }
        assert_eq!(ChannelType::from_u8(0), None);
        assert_eq!(ChannelType::from_u8(9), None);
    }

    #[test]
    fn test_channel_key_roundtrip() {
        let key = channel_key("alice@bob", ChannelType::Person);
        assert_eq!(key, "alice@bob-1");
        let (id, ty) = channel_from_key(&key).unwrap();
        assert_eq!(id, "alice@bob");
        assert_eq!(ty, ChannelType::Person);
        assert!(channel_from_key("no-type-x").is_none());
    }

    #[test]
    fn test_person_channel_uids() {
        assert_eq!(person_channel_uids("a@b"), Some(("a", "b")));
        assert_eq!(person_channel_uids("group1"), None);
    }

    #[test]
    fn test_fnv1a_is_stable() {
        // Pinned values: slot assignment must agree across nodes and releases.
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"alice"), fnv1a(b"alice"));
        assert_ne!(fnv1a(b"alice"), fnv1a(b"bob"));
    }
}
