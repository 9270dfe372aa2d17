//! Receiver tags: cached fan-out plans.
//!
//! A tag snapshots a channel's recipients grouped by home node. Tags are
//! immutable after publish and shared lock-free; subscriber churn
//! invalidates the channel's tag key so the next deliver rebuilds.

use dashmap::DashMap;
use reverb_core::NodeId;
use std::sync::Arc;
use uuid::Uuid;

/// Recipients homed on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUsers {
    /// Home node.
    pub node_id: NodeId,
    /// Uids homed there.
    pub uids: Vec<String>,
}

/// An immutable fan-out snapshot.
#[derive(Debug)]
pub struct Tag {
    /// Tag key (random uuid).
    pub key: String,
    /// Per-node recipient groups.
    pub node_users: Vec<NodeUsers>,
}

impl Tag {
    /// Total recipient count.
    pub fn recipient_count(&self) -> usize {
        self.node_users.iter().map(|g| g.uids.len()).sum()
    }
}

/// Process-wide tag registry.
#[derive(Debug, Default)]
pub struct TagManager {
    tags: DashMap<String, Arc<Tag>>,
}

impl TagManager {
    /// Create an empty manager.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Group `(uid, home_node)` pairs and publish a tag under a fresh
    /// key.
    pub fn add_or_update_receiver_tag(&self, homes: Vec<(String, NodeId)>) -> Arc<Tag> {
        let mut groups: Vec<NodeUsers> = Vec::new();
        for (uid, node_id) in homes {
            match groups.iter_mut().find(|g| g.node_id == node_id) {
                Some(group) => group.uids.push(uid),
                None => groups.push(NodeUsers {
                    node_id,
                    uids: vec![uid],
                }),
            }
        }
        let key = Uuid::new_v4().to_string();
        let tag = Arc::new(Tag {
            key: key.clone(),
            node_users: groups,
        });
        self.tags.insert(key, tag.clone());
        tag
    }

    /// Look up a published tag.
    pub fn get(&self, key: &str) -> Option<Arc<Tag>> {
        self.tags.get(key).map(|t| t.clone())
    }

    /// Drop a tag (its channel's subscriber set changed).
    pub fn remove(&self, key: &str) {
        self.tags.remove(key);
    }

    /// Number of live tags.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Whether no tags are live.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_groups_by_home_node() {
        let manager = TagManager::new();
        let tag = manager.add_or_update_receiver_tag(vec![
            ("alice".into(), NodeId::new(1)),
            ("bob".into(), NodeId::new(2)),
            ("carol".into(), NodeId::new(1)),
        ]);
        assert_eq!(tag.recipient_count(), 3);
        assert_eq!(tag.node_users.len(), 2);
        let n1 = tag.node_users.iter().find(|g| g.node_id == NodeId::new(1)).unwrap();
        assert_eq!(n1.uids, vec!["alice", "carol"]);
    }

    #[test]
    fn test_tag_lookup_and_invalidation() {
        let manager = TagManager::new();
        let tag = manager.add_or_update_receiver_tag(vec![("alice".into(), NodeId::new(1))]);
        assert!(manager.get(&tag.key).is_some());
        manager.remove(&tag.key);
        assert!(manager.get(&tag.key).is_none());
    }

    #[test]
    fn test_fresh_key_per_publish() {
        let manager = TagManager::new();
        let a = manager.add_or_update_receiver_tag(vec![("alice".into(), NodeId::new(1))]);
        let b = manager.add_or_update_receiver_tag(vec![("alice".into(), NodeId::new(1))]);
        assert_ne!(a.key, b.key);
        assert_eq!(manager.len(), 2);
    }
}
