//! Multi-node scenarios over the in-memory transport mesh.

use bytes::Bytes;
use parking_lot::Mutex;
use reverb_broker::{Broker, DeliverSink, StoredMessage};
use reverb_cluster::MemoryMesh;
use reverb_core::{channel_key, ChannelType, NodeConfig, NodeId, PeerConfig};
use std::sync::Arc;
use std::time::Duration;

/// Captures local deliveries per uid.
#[derive(Default)]
struct CaptureSink {
    received: Mutex<Vec<(String, StoredMessage)>>,
}

impl DeliverSink for CaptureSink {
    fn deliver_local(&self, uids: &[String], messages: &[StoredMessage]) {
        let mut received = self.received.lock();
        for uid in uids {
            for message in messages {
                received.push((uid.clone(), message.clone()));
            }
        }
    }
}

impl CaptureSink {
    fn payloads_for(&self, uid: &str) -> Vec<Vec<u8>> {
        self.received
            .lock()
            .iter()
            .filter(|(u, _)| u == uid)
            .map(|(_, m)| m.payload.clone())
            .collect()
    }
}

fn node_config(node_id: u64, peers: &[u64]) -> NodeConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    NodeConfig {
        peers: peers
            .iter()
            .map(|n| PeerConfig {
                node_id: *n,
                addr: String::new(),
            })
            .collect(),
        reactor_sub_count: 2,
        slot_count: 8,
        tick_interval_ms: 20,
        req_timeout_ms: 2_000,
        election_timeout_ticks: 8,
        ..NodeConfig::new(node_id)
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, check: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn wait_until_async<F, Fut>(what: &str, timeout: Duration, check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// A uid whose owning slot is led by `leader` under the given cluster.
fn uid_with_slot_leader(broker: &Broker, leader: NodeId) -> String {
    for i in 0..10_000 {
        let uid = format!("user{}", i);
        if broker.slots().slot_leader_of_channel(&uid).unwrap() == leader {
            return uid;
        }
    }
    panic!("no uid found with slot leader {}", leader);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_node_publish() {
    let mesh = MemoryMesh::new();
    let sink = Arc::new(CaptureSink::default());
    let broker = Broker::with_mesh(node_config(1, &[1]), mesh, sink.clone())
        .await
        .unwrap();

    broker
        .propose_send("A", "B", ChannelType::Person, Bytes::from_static(b"hello"), false)
        .await
        .unwrap();

    wait_until("B to receive hello", Duration::from_secs(5), || {
        sink.payloads_for("B").iter().any(|p| p == b"hello")
    })
    .await;

    wait_until_async("delivered cursor to advance", Duration::from_secs(5), || async {
        broker
            .channel_snapshot("B", ChannelType::Person)
            .await
            .map_or(false, |s| s.delivered_index == 1)
    })
    .await;

    // The publish is durable in the channel's replicated log.
    assert_eq!(broker.log_store().last_index(&channel_key("B", ChannelType::Person)), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_node_cross_delivery() {
    let mesh = MemoryMesh::new();
    let sinks = [Arc::new(CaptureSink::default()), Arc::new(CaptureSink::default())];
    let n1 = Broker::with_mesh(node_config(1, &[1, 2]), mesh.clone(), sinks[0].clone())
        .await
        .unwrap();
    let n2 = Broker::with_mesh(node_config(2, &[1, 2]), mesh.clone(), sinks[1].clone())
        .await
        .unwrap();

    // Pick a recipient homed on node 2, so the publish crosses nodes.
    let uid = uid_with_slot_leader(&n1, NodeId::new(2));

    n1.propose_send("A", &uid, ChannelType::Person, Bytes::from_static(b"hello"), false)
        .await
        .unwrap();

    wait_until("recipient to receive hello", Duration::from_secs(10), || {
        sinks[1].payloads_for(&uid).iter().any(|p| p == b"hello")
    })
    .await;

    // The channel's config assigns leadership to the owning slot leader.
    let config = n2
        .meta()
        .channel_cluster_config(&uid, ChannelType::Person)
        .unwrap()
        .expect("config replicated to the slot leader");
    assert_eq!(config.leader, NodeId::new(2));

    // The forwarding side never delivered locally.
    assert!(sinks[0].payloads_for(&uid).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replicas_converge_on_committed_log() {
    let mesh = MemoryMesh::new();
    let sinks = [Arc::new(CaptureSink::default()), Arc::new(CaptureSink::default())];
    let n1 = Broker::with_mesh(node_config(1, &[1, 2]), mesh.clone(), sinks[0].clone())
        .await
        .unwrap();
    let n2 = Broker::with_mesh(node_config(2, &[1, 2]), mesh.clone(), sinks[1].clone())
        .await
        .unwrap();

    let uid = uid_with_slot_leader(&n1, NodeId::new(1));
    let key = channel_key(&uid, ChannelType::Person);
    for payload in [b"one".as_ref(), b"two", b"three"] {
        n1.propose_send("A", &uid, ChannelType::Person, Bytes::copy_from_slice(payload), false)
            .await
            .unwrap();
    }

    wait_until("all three to deliver", Duration::from_secs(10), || {
        sinks[0].payloads_for(&uid).len() == 3
    })
    .await;

    // The follower's log catches up to the leader's, entry for entry.
    wait_until("follower log to converge", Duration::from_secs(10), || {
        n2.log_store().last_index(&key) == n1.log_store().last_index(&key)
    })
    .await;
    let leader_logs = n1.log_store().logs(&key, 1, 10).unwrap();
    let follower_logs = n2.log_store().logs(&key, 1, 10).unwrap();
    assert_eq!(leader_logs, follower_logs);
    assert_eq!(leader_logs.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slot_migration_moves_leadership() {
    let mesh = MemoryMesh::new();
    let sinks = [Arc::new(CaptureSink::default()), Arc::new(CaptureSink::default())];
    let n1 = Broker::with_mesh(node_config(1, &[1, 2]), mesh.clone(), sinks[0].clone())
        .await
        .unwrap();
    let n2 = Broker::with_mesh(node_config(2, &[1, 2]), mesh.clone(), sinks[1].clone())
        .await
        .unwrap();

    // Find a slot node 1 leads.
    let slot = (0..8)
        .find(|s| n1.slots().slot_state(*s).unwrap().leader == NodeId::new(1))
        .expect("node 1 leads some slot");

    n1.slots().migrate_slot(slot, NodeId::new(2)).await.unwrap();

    wait_until("slot leadership to move", Duration::from_secs(10), || {
        n1.slots().slot_state(slot).unwrap().leader == NodeId::new(2)
            && n2.slots().slot_state(slot).unwrap().leader == NodeId::new(2)
    })
    .await;

    // A publish into the migrated slot lands in node 2's channel log.
    let uid = (0..10_000)
        .map(|i| format!("user{}", i))
        .find(|uid| n1.slots().slot_id_of_channel(uid) == slot)
        .unwrap();
    n1.propose_send("A", &uid, ChannelType::Person, Bytes::from_static(b"after"), false)
        .await
        .unwrap();
    let key = channel_key(&uid, ChannelType::Person);
    wait_until("publish to land on new leader", Duration::from_secs(10), || {
        n2.log_store().last_index(&key) >= 1
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_node_joins_as_learner_then_replica() {
    let mesh = MemoryMesh::new();
    let sinks = [
        Arc::new(CaptureSink::default()),
        Arc::new(CaptureSink::default()),
        Arc::new(CaptureSink::default()),
    ];
    let mut cfg1 = node_config(1, &[1, 2, 3]);
    cfg1.bootstrap_nodes = vec![1, 2];
    cfg1.slot_replica_max_count = 3;
    let mut cfg2 = node_config(2, &[1, 2, 3]);
    cfg2.bootstrap_nodes = vec![1, 2];
    cfg2.slot_replica_max_count = 3;
    let mut cfg3 = node_config(3, &[1, 2, 3]);
    cfg3.bootstrap_nodes = vec![1, 2];
    cfg3.slot_replica_max_count = 3;

    let n1 = Broker::with_mesh(cfg1, mesh.clone(), sinks[0].clone()).await.unwrap();
    let n2 = Broker::with_mesh(cfg2, mesh.clone(), sinks[1].clone()).await.unwrap();
    let _n3 = Broker::with_mesh(cfg3, mesh.clone(), sinks[2].clone()).await.unwrap();

    n1.slots().node_join(NodeId::new(3)).await.unwrap();
    n2.slots().node_join(NodeId::new(3)).await.unwrap();

    // Within the window, node 3 graduates from learner to voting replica
    // in at least one slot.
    wait_until("node 3 to become a replica", Duration::from_secs(10), || {
        (0..8).any(|s| {
            n1.slots()
                .slot_state(s)
                .map_or(false, |state| state.replicas.contains(&NodeId::new(3)))
        })
    })
    .await;

    let slot = (0..8)
        .find(|s| {
            n1.slots()
                .slot_state(*s)
                .map_or(false, |state| state.replicas.contains(&NodeId::new(3)))
        })
        .unwrap();
    let state = n1.slots().slot_state(slot).unwrap();
    assert!(!state.learners.contains(&NodeId::new(3)));
    assert!(state.replicas.contains(&NodeId::new(3)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_channel_leader_failover() {
    let mesh = MemoryMesh::new();
    let sinks = [
        Arc::new(CaptureSink::default()),
        Arc::new(CaptureSink::default()),
        Arc::new(CaptureSink::default()),
    ];
    let n1 = Broker::with_mesh(node_config(1, &[1, 2, 3]), mesh.clone(), sinks[0].clone())
        .await
        .unwrap();
    let n2 = Broker::with_mesh(node_config(2, &[1, 2, 3]), mesh.clone(), sinks[1].clone())
        .await
        .unwrap();
    let n3 = Broker::with_mesh(node_config(3, &[1, 2, 3]), mesh.clone(), sinks[2].clone())
        .await
        .unwrap();

    // Establish a channel whose leader is node 3.
    let uid = uid_with_slot_leader(&n1, NodeId::new(3));
    let key = channel_key(&uid, ChannelType::Person);
    n1.propose_send("A", &uid, ChannelType::Person, Bytes::from_static(b"before"), false)
        .await
        .unwrap();
    wait_until("first publish to deliver", Duration::from_secs(10), || {
        sinks[2].payloads_for(&uid).iter().any(|p| p == b"before")
    })
    .await;
    // Let replication reach the followers before the crash.
    wait_until("followers to hold the entry", Duration::from_secs(10), || {
        n1.log_store().last_index(&key) == 1 || n2.log_store().last_index(&key) == 1
    })
    .await;
    let pre_failure = n3.log_store().last_index(&key);
    assert_eq!(pre_failure, 1);

    mesh.take_down(NodeId::new(3));

    // The next publish from a surviving node succeeds on a new leader.
    n1.propose_send("A", &uid, ChannelType::Person, Bytes::from_static(b"after"), false)
        .await
        .unwrap();

    wait_until("survivor to deliver after failover", Duration::from_secs(20), || {
        sinks[0].payloads_for(&uid).iter().any(|p| p == b"after")
            || sinks[1].payloads_for(&uid).iter().any(|p| p == b"after")
    })
    .await;

    // Leadership moved off the dead node and the log advanced by one.
    let config = n1
        .meta()
        .channel_cluster_config(&uid, ChannelType::Person)
        .unwrap()
        .or_else(|| {
            n2.meta()
                .channel_cluster_config(&uid, ChannelType::Person)
                .unwrap()
        })
        .expect("failover config recorded");
    assert_ne!(config.leader, NodeId::new(3));
    let new_leader = if config.leader == NodeId::new(1) { &n1 } else { &n2 };
    assert_eq!(new_leader.log_store().last_index(&key), pre_failure + 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_group_channel_requires_subscription() {
    let mesh = MemoryMesh::new();
    let sink = Arc::new(CaptureSink::default());
    let broker = Broker::with_mesh(node_config(1, &[1]), mesh, sink.clone())
        .await
        .unwrap();

    broker
        .add_subscribers("room", ChannelType::Group, vec!["alice".into(), "bob".into()])
        .await
        .unwrap();

    // A subscriber's publish fans out to every subscriber.
    broker
        .propose_send("alice", "room", ChannelType::Group, Bytes::from_static(b"hi"), false)
        .await
        .unwrap();
    wait_until("both subscribers to receive", Duration::from_secs(5), || {
        sink.payloads_for("alice").iter().any(|p| p == b"hi")
            && sink.payloads_for("bob").iter().any(|p| p == b"hi")
    })
    .await;

    // An outsider's publish is dropped by the permission stage.
    broker
        .propose_send("mallory", "room", ChannelType::Group, Bytes::from_static(b"spam"), false)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(sink.payloads_for("alice").iter().all(|p| p != b"spam"));
    assert!(sink.payloads_for("bob").iter().all(|p| p != b"spam"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_migrate_follower_to_leader_keeps_log() {
    let mesh = MemoryMesh::new();
    let sinks = [Arc::new(CaptureSink::default()), Arc::new(CaptureSink::default())];
    let mut cfg1 = node_config(1, &[1, 2]);
    cfg1.slot_replica_max_count = 2;
    let mut cfg2 = node_config(2, &[1, 2]);
    cfg2.slot_replica_max_count = 2;
    let n1 = Broker::with_mesh(cfg1, mesh.clone(), sinks[0].clone()).await.unwrap();
    let n2 = Broker::with_mesh(cfg2, mesh.clone(), sinks[1].clone()).await.unwrap();

    let slot = (0..8)
        .find(|s| n1.slots().slot_state(*s).unwrap().leader == NodeId::new(1))
        .unwrap();

    // Put something in the slot log first (a channel config of a channel
    // owned by this slot).
    let uid = (0..10_000)
        .map(|i| format!("user{}", i))
        .find(|uid| n1.slots().slot_id_of_channel(uid) == slot)
        .unwrap();
    n1.propose_send("A", &uid, ChannelType::Person, Bytes::from_static(b"x"), false)
        .await
        .unwrap();
    wait_until("seed publish to deliver", Duration::from_secs(10), || {
        sinks[0].payloads_for(&uid).iter().any(|p| p == b"x")
    })
    .await;

    let slot_log_key = reverb_core::slot_key(slot);
    let pre_migrate_committed = n1.log_store().committed_index(&slot_log_key);
    assert!(pre_migrate_committed >= 1);

    n1.slots().migrate_slot(slot, NodeId::new(2)).await.unwrap();
    wait_until("leadership to hand over", Duration::from_secs(10), || {
        n1.slots().slot_state(slot).unwrap().leader == NodeId::new(2)
            && n2.slots().slot_state(slot).unwrap().leader == NodeId::new(2)
    })
    .await;

    // No committed slot-log entry is lost: the new leader's log covers
    // everything committed before the handover.
    wait_until("new leader log to cover the old tail", Duration::from_secs(10), || {
        n2.log_store().last_index(&slot_log_key) >= pre_migrate_committed
    })
    .await;
    let old = n1.log_store().logs(&slot_log_key, 1, pre_migrate_committed + 1).unwrap();
    let new = n2.log_store().logs(&slot_log_key, 1, pre_migrate_committed + 1).unwrap();
    assert_eq!(old, new);
}
