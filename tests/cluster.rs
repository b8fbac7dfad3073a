use bytes::Bytes;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use paravon::network::LocalNetwork;
use paravon::replication::ConsistencyLevel;
use paravon::storage::{NodeId, StorageEngine, UpdateStamp, VersionedValue};
use paravon::{Config, Node};

const WAIT: Duration = Duration::from_secs(5);

fn node_config(id: &str, port: u16, n: usize, w: usize, r: usize, retention_ms: u64) -> Config {
    let raw = json!({
        "node_id": id,
        "peer_port": port,
        "api_port": port - 5000,
        "admin_port": port - 1000,
        "seeds": ["127.0.0.1:7001"],
        "vnodes": 16,
        "replication_factor": n,
        "write_quorum": w,
        "read_quorum": r,
        "hint_retention_ms": retention_ms,
        "request_timeout_ms": 500,
        "hint_sweep_interval_ms": 50,
        "gossip_interval_ms": 20,
        "suspect_after": 25,
        "dead_after": 50,
        "dwell_ms": 0,
        "ping_timeout_ms": 100
    });
    Config::from_json(&raw.to_string()).unwrap()
}

struct TestCluster {
    net: Arc<LocalNetwork>,
    nodes: Vec<Node>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<paravon::Result<()>>>,
}

impl TestCluster {
    async fn start(ids: &[&str], w: usize, r: usize, retention_ms: u64) -> Self {
        let net = LocalNetwork::new();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut nodes = Vec::new();
        let mut tasks = Vec::new();

        for (i, id) in ids.iter().enumerate() {
            let config = node_config(id, 7001 + i as u16, ids.len(), w, r, retention_ms);
            let transport = Arc::new(net.transport(config.node_id(), config.peer_addr(), Duration::from_millis(500)));
            let mut node = Node::assemble(config, Arc::new(StorageEngine::in_memory()), transport)
                .await
                .unwrap();
            net.register(node.config().peer_addr(), node.peer_handler());
            tasks.extend(node.spawn_background(shutdown_rx.clone()).unwrap());
            nodes.push(node);
        }

        let cluster = Self {
            net,
            nodes,
            shutdown,
            tasks,
        };
        cluster.wait_for_ring().await;
        cluster
    }

    async fn wait_for_ring(&self) {
        let nodes = &self.nodes;
        let expected = nodes.len();
        wait_until(move || async move {
            nodes
                .iter()
                .all(|node| node.context().topology().snapshot().members.len() == expected)
        })
        .await;
    }

    fn node(&self, id: &str) -> &Node {
        self.nodes
            .iter()
            .find(|node| node.config().node_id == id)
            .unwrap()
    }

    fn addr(&self, id: &str) -> String {
        self.node(id).config().peer_addr()
    }

    async fn stored(&self, id: &str, key: &[u8]) -> Option<VersionedValue> {
        self.node(id).context().storage().get(key).await.unwrap()
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        for task in self.tasks {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
    }
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in {:?}", WAIT);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn payload(value: &VersionedValue) -> &[u8] {
    value.bytes().map(|b| b.as_ref()).unwrap_or_default()
}

#[tokio::test]
async fn three_nodes_put_get_delete() {
    let cluster = TestCluster::start(&["a", "b", "c"], 2, 2, 60_000).await;
    let a = cluster.node("a").coordinator();
    let b = cluster.node("b").coordinator();

    let receipt = a
        .put(Bytes::from_static(b"users/1"), Bytes::from_static(b"ada"), ConsistencyLevel::Default)
        .await
        .unwrap();
    assert!(receipt.acks >= 2);
    assert_eq!(receipt.required, 2);

    let value = b.get(b"users/1", ConsistencyLevel::Default).await.unwrap().unwrap();
    assert_eq!(payload(&value), b"ada");

    b.delete(Bytes::from_static(b"users/1"), ConsistencyLevel::Default)
        .await
        .unwrap();
    assert!(a.get(b"users/1", ConsistencyLevel::Default).await.unwrap().is_none());

    // The delete is kept as a tombstone until reclamation.
    let view = &cluster;
    wait_until(move || async move {
        let mut tombstones = 0;
        for id in ["a", "b", "c"] {
            if view.stored(id, b"users/1").await.map(|v| v.is_tombstone()) == Some(true) {
                tombstones += 1;
            }
        }
        tombstones == 3
    })
    .await;

    cluster.stop().await;
}

#[tokio::test]
async fn missed_write_reaches_replica_through_handoff() {
    let cluster = TestCluster::start(&["a", "b", "c"], 2, 2, 60_000).await;
    let b_id = NodeId::from("b");
    let b_addr = cluster.addr("b");

    cluster.net.isolate(&b_addr);
    let receipt = cluster
        .node("a")
        .coordinator()
        .put(Bytes::from_static(b"k"), Bytes::from_static(b"v1"), ConsistencyLevel::Default)
        .await
        .unwrap();
    assert_eq!(receipt.required, 2);

    let handoff = cluster.node("a").context().handoff();
    let target = &b_id;
    wait_until(move || async move { handoff.pending(target) == 1 }).await;
    assert!(cluster.stored("b", b"k").await.is_none());

    cluster.net.reconnect(&b_addr);
    let view = &cluster;
    wait_until(move || async move { view.stored("b", b"k").await.is_some() }).await;

    let stored = cluster.stored("b", b"k").await.unwrap();
    assert_eq!(payload(&stored), b"v1");
    assert_eq!(stored.stamp, receipt.stamp);
    wait_until(move || async move { handoff.pending(target) == 0 }).await;

    cluster.stop().await;
}

#[tokio::test]
async fn higher_stamp_wins_and_is_repaired() {
    let cluster = TestCluster::start(&["a", "b", "c"], 2, 2, 60_000).await;

    let older = VersionedValue::data("old", UpdateStamp::new(5, NodeId::from("a")));
    let newer = VersionedValue::data("new", UpdateStamp::new(7, NodeId::from("c")));
    cluster
        .node("a")
        .context()
        .replica()
        .apply(b"k", older)
        .await
        .unwrap();
    cluster
        .node("c")
        .context()
        .replica()
        .apply(b"k", newer.clone())
        .await
        .unwrap();

    let read = cluster
        .node("b")
        .coordinator()
        .get_versioned(b"k", ConsistencyLevel::All)
        .await
        .unwrap();
    assert_eq!(read, Some(newer.clone()));

    let (view, expected) = (&cluster, &newer);
    wait_until(move || async move {
        let mut converged = true;
        for id in ["a", "b", "c"] {
            converged &= view.stored(id, b"k").await.as_ref() == Some(expected);
        }
        converged
    })
    .await;

    cluster.stop().await;
}

#[tokio::test]
async fn later_write_through_another_node_wins() {
    let cluster = TestCluster::start(&["a", "b", "c"], 3, 1, 60_000).await;

    let first = cluster
        .node("a")
        .coordinator()
        .put(Bytes::from_static(b"k"), Bytes::from_static(b"v1"), ConsistencyLevel::All)
        .await
        .unwrap();
    let second = cluster
        .node("c")
        .coordinator()
        .put(Bytes::from_static(b"k"), Bytes::from_static(b"v2"), ConsistencyLevel::All)
        .await
        .unwrap();
    assert!(second.stamp > first.stamp);

    for id in ["a", "b", "c"] {
        let value = cluster
            .node(id)
            .coordinator()
            .get(b"k", ConsistencyLevel::One)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload(&value), b"v2");
    }

    cluster.stop().await;
}

#[tokio::test]
async fn single_node_cluster_serves_reads_and_writes() {
    let cluster = TestCluster::start(&["solo"], 1, 1, 60_000).await;
    let solo = cluster.node("solo").coordinator();

    let receipt = solo
        .put(Bytes::from_static(b"k"), Bytes::from_static(b"v"), ConsistencyLevel::All)
        .await
        .unwrap();
    assert_eq!((receipt.acks, receipt.required, receipt.hinted), (1, 1, 0));

    let value = solo.get(b"k", ConsistencyLevel::Default).await.unwrap().unwrap();
    assert_eq!(payload(&value), b"v");

    cluster.stop().await;
}

#[tokio::test]
async fn zero_retention_keeps_no_hints() {
    let cluster = TestCluster::start(&["a", "b", "c"], 2, 2, 0).await;
    let c_id = NodeId::from("c");
    let c_addr = cluster.addr("c");

    cluster.net.isolate(&c_addr);
    cluster
        .node("a")
        .coordinator()
        .put(Bytes::from_static(b"k"), Bytes::from_static(b"v1"), ConsistencyLevel::Default)
        .await
        .unwrap();

    let handoff = cluster.node("a").context().handoff();
    let target = &c_id;
    wait_until(move || async move {
        handoff
            .stats()
            .iter()
            .any(|s| s.target == *target && s.expired == 1)
    })
    .await;
    assert_eq!(handoff.pending(&c_id), 0);

    // Without a hint the replica only catches up through read repair.
    cluster.net.reconnect(&c_addr);
    cluster
        .node("a")
        .coordinator()
        .get(b"k", ConsistencyLevel::All)
        .await
        .unwrap();
    let view = &cluster;
    wait_until(move || async move { view.stored("c", b"k").await.is_some() }).await;

    cluster.stop().await;
}
