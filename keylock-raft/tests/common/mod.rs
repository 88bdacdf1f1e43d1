//! Shared helpers for `keylock-raft` integration tests.
//!
//! [`start_cluster`] spins up a bootstrapped single-node cluster in a temp
//! directory on its own port and waits for it to elect itself.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use keylock_raft::{ClusterNode, NodeConfig};
use tempfile::TempDir;

/// Global port counter so parallel tests don't collide.
static PORT: AtomicU16 = AtomicU16::new(18650);

pub fn next_addr() -> SocketAddr {
    let port = PORT.fetch_add(1, Ordering::Relaxed);
    format!("127.0.0.1:{}", port).parse().unwrap()
}

pub fn node_config(data_dir: &Path, addr: SocketAddr) -> NodeConfig {
    NodeConfig {
        bootstrap: true,
        bind_addr: addr,
        data_dir: data_dir.to_path_buf(),
        propose_timeout: Duration::from_secs(5),
        retry_interval: Duration::from_millis(20),
        ..NodeConfig::default()
    }
}

/// Start a node with `cfg` and wait until it leads.
pub async fn start_node(cfg: NodeConfig) -> ClusterNode {
    let node = ClusterNode::start(cfg).await.expect("start cluster node");
    wait_for_leader(&node).await;
    node
}

/// The returned `TempDir` must outlive the node; dropping it removes the
/// on-disk log and snapshots.
pub async fn start_cluster() -> (ClusterNode, TempDir) {
    let tmp = TempDir::new().expect("create temp dir");
    let node = start_node(node_config(tmp.path(), next_addr())).await;
    (node, tmp)
}

pub async fn wait_for_leader(node: &ClusterNode) {
    for _ in 0..100 {
        if node.is_leader() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("node {} did not become leader", node.node_id());
}

/// Start three nodes that bootstrap together and wait until they agree on a
/// leader. Nodes are returned leader first.
pub async fn start_three_node_cluster() -> (Vec<ClusterNode>, TempDir) {
    let tmp = TempDir::new().expect("create temp dir");
    let addrs: Vec<SocketAddr> = (0..3).map(|_| next_addr()).collect();

    let mut starting = Vec::new();
    for (i, addr) in addrs.iter().enumerate() {
        let mut cfg = node_config(&tmp.path().join(format!("node-{i}")), *addr);
        cfg.seed_peers = addrs
            .iter()
            .filter(|a| *a != addr)
            .map(ToString::to_string)
            .collect();
        starting.push(tokio::spawn(ClusterNode::start(cfg)));
    }
    let mut nodes = Vec::new();
    for handle in starting {
        nodes.push(handle.await.unwrap().expect("start cluster node"));
    }

    for _ in 0..200 {
        let leaders: Vec<_> = nodes.iter().map(|n| n.current_leader()).collect();
        if let Some(leader) = leaders[0] {
            if leaders.iter().all(|l| *l == Some(leader)) {
                nodes.sort_by_key(|n| n.node_id() != leader);
                return (nodes, tmp);
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("three node cluster did not agree on a leader");
}

/// Poll `node` until `key` is held by `owner` (or free, for `None`).
pub async fn wait_for_holder(node: &ClusterNode, key: &str, owner: Option<&str>) {
    for _ in 0..100 {
        if node.lock_table().await.holder(key) == owner {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "node {} never saw {key} held by {owner:?}, table has {:?}",
        node.node_id(),
        node.lock_table().await.holder(key)
    );
}
