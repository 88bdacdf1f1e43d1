//! Proposals made on a follower are forwarded to the leader and applied on
//! every replica.

mod common;

use std::sync::Arc;
use std::time::Duration;

use keylock_raft::NodeError;

#[tokio::test]
async fn follower_lock_is_replicated_and_contended_on_the_leader() {
    let (nodes, _tmp) = common::start_three_node_cluster().await;
    let nodes: Vec<_> = nodes.into_iter().map(Arc::new).collect();
    let leader = nodes[0].clone();
    let follower = nodes[1].clone();
    assert!(leader.is_leader());
    assert!(!follower.is_leader());

    follower.lock("abc123", "follower-req").await.unwrap();
    assert_eq!(follower.lock_table().await.holder("abc123"), Some("follower-req"));
    for node in &nodes {
        common::wait_for_holder(node, "abc123", Some("follower-req")).await;
    }

    let waiter = {
        let leader = leader.clone();
        tokio::spawn(async move { leader.lock("abc123", "leader-req").await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!waiter.is_finished(), "leader must not be granted a key held through a follower");

    follower.unlock("abc123", "follower-req").await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("leader lock should be granted after the follower releases")
        .unwrap()
        .unwrap();
    for node in &nodes {
        common::wait_for_holder(node, "abc123", Some("leader-req")).await;
    }

    for node in &nodes {
        node.stop().await.unwrap();
    }
}

#[tokio::test]
async fn follower_unlock_by_another_owner_is_refused() {
    let (nodes, _tmp) = common::start_three_node_cluster().await;

    nodes[0].lock("deadbeef", "owner-a").await.unwrap();
    let err = nodes[2].unlock("deadbeef", "owner-b").await.unwrap_err();
    assert!(
        matches!(&err, NodeError::NotOwner { owner, .. } if owner == "owner-a"),
        "{err:?}"
    );
    for node in &nodes {
        common::wait_for_holder(node, "deadbeef", Some("owner-a")).await;
    }

    for node in &nodes {
        node.stop().await.unwrap();
    }
}
