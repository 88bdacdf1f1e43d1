//! Lock table survives a restart once the log has been compacted into
//! snapshots.

mod common;

use std::time::Duration;

#[tokio::test]
async fn restart_restores_lock_table_from_snapshot_and_log() {
    let tmp = tempfile::TempDir::new().unwrap();
    let addr = common::next_addr();
    let mut cfg = common::node_config(tmp.path(), addr);
    cfg.snapshot_logs = 5;

    let node = common::start_node(cfg.clone()).await;
    for i in 0..12u32 {
        let key = format!("{:04x}", i);
        node.lock(&key, "writer").await.unwrap();
        if i % 3 == 0 {
            node.unlock(&key, "writer").await.unwrap();
        }
    }

    let mut snapshotted = false;
    for _ in 0..100 {
        if node.metrics().and_then(|m| m.snapshot).is_some() {
            snapshotted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(snapshotted, "a snapshot should have been built");

    let before = node.lock_table().await;
    assert_eq!(before.iter().filter(|(_, r)| r.held).count(), 8);

    node.stop().await.unwrap();
    drop(node);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let snapshots = std::fs::read_dir(tmp.path().join("snapshots"))
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
        .count();
    assert!(snapshots >= 1);

    let node = common::start_node(cfg).await;
    let mut restored = node.lock_table().await;
    for _ in 0..100 {
        if restored == before {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        restored = node.lock_table().await;
    }
    assert_eq!(restored, before);
    assert_eq!(restored.holder("0001"), Some("writer"));
    assert!(!restored.is_held("0000"));

    node.stop().await.unwrap();
}
