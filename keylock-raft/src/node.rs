//! Cluster node lifecycle and the synchronous lock API.
//!
//! [`ClusterNode::start`] wires the lock state machine, the redb log store,
//! the snapshot store and the HTTP transport into one openraft instance.
//! [`ClusterNode::lock`] and [`ClusterNode::unlock`] return only once the
//! command has been committed and applied by the local replica.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use openraft::error::{InitializeError, RaftError};
use openraft::{BasicNode, Config, Raft, RaftMetrics, SnapshotPolicy};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::{unix_millis, LockCommand, LockResponse};
use crate::consensus::{ConsensusLog, RaftConsensus};
use crate::errors::{NodeError, ProposeError};
use crate::expiry_worker::run_expiry_worker;
use crate::log_store::RedbLogStore;
use crate::network::HttpNetworkFactory;
use crate::server;
use crate::snapshot_store::{FileSnapshotStore, DEFAULT_RETAIN};
use crate::state_machine::{LockStateMachine, LockTable};
use crate::typ::{Node, NodeId, TypeConfig};

pub const DEFAULT_DATA_DIR: &str = "/tmp/keylock";
pub const DEFAULT_PROPOSE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(30);
const TMP_DIR: &str = "tmp";
const SNAPSHOT_DIR: &str = "snapshots";
const LOG_FILE: &str = "raft-log.redb";

/// Configuration for starting a cluster node.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Initialize the cluster with this node plus `seed_peers`.
    pub bootstrap: bool,
    /// Address the Raft transport listens on.
    pub bind_addr: SocketAddr,
    /// Address peers use to reach this node, when it differs from `bind_addr`.
    pub advertised_addr: Option<String>,
    /// Raft addresses of the other initial members.
    pub seed_peers: Vec<String>,
    /// Root directory for the log store and snapshots.
    pub data_dir: PathBuf,
    /// Upper bound on a whole `lock` or `unlock` call.
    pub propose_timeout: Duration,
    /// How long a contended `lock` waits for a release before proposing again.
    pub retry_interval: Duration,
    /// Lease granted with every lock. An unreleased lock older than this may
    /// be taken over by another owner. `None` locks until unlocked.
    pub lock_lease: Option<Duration>,
    /// How often the leader looks for expired leases.
    pub expiry_interval: Duration,
    /// Send proposals made on a follower to the leader.
    pub forward_to_leader: bool,
    /// Build a snapshot after this many applied entries.
    pub snapshot_logs: u64,
    pub snapshots_retained: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bootstrap: false,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 4000)),
            advertised_addr: None,
            seed_peers: Vec::new(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            propose_timeout: DEFAULT_PROPOSE_TIMEOUT,
            retry_interval: Duration::from_millis(50),
            lock_lease: Some(DEFAULT_LOCK_LEASE),
            expiry_interval: Duration::from_secs(1),
            forward_to_leader: true,
            snapshot_logs: 1000,
            snapshots_retained: DEFAULT_RETAIN,
        }
    }
}

impl NodeConfig {
    /// Address this node is known by inside the cluster.
    pub fn raft_addr(&self) -> String {
        self.advertised_addr
            .clone()
            .unwrap_or_else(|| self.bind_addr.to_string())
    }
}

/// Node id derived from a Raft address.
///
/// Every member computes the same id for the same address, so a seed list of
/// plain addresses is enough to agree on the initial membership.
pub fn node_id_for(addr: &str) -> NodeId {
    let digest = Sha256::digest(addr.as_bytes());
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(id)
}

/// A running cluster member.
pub struct ClusterNode {
    node_id: NodeId,
    raft_addr: String,
    consensus: Arc<dyn ConsensusLog>,
    state_machine: LockStateMachine,
    raft: Option<Raft<TypeConfig>>,
    propose_timeout: Duration,
    retry_interval: Duration,
    lock_lease: Option<Duration>,
    stopped: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterNode {
    /// Create storage, bind the transport and start Raft.
    ///
    /// Any failure here leaves nothing running: the node is either fully
    /// started or not at all.
    pub async fn start(cfg: NodeConfig) -> anyhow::Result<Self> {
        fs::create_dir_all(&cfg.data_dir)
            .with_context(|| format!("create data dir {}", cfg.data_dir.display()))?;
        let tmp_dir = cfg.data_dir.join(TMP_DIR);
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)
                .with_context(|| format!("clear {}", tmp_dir.display()))?;
        }
        fs::create_dir_all(&tmp_dir).with_context(|| format!("create {}", tmp_dir.display()))?;

        let raft_addr = cfg.raft_addr();
        let node_id = node_id_for(&raft_addr);

        let raft_config = Config {
            cluster_name: "keylock".to_string(),
            snapshot_policy: SnapshotPolicy::LogsSinceLast(cfg.snapshot_logs),
            max_in_snapshot_log_to_keep: 100,
            ..Config::default()
        };
        let raft_config = Arc::new(raft_config.validate()?);

        let snapshots = Arc::new(
            FileSnapshotStore::open(cfg.data_dir.join(SNAPSHOT_DIR), cfg.snapshots_retained)
                .context("open snapshot store")?,
        );
        let state_machine = LockStateMachine::new().with_snapshot_store(snapshots.clone());
        if let Some(snap) = snapshots.latest().context("load latest snapshot")? {
            state_machine.restore_snapshot(snap).await;
        }

        let log_store =
            RedbLogStore::open(cfg.data_dir.join(LOG_FILE)).context("open raft log store")?;

        let listener = TcpListener::bind(cfg.bind_addr)
            .await
            .with_context(|| format!("bind raft transport on {}", cfg.bind_addr))?;

        let raft = Raft::new(
            node_id,
            raft_config,
            HttpNetworkFactory::default(),
            log_store,
            state_machine.clone(),
        )
        .await?;

        let consensus = Arc::new(RaftConsensus::new(
            raft.clone(),
            node_id,
            cfg.forward_to_leader,
        ));
        let mut node = Self::with_consensus(&cfg, node_id, consensus, state_machine);
        node.raft = Some(raft.clone());
        node.spawn(server::serve(listener, raft, node.stopped.clone()));

        info!(node_id, %raft_addr, "cluster node started");

        if cfg.bootstrap {
            if let Err(e) = node.bootstrap(&cfg.seed_peers).await {
                node.stop().await.ok();
                return Err(e);
            }
        }
        Ok(node)
    }

    /// Build a node around an existing consensus log.
    ///
    /// `state_machine` must be the replica the consensus log applies to.
    pub fn with_consensus(
        cfg: &NodeConfig,
        node_id: NodeId,
        consensus: Arc<dyn ConsensusLog>,
        state_machine: LockStateMachine,
    ) -> Self {
        let node = Self {
            node_id,
            raft_addr: cfg.raft_addr(),
            consensus,
            state_machine,
            raft: None,
            propose_timeout: cfg.propose_timeout,
            retry_interval: cfg.retry_interval,
            lock_lease: cfg.lock_lease,
            stopped: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        };
        node.spawn(log_leadership(
            node_id,
            node.consensus.leadership_changes(),
            node.stopped.clone(),
        ));
        if node.lock_lease.is_some() {
            node.spawn(run_expiry_worker(
                node.consensus.clone(),
                node.state_machine.clone(),
                cfg.expiry_interval,
                cfg.propose_timeout,
                node.stopped.clone(),
            ));
        }
        node
    }

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(task);
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }

    /// Initialize the group with this node plus `seeds`, unless it already is.
    async fn bootstrap(&self, seeds: &[String]) -> anyhow::Result<()> {
        let raft = self.raft()?;
        let mut members = BTreeMap::new();
        for addr in seeds.iter().chain(std::iter::once(&self.raft_addr)) {
            members.insert(node_id_for(addr), BasicNode::new(addr));
        }
        let size = members.len();

        match raft.initialize(members).await {
            Ok(()) => info!(node_id = self.node_id, members = size, "cluster initialized"),
            Err(RaftError::APIError(InitializeError::NotAllowed(e))) => {
                info!(node_id = self.node_id, reason = %e, "cluster already initialized")
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn raft(&self) -> anyhow::Result<&Raft<TypeConfig>> {
        self.raft
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("node has no local raft instance"))
    }

    /// Acquire `key` for `owner`.
    ///
    /// While another owner holds the key the lock is re-proposed after each
    /// release (or every retry interval) until granted or the propose timeout
    /// runs out. Each attempt carries a fresh clock, so a holder whose lease
    /// ended is taken over.
    pub async fn lock(&self, key: &str, owner: &str) -> Result<(), NodeError> {
        let started = Instant::now();
        let deadline = started + self.propose_timeout;
        let mut holder = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(NodeError::LockTimeout {
                    key: key.to_string(),
                    owner: holder.unwrap_or_default(),
                    waited: started.elapsed(),
                });
            }

            // Registered before proposing so a release applied in between is not missed.
            let releases = self.state_machine.releases();
            let released = releases.notified();
            tokio::pin!(released);

            let cmd = LockCommand::lock(key, owner).at(unix_millis(), self.lock_lease);
            let proposed = tokio::select! {
                _ = self.stopped.cancelled() => return Err(NodeError::Stopped),
                resp = self.consensus.propose(&cmd, remaining) => resp,
            };

            let resp = match (proposed, holder.take()) {
                (Ok(resp), _) => resp,
                (Err(e), holder) => {
                    if matches!(e, ProposeError::Timeout(_) | ProposeError::Forward(_)) {
                        // The proposal may still commit after we give up on it.
                        self.release_abandoned(key, owner);
                    }
                    return Err(match (e, holder) {
                        (ProposeError::Timeout(_), Some(current)) => NodeError::LockTimeout {
                            key: key.to_string(),
                            owner: current,
                            waited: started.elapsed(),
                        },
                        (e, _) => e.into(),
                    });
                }
            };

            match resp {
                LockResponse::Granted => {
                    debug!(key, owner, waited = ?started.elapsed(), "lock granted");
                    return Ok(());
                }
                LockResponse::Held { owner: current } => {
                    debug!(key, owner, holder = %current, "lock contended, waiting for release");
                    holder = Some(current);
                    let wait = deadline
                        .saturating_duration_since(Instant::now())
                        .min(self.retry_interval);
                    tokio::select! {
                        _ = self.stopped.cancelled() => return Err(NodeError::Stopped),
                        _ = &mut released => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                other => return Err(NodeError::Unexpected(format!("{other:?}"))),
            }
        }
    }

    /// Propose an unlock for a lock attempt whose outcome is unknown.
    fn release_abandoned(&self, key: &str, owner: &str) {
        let consensus = self.consensus.clone();
        let cmd = LockCommand::unlock(key, owner);
        let timeout = self.propose_timeout;
        tokio::spawn(async move {
            match consensus.propose(&cmd, timeout).await {
                Ok(resp) => {
                    debug!(key = %cmd.key, owner = %cmd.owner, ?resp, "abandoned lock released")
                }
                Err(e) => warn!(
                    key = %cmd.key,
                    owner = %cmd.owner,
                    error = %e,
                    "failed to release abandoned lock, left to lease expiry"
                ),
            }
        });
    }

    /// Release `key` held by `owner`.
    pub async fn unlock(&self, key: &str, owner: &str) -> Result<(), NodeError> {
        let cmd = LockCommand::unlock(key, owner);
        let resp = tokio::select! {
            _ = self.stopped.cancelled() => return Err(NodeError::Stopped),
            resp = self.consensus.propose(&cmd, self.propose_timeout) => resp?,
        };

        match resp {
            LockResponse::Released => {
                debug!(key, owner, "lock released");
                Ok(())
            }
            LockResponse::NotOwner { owner: current } => Err(NodeError::NotOwner {
                key: key.to_string(),
                owner: current,
            }),
            other => Err(NodeError::Unexpected(format!("{other:?}"))),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.consensus.is_leader()
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.consensus.current_leader()
    }

    /// `true` while this node leads; changes on every leadership transition.
    pub fn leadership_changes(&self) -> tokio::sync::watch::Receiver<bool> {
        self.consensus.leadership_changes()
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn raft_addr(&self) -> &str {
        &self.raft_addr
    }

    /// Copy of the local replica's lock table.
    pub async fn lock_table(&self) -> LockTable {
        self.state_machine.lock_table().await
    }

    pub fn metrics(&self) -> Option<RaftMetrics<NodeId, Node>> {
        self.raft.as_ref().map(|raft| raft.metrics().borrow().clone())
    }

    /// Shut down consensus and background tasks.
    ///
    /// In-flight `lock`/`unlock` calls return [`NodeError::Stopped`]. Calling
    /// it again is a no-op.
    pub async fn stop(&self) -> Result<(), NodeError> {
        if self.stopped.is_cancelled() {
            return Ok(());
        }
        self.stopped.cancel();

        let result = self.consensus.shutdown().await;
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        info!(node_id = self.node_id, "cluster node stopped");
        result.map_err(NodeError::from)
    }
}

async fn log_leadership(
    node_id: NodeId,
    mut leading: tokio::sync::watch::Receiver<bool>,
    stopped: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stopped.cancelled() => break,
            changed = leading.changed() => {
                if changed.is_err() {
                    warn!(node_id, "leadership updates closed");
                    break;
                }
                if *leading.borrow_and_update() {
                    info!(node_id, "running as leader");
                } else {
                    info!(node_id, "no longer running as leader");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use async_trait::async_trait;
    use openraft::storage::RaftStateMachine;
    use openraft::{CommittedLeaderId, Entry, EntryPayload, LogId};
    use tokio::sync::watch;

    use super::*;
    use crate::commands::CommandKind;

    /// Single-replica log: every proposal is applied immediately, in order.
    struct InProcessLog {
        sm: LockStateMachine,
        next_index: AtomicU64,
        /// Apply lock commands but report them as timed out.
        lose_lock_replies: AtomicBool,
        leading: watch::Sender<bool>,
        shut_down: CancellationToken,
    }

    impl InProcessLog {
        fn new(sm: LockStateMachine) -> Self {
            Self {
                sm,
                next_index: AtomicU64::new(1),
                lose_lock_replies: AtomicBool::new(false),
                leading: watch::channel(true).0,
                shut_down: CancellationToken::new(),
            }
        }
    }

    #[async_trait]
    impl ConsensusLog for InProcessLog {
        async fn propose(
            &self,
            cmd: &LockCommand,
            timeout: Duration,
        ) -> Result<LockResponse, ProposeError> {
            if self.shut_down.is_cancelled() {
                return Err(ProposeError::ShutDown);
            }
            let index = self.next_index.fetch_add(1, Ordering::SeqCst);
            let entry = Entry {
                log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
                payload: EntryPayload::Normal(
                    cmd.encode().map_err(|e| ProposeError::Encode(e.to_string()))?,
                ),
            };
            let mut sm = self.sm.clone();
            let mut responses = sm
                .apply(vec![entry])
                .await
                .map_err(|e| ProposeError::Consensus(e.to_string()))?;
            if cmd.kind == CommandKind::Lock && self.lose_lock_replies.load(Ordering::SeqCst) {
                return Err(ProposeError::Timeout(timeout));
            }
            Ok(responses.remove(0))
        }

        fn leadership_changes(&self) -> watch::Receiver<bool> {
            self.leading.subscribe()
        }

        fn current_leader(&self) -> Option<NodeId> {
            Some(1)
        }

        async fn shutdown(&self) -> Result<(), ProposeError> {
            self.shut_down.cancel();
            Ok(())
        }
    }

    fn node(timeout: Duration) -> Arc<ClusterNode> {
        node_with_log(timeout, None).0
    }

    fn node_with_log(
        timeout: Duration,
        lock_lease: Option<Duration>,
    ) -> (Arc<ClusterNode>, Arc<InProcessLog>) {
        let cfg = NodeConfig {
            propose_timeout: timeout,
            retry_interval: Duration::from_millis(20),
            lock_lease,
            expiry_interval: Duration::from_millis(20),
            ..NodeConfig::default()
        };
        let sm = LockStateMachine::new();
        let log = Arc::new(InProcessLog::new(sm.clone()));
        let node = ClusterNode::with_consensus(&cfg, 1, log.clone(), sm);
        (Arc::new(node), log)
    }

    async fn wait_until_free(node: &ClusterNode, key: &str) {
        for _ in 0..100 {
            if node.lock_table().await.holder(key).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{key} is still held");
    }

    #[test]
    fn node_ids_are_stable_per_address() {
        assert_eq!(node_id_for("10.0.0.1:4000"), node_id_for("10.0.0.1:4000"));
        assert_ne!(node_id_for("10.0.0.1:4000"), node_id_for("10.0.0.2:4000"));
    }

    #[tokio::test]
    async fn lock_and_unlock_update_the_local_table() {
        let node = node(Duration::from_secs(1));

        node.lock("abc123", "req-1").await.unwrap();
        assert_eq!(node.lock_table().await.holder("abc123"), Some("req-1"));

        node.unlock("abc123", "req-1").await.unwrap();
        assert!(!node.lock_table().await.is_held("abc123"));
    }

    #[tokio::test]
    async fn contended_lock_waits_for_release() {
        let node = node(Duration::from_secs(5));
        node.lock("abc123", "first").await.unwrap();

        let waiter = {
            let node = node.clone();
            tokio::spawn(async move { node.lock("abc123", "second").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished(), "second owner must wait");
        assert_eq!(node.lock_table().await.holder("abc123"), Some("first"));

        node.unlock("abc123", "first").await.unwrap();
        waiter.await.unwrap().unwrap();
        assert_eq!(node.lock_table().await.holder("abc123"), Some("second"));
    }

    #[tokio::test]
    async fn contended_lock_times_out_with_holder() {
        let node = node(Duration::from_millis(150));
        node.lock("abc123", "first").await.unwrap();

        match node.lock("abc123", "second").await {
            Err(NodeError::LockTimeout { key, owner, .. }) => {
                assert_eq!(key, "abc123");
                assert_eq!(owner, "first");
            }
            other => panic!("expected lock timeout, got {other:?}"),
        }
        assert_eq!(node.lock_table().await.holder("abc123"), Some("first"));
    }

    #[tokio::test]
    async fn unlock_by_another_owner_is_refused() {
        let node = node(Duration::from_secs(1));
        node.lock("abc123", "first").await.unwrap();

        let err = node.unlock("abc123", "intruder").await.unwrap_err();
        assert!(matches!(err, NodeError::NotOwner { owner, .. } if owner == "first"));
        assert!(node.lock_table().await.is_held("abc123"));
    }

    #[tokio::test]
    async fn stop_unblocks_waiting_lockers() {
        let node = node(Duration::from_secs(30));
        node.lock("abc123", "first").await.unwrap();

        let waiter = {
            let node = node.clone();
            tokio::spawn(async move { node.lock("abc123", "second").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        node.stop().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must not hang")
            .unwrap();
        assert!(matches!(result, Err(NodeError::Stopped)));

        // Second stop is a no-op, later calls fail fast.
        node.stop().await.unwrap();
        assert!(node.lock("ffff", "late").await.is_err());
    }

    #[tokio::test]
    async fn timed_out_lock_is_released_behind_the_caller() {
        let (node, log) = node_with_log(Duration::from_millis(200), None);
        log.lose_lock_replies.store(true, Ordering::SeqCst);

        let err = node.lock("abc123", "req-1").await.unwrap_err();
        assert!(matches!(err, NodeError::Propose(ProposeError::Timeout(_))), "{err:?}");

        wait_until_free(&node, "abc123").await;
        log.lose_lock_replies.store(false, Ordering::SeqCst);
        node.lock("abc123", "req-2").await.unwrap();
        assert_eq!(node.lock_table().await.holder("abc123"), Some("req-2"));
    }

    #[tokio::test]
    async fn leader_expires_locks_past_their_lease() {
        let (node, _log) = node_with_log(Duration::from_secs(1), Some(Duration::from_millis(50)));

        node.lock("abc123", "crashed-request").await.unwrap();
        assert_eq!(node.lock_table().await.holder("abc123"), Some("crashed-request"));

        wait_until_free(&node, "abc123").await;
        let err = node.unlock("abc123", "crashed-request").await;
        assert!(err.is_ok(), "unlocking a free key is idempotent: {err:?}");
    }

    #[tokio::test]
    async fn waiting_locker_takes_over_an_expired_lease() {
        let (node, _log) = node_with_log(Duration::from_secs(2), Some(Duration::from_millis(100)));

        node.lock("abc123", "crashed-request").await.unwrap();
        node.lock("abc123", "fresh").await.unwrap();
        assert_eq!(node.lock_table().await.holder("abc123"), Some("fresh"));
    }
}
