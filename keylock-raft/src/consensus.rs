//! The consensus log as seen by the cluster node.
//!
//! [`ConsensusLog`] is the seam between the lock API and the replication
//! engine: propose a command and wait for it to be applied locally, observe
//! leadership, shut down. [`RaftConsensus`] implements it with openraft.

use std::time::Duration;

use async_trait::async_trait;
use openraft::error::{ClientWriteError, Fatal, RaftError};
use openraft::Raft;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::commands::{EncodedCommand, LockCommand, LockResponse};
use crate::errors::ProposeError;
use crate::network::WRITE_PATH;
use crate::server::ForwardedWrite;
use crate::typ::{Node, NodeId, TypeConfig};

#[async_trait]
pub trait ConsensusLog: Send + Sync {
    /// Commit `cmd` and return the local state machine's answer.
    ///
    /// On success the command has already been applied by this node's replica.
    async fn propose(
        &self,
        cmd: &LockCommand,
        timeout: Duration,
    ) -> Result<LockResponse, ProposeError>;

    /// `true` while this node leads the group. Updated on every change.
    fn leadership_changes(&self) -> watch::Receiver<bool>;

    fn is_leader(&self) -> bool {
        let leading = self.leadership_changes();
        let is_leader = *leading.borrow();
        is_leader
    }

    fn current_leader(&self) -> Option<NodeId>;

    async fn shutdown(&self) -> Result<(), ProposeError>;
}

/// [`ConsensusLog`] backed by an openraft instance.
pub struct RaftConsensus {
    raft: Raft<TypeConfig>,
    http: reqwest::Client,
    forward_to_leader: bool,
    leading: watch::Receiver<bool>,
}

impl RaftConsensus {
    /// Wrap `raft`. With `forward_to_leader`, proposals made on a follower
    /// are sent to the current leader instead of failing with `NotLeader`.
    pub fn new(raft: Raft<TypeConfig>, node_id: NodeId, forward_to_leader: bool) -> Self {
        let (tx, leading) = watch::channel(false);
        let mut metrics = raft.metrics();
        tokio::spawn(async move {
            loop {
                let now_leading = metrics.borrow_and_update().current_leader == Some(node_id);
                tx.send_if_modified(|was| std::mem::replace(was, now_leading) != now_leading);
                if metrics.changed().await.is_err() {
                    debug!(node_id, "raft metrics closed, leadership tracking stopped");
                    break;
                }
            }
        });

        Self {
            raft,
            http: reqwest::Client::new(),
            forward_to_leader,
            leading,
        }
    }

    async fn write(
        &self,
        payload: EncodedCommand,
        timeout: Duration,
    ) -> Result<LockResponse, ProposeError> {
        match self.raft.client_write(payload.clone()).await {
            Ok(resp) => Ok(resp.data),
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(fwd))) => {
                match (self.forward_to_leader, fwd.leader_node) {
                    (true, Some(leader)) => self.forward(&leader, &payload, timeout).await,
                    _ => Err(ProposeError::NotLeader {
                        leader: fwd.leader_id,
                    }),
                }
            }
            Err(RaftError::Fatal(Fatal::Stopped)) => Err(ProposeError::ShutDown),
            Err(e) => Err(ProposeError::Consensus(e.to_string())),
        }
    }

    /// Propose through the leader's transport, then wait for the entry to
    /// reach the local replica.
    async fn forward(
        &self,
        leader: &Node,
        payload: &EncodedCommand,
        timeout: Duration,
    ) -> Result<LockResponse, ProposeError> {
        let url = format!("http://{}{}", leader.addr, WRITE_PATH);
        debug!(%url, "forwarding lock command to leader");

        let reply: Result<ForwardedWrite, String> = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| ProposeError::Forward(e.to_string()))?
            .json()
            .await
            .map_err(|e| ProposeError::Forward(e.to_string()))?;
        let written = reply.map_err(ProposeError::Consensus)?;

        self.raft
            .wait(Some(timeout))
            .applied_index_at_least(Some(written.log_index), "forwarded lock command")
            .await
            .map_err(|e| ProposeError::Consensus(e.to_string()))?;
        Ok(written.response)
    }
}

#[async_trait]
impl ConsensusLog for RaftConsensus {
    async fn propose(
        &self,
        cmd: &LockCommand,
        timeout: Duration,
    ) -> Result<LockResponse, ProposeError> {
        let payload = cmd
            .encode()
            .map_err(|e| ProposeError::Encode(e.to_string()))?;
        tokio::time::timeout(timeout, self.write(payload, timeout))
            .await
            .map_err(|_| ProposeError::Timeout(timeout))?
    }

    fn leadership_changes(&self) -> watch::Receiver<bool> {
        self.leading.clone()
    }

    fn current_leader(&self) -> Option<NodeId> {
        let metrics = self.raft.metrics();
        let leader = metrics.borrow().current_leader;
        leader
    }

    async fn shutdown(&self) -> Result<(), ProposeError> {
        self.raft
            .shutdown()
            .await
            .map_err(|e| ProposeError::Consensus(e.to_string()))?;
        info!("raft shut down");
        Ok(())
    }
}
