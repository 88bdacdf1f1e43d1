//! HTTP Raft network transport (client side).
//!
//! Implements `RaftNetworkFactory` and `RaftNetwork` on top of `reqwest`.
//! Each openraft request is posted as JSON to the peer's transport server
//! (see [`crate::server`]), which answers with a JSON `Result`.

use std::future::Future;

use openraft::error::{
    Fatal, InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError,
    ReplicationClosed, StreamingError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    SnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::storage::Snapshot;
use openraft::{OptionalSend, Vote};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::typ::{Node, NodeId, TypeConfig};

pub const APPEND_PATH: &str = "/raft/append";
pub const VOTE_PATH: &str = "/raft/vote";
pub const SNAPSHOT_PATH: &str = "/raft/snapshot";
pub const WRITE_PATH: &str = "/raft/write";
pub const METRICS_PATH: &str = "/raft/metrics";

/// Creates one [`HttpNetwork`] per target node. All of them share a
/// connection pool.
#[derive(Clone, Default)]
pub struct HttpNetworkFactory {
    client: reqwest::Client,
}

impl RaftNetworkFactory<TypeConfig> for HttpNetworkFactory {
    type Network = HttpNetwork;

    async fn new_client(&mut self, target: NodeId, node: &Node) -> Self::Network {
        HttpNetwork {
            target,
            addr: node.addr.clone(),
            client: self.client.clone(),
            connected: true,
        }
    }
}

/// Connection to a single Raft peer.
pub struct HttpNetwork {
    target: NodeId,
    addr: String,
    client: reqwest::Client,
    /// Whether the last RPC reached the peer, so reachability changes are
    /// logged once instead of on every failed heartbeat.
    connected: bool,
}

impl HttpNetwork {
    async fn send<Req, Resp, E>(
        &mut self,
        path: &str,
        req: &Req,
        option: &RPCOption,
    ) -> Result<Resp, RPCError<NodeId, Node, E>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
    {
        let url = format!("http://{}{}", self.addr, path);
        let resp = match self
            .client
            .post(&url)
            .timeout(option.hard_ttl())
            .json(req)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                self.mark_failure();
                return Err(if e.is_connect() || e.is_timeout() {
                    RPCError::Unreachable(Unreachable::new(&e))
                } else {
                    RPCError::Network(NetworkError::new(&e))
                });
            }
        };
        self.mark_success();

        let reply: Result<Resp, E> = resp
            .json()
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        reply.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }

    fn mark_success(&mut self) {
        if !self.connected {
            info!(target_node = self.target, addr = %self.addr, "peer is reachable");
            self.connected = true;
        }
    }

    fn mark_failure(&mut self) {
        if self.connected {
            warn!(target_node = self.target, addr = %self.addr, "peer became unreachable");
            self.connected = false;
        }
    }
}

impl RaftNetwork<TypeConfig> for HttpNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, Node, RaftError<NodeId>>> {
        self.send(APPEND_PATH, &rpc, &option).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, Node, RaftError<NodeId>>> {
        self.send(VOTE_PATH, &rpc, &option).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, Node, RaftError<NodeId, InstallSnapshotError>>,
    > {
        self.send(SNAPSHOT_PATH, &rpc, &option).await
    }

    /// Lock tables are small, so the whole snapshot goes out in one request.
    async fn full_snapshot(
        &mut self,
        vote: Vote<NodeId>,
        snapshot: Snapshot<TypeConfig>,
        _cancel: impl Future<Output = ReplicationClosed> + OptionalSend + 'static,
        option: RPCOption,
    ) -> Result<SnapshotResponse<NodeId>, StreamingError<TypeConfig, Fatal<NodeId>>> {
        let req = InstallSnapshotRequest {
            vote,
            meta: snapshot.meta.clone(),
            offset: 0,
            data: snapshot.snapshot.into_inner(),
            done: true,
        };
        let resp = self.install_snapshot(req, option).await.map_err(|e| {
            warn!(target_node = self.target, error = %e, "snapshot transfer failed");
            let io = std::io::Error::new(std::io::ErrorKind::Other, e.to_string());
            StreamingError::Unreachable(Unreachable::new(&io))
        })?;
        Ok(SnapshotResponse { vote: resp.vote })
    }
}
