//! HTTP Raft transport (server side).
//!
//! Peers post openraft RPCs here; followers also post forwarded lock
//! commands to the leader's `/raft/write`.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use openraft::error::{InstallSnapshotError, RaftError};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::{Raft, RaftMetrics};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::{EncodedCommand, LockResponse};
use crate::network::{APPEND_PATH, METRICS_PATH, SNAPSHOT_PATH, VOTE_PATH, WRITE_PATH};
use crate::typ::{Node, NodeId, TypeConfig};

/// Reply to a forwarded write: where it landed in the log and what the
/// leader's state machine answered.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ForwardedWrite {
    pub log_index: u64,
    pub response: LockResponse,
}

pub fn router(raft: Raft<TypeConfig>) -> Router {
    Router::new()
        .route(APPEND_PATH, post(append_entries))
        .route(VOTE_PATH, post(vote))
        .route(SNAPSHOT_PATH, post(install_snapshot))
        .route(WRITE_PATH, post(forwarded_write))
        .route(METRICS_PATH, get(metrics))
        .with_state(raft)
}

/// Serve the transport on an already bound listener until `shutdown` fires.
pub async fn serve(listener: TcpListener, raft: Raft<TypeConfig>, shutdown: CancellationToken) {
    let addr = listener.local_addr().ok();
    info!(?addr, "starting Raft HTTP transport");
    if let Err(e) = axum::serve(listener, router(raft))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        warn!(error = %e, "Raft HTTP transport exited with error");
    }
}

async fn append_entries(
    State(raft): State<Raft<TypeConfig>>,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> Json<Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>> {
    Json(raft.append_entries(req).await)
}

async fn vote(
    State(raft): State<Raft<TypeConfig>>,
    Json(req): Json<VoteRequest<NodeId>>,
) -> Json<Result<VoteResponse<NodeId>, RaftError<NodeId>>> {
    Json(raft.vote(req).await)
}

async fn install_snapshot(
    State(raft): State<Raft<TypeConfig>>,
    Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Json<Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>> {
    Json(raft.install_snapshot(req).await)
}

async fn forwarded_write(
    State(raft): State<Raft<TypeConfig>>,
    Json(cmd): Json<EncodedCommand>,
) -> Json<Result<ForwardedWrite, String>> {
    debug!(len = cmd.as_bytes().len(), "received forwarded lock command");
    let reply = raft
        .client_write(cmd)
        .await
        .map(|resp| ForwardedWrite {
            log_index: resp.log_id.index,
            response: resp.data,
        })
        .map_err(|e| e.to_string());
    Json(reply)
}

async fn metrics(State(raft): State<Raft<TypeConfig>>) -> Json<RaftMetrics<NodeId, Node>> {
    Json(raft.metrics().borrow().clone())
}
