use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use keylock_raft::typ::NodeId;
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::http::handle_object;
use crate::lock_service::LockService;
use crate::object_store::ObjectStore;

pub const HEALTH_PATH: &str = "/_health";

pub struct AppState {
    pub locks: Arc<dyn LockService>,
    pub store: Arc<dyn ObjectStore>,
    /// When false, followers refuse requests instead of proposing through
    /// the leader.
    pub forward_to_leader: bool,
}

#[derive(Serialize)]
struct HealthDto {
    status: &'static str,
    is_leader: bool,
    leader: Option<NodeId>,
}

/// Object requests are matched by the fallback so that every other path
/// shape gets the same 400 as a malformed key.
pub fn build_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .fallback(handle_object)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthDto> {
    Json(HealthDto {
        status: "ok",
        is_leader: state.locks.is_leader(),
        leader: state.locks.current_leader(),
    })
}
