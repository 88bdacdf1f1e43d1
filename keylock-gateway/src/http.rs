//! Lock-guarded object requests.
//!
//! `GET /{hexid}` reads and `POST /{hexid}` conditionally writes. Both run
//! under the cluster-wide lock for `hexid`, which is released before the
//! response is sent whether or not the store call succeeded.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{
    CONNECTION, CONTENT_LENGTH, PROXY_AUTHENTICATE, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use axum::http::{HeaderName, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::errors::GatewayError;
use crate::lock_service::LockGuard;
use crate::object_store::{Head, UpstreamResponse};

/// Body of a conditional write.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    /// Base64 encoded object content.
    #[serde(default)]
    pub body: String,
    /// Expected content hash of the existing object.
    #[serde(default)]
    pub prev_value: String,
    /// Accept the write when the object does not exist yet.
    #[serde(default)]
    pub not_exist: bool,
}

/// A decoded write: the precondition and the bytes to store.
#[derive(Debug)]
struct Update {
    prev_value: String,
    not_exist: bool,
    data: Bytes,
}

enum Operation {
    Read,
    Write(Update),
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    [
        CONNECTION,
        CONTENT_LENGTH,
        PROXY_AUTHENTICATE,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
        UPGRADE,
    ]
    .contains(name)
}

pub async fn handle_object(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    match serve_object(&state, &method, uri.path(), body).await {
        Ok(upstream) => relay(upstream),
        Err(e) => {
            if e.status().is_server_error() {
                warn!(%method, path = uri.path(), error = %e, "object request failed");
            } else {
                info!(%method, path = uri.path(), error = %e, "object request rejected");
            }
            e.into_response()
        }
    }
}

/// Object key for `path`: one or more whole hex-encoded bytes, lowercased.
pub fn parse_key(path: &str) -> Result<String, GatewayError> {
    let invalid = || GatewayError::InvalidPath(path.to_string());
    let hex = path.strip_prefix('/').ok_or_else(invalid)?;
    if hex.is_empty() || hex.len() % 2 != 0 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    Ok(hex.to_ascii_lowercase())
}

fn decode_update(body: &[u8]) -> Result<Update, GatewayError> {
    let req: UpdateRequest = serde_json::from_slice(body)
        .map_err(|e| GatewayError::BadRequest(format!("invalid update body: {e}")))?;
    let data = STANDARD
        .decode(req.body.as_bytes())
        .map_err(|e| GatewayError::BadRequest(format!("invalid base64 body: {e}")))?;
    Ok(Update {
        prev_value: req.prev_value,
        not_exist: req.not_exist,
        data: Bytes::from(data),
    })
}

async fn serve_object(
    state: &AppState,
    method: &Method,
    path: &str,
    body: Bytes,
) -> Result<UpstreamResponse, GatewayError> {
    let key = parse_key(path)?;
    let op = match *method {
        Method::GET => Operation::Read,
        Method::POST => Operation::Write(decode_update(&body)?),
        _ => return Err(GatewayError::InvalidMethod(method.clone())),
    };

    if !state.forward_to_leader && !state.locks.is_leader() {
        return Err(GatewayError::NotLeader);
    }

    let owner = Uuid::new_v4().to_string();
    let guard = LockGuard::acquire(state.locks.clone(), &key, &owner)
        .await
        .map_err(GatewayError::Lock)?;

    let result = match op {
        Operation::Read => state.store.get(&key).await.map_err(GatewayError::from),
        Operation::Write(update) => write_object(state, &key, update).await,
    };

    if let Err(e) = guard.release().await {
        warn!(%key, %owner, error = %e, "failed to release lock");
    }
    result
}

async fn write_object(
    state: &AppState,
    key: &str,
    update: Update,
) -> Result<UpstreamResponse, GatewayError> {
    match state.store.head(key).await? {
        Head::NotFound if !update.not_exist => return Err(GatewayError::MissingObject),
        Head::Found { hash } if hash != update.prev_value => return Err(GatewayError::StaleValue),
        _ => {}
    }

    let written = state.store.put(key, update.data).await?;
    if written.status != StatusCode::OK {
        return Err(GatewayError::UpstreamRejected(written.status));
    }
    Ok(written)
}

fn relay(upstream: UpstreamResponse) -> Response {
    let mut resp = Response::new(Body::from(upstream.body));
    *resp.status_mut() = upstream.status;
    let headers = resp.headers_mut();
    for (name, value) in upstream.headers.iter() {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    resp
}
