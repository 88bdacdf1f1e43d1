use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use keylock_raft::NodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object store request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("object store answered {op} with unexpected status {status}")]
    UnexpectedStatus { op: &'static str, status: StatusCode },

    #[error("invalid hash header name: {0:?}")]
    InvalidHashHeader(String),
}

/// Every way a gateway request can fail, mapped to a 400 or 500 response.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid path {0}")]
    InvalidPath(String),

    #[error("invalid method {0}")]
    InvalidMethod(Method),

    #[error("need to forward request to leader")]
    NotLeader,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("object does not exist and notExist was not asserted")]
    MissingObject,

    #[error("prevValue doesn't match current value")]
    StaleValue,

    #[error("lock failed: {0}")]
    Lock(#[source] NodeError),

    #[error(transparent)]
    Store(#[from] ObjectStoreError),

    #[error("upstream gave non 200 response: {0}")]
    UpstreamRejected(StatusCode),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidPath(_)
            | GatewayError::InvalidMethod(_)
            | GatewayError::NotLeader
            | GatewayError::BadRequest(_)
            | GatewayError::MissingObject
            | GatewayError::StaleValue => StatusCode::BAD_REQUEST,
            GatewayError::Lock(_) | GatewayError::Store(_) | GatewayError::UpstreamRejected(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}
