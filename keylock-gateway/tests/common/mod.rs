//! Test doubles for driving the gateway router without a cluster.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use keylock_gateway::{
    build_router, AppState, Head, LockService, ObjectStore, ObjectStoreError, UpstreamResponse,
};
use keylock_raft::typ::NodeId;
use keylock_raft::NodeError;
use tower::ServiceExt;

/// Lock service that records every call.
#[derive(Default)]
pub struct RecordingLocks {
    pub locks: AtomicUsize,
    pub unlocks: AtomicUsize,
    pub fail_lock: bool,
    pub follower: bool,
    pub calls: Mutex<Vec<String>>,
}

impl RecordingLocks {
    pub fn locks(&self) -> usize {
        self.locks.load(Ordering::SeqCst)
    }

    pub fn unlocks(&self) -> usize {
        self.unlocks.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LockService for RecordingLocks {
    async fn lock(&self, key: &str, _owner: &str) -> Result<(), NodeError> {
        self.calls.lock().unwrap().push(format!("lock {key}"));
        if self.fail_lock {
            return Err(NodeError::Stopped);
        }
        self.locks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unlock(&self, key: &str, _owner: &str) -> Result<(), NodeError> {
        self.calls.lock().unwrap().push(format!("unlock {key}"));
        self.unlocks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_leader(&self) -> bool {
        !self.follower
    }

    fn current_leader(&self) -> Option<NodeId> {
        if self.follower {
            Some(7)
        } else {
            Some(1)
        }
    }
}

/// Object store answering `head` and `put` from fixed values.
pub struct ScriptedStore {
    pub head: Head,
    pub put_status: StatusCode,
    pub fail_get: bool,
    pub puts: AtomicUsize,
    pub gets: AtomicUsize,
}

impl ScriptedStore {
    pub fn new(head: Head) -> Self {
        Self {
            head,
            put_status: StatusCode::OK,
            fail_get: false,
            puts: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
        }
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for ScriptedStore {
    async fn head(&self, _key: &str) -> Result<Head, ObjectStoreError> {
        Ok(self.head.clone())
    }

    async fn get(&self, _key: &str) -> Result<UpstreamResponse, ObjectStoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_get {
            return Err(ObjectStoreError::UnexpectedStatus {
                op: "GET",
                status: StatusCode::BAD_GATEWAY,
            });
        }
        let mut headers = HeaderMap::new();
        headers.insert("x-sha1", "h1".parse().unwrap());
        headers.insert("connection", "close".parse().unwrap());
        Ok(UpstreamResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::from_static(b"stored"),
        })
    }

    async fn put(&self, _key: &str, data: Bytes) -> Result<UpstreamResponse, ObjectStoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(UpstreamResponse {
            status: self.put_status,
            headers: HeaderMap::new(),
            body: data,
        })
    }
}

pub fn router(locks: Arc<RecordingLocks>, store: Arc<dyn ObjectStore>) -> Router {
    build_router(Arc::new(AppState {
        locks,
        store,
        forward_to_leader: true,
    }))
}

pub async fn send(router: Router, method: &str, uri: &str, body: &str) -> Response {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body.to_string()))
        .unwrap();
    router.oneshot(req).await.unwrap()
}

pub async fn body_bytes(resp: Response) -> Bytes {
    axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap()
}
