//! Upstream object store client.
//!
//! The gateway only needs three calls against the store: `head` to read the
//! current content hash, `get` to read, and `put` to write. Responses from
//! `get` and `put` are kept whole so they can be relayed to the client.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::ObjectStoreError;

/// Header carrying the object's content hash on `HEAD` responses.
pub const DEFAULT_HASH_HEADER: &str = "X-sha1";
const UPLOAD_CONTENT_TYPE: &str = "multipart/upload";

/// Current state of an object, as reported by `HEAD`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Head {
    NotFound,
    /// `hash` is empty when the store did not send a hash header.
    Found { hash: String },
}

/// A store response relayed to the client as is.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head(&self, key: &str) -> Result<Head, ObjectStoreError>;

    async fn get(&self, key: &str) -> Result<UpstreamResponse, ObjectStoreError>;

    async fn put(&self, key: &str, data: Bytes) -> Result<UpstreamResponse, ObjectStoreError>;
}

/// Object store reached over HTTP at `{base}/{key}`.
pub struct HttpObjectStore {
    client: reqwest::Client,
    base: String,
    hash_header: HeaderName,
}

impl HttpObjectStore {
    pub fn new(base: &str, hash_header: &str) -> Result<Self, ObjectStoreError> {
        Self::with_client(reqwest::Client::new(), base, hash_header)
    }

    pub fn with_client(
        client: reqwest::Client,
        base: &str,
        hash_header: &str,
    ) -> Result<Self, ObjectStoreError> {
        let hash_header = HeaderName::from_bytes(hash_header.as_bytes())
            .map_err(|_| ObjectStoreError::InvalidHashHeader(hash_header.to_string()))?;
        let base = if base.contains("://") {
            base.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", base.trim_end_matches('/'))
        };
        Ok(Self {
            client,
            base,
            hash_header,
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base, key)
    }

    async fn relay(resp: reqwest::Response) -> Result<UpstreamResponse, ObjectStoreError> {
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?;
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn head(&self, key: &str) -> Result<Head, ObjectStoreError> {
        let resp = self.client.head(self.url(key)).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(Head::NotFound),
            StatusCode::OK => {
                let hash = resp
                    .headers()
                    .get(&self.hash_header)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Ok(Head::Found { hash })
            }
            status => Err(ObjectStoreError::UnexpectedStatus { op: "HEAD", status }),
        }
    }

    async fn get(&self, key: &str) -> Result<UpstreamResponse, ObjectStoreError> {
        let resp = self.client.get(self.url(key)).send().await?;
        Self::relay(resp).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<UpstreamResponse, ObjectStoreError> {
        debug!(key, len = data.len(), "uploading object");
        let resp = self
            .client
            .post(self.url(key))
            .header(CONTENT_TYPE, UPLOAD_CONTENT_TYPE)
            .body(data)
            .send()
            .await?;
        Self::relay(resp).await
    }
}

/// Hex SHA-256 of `data`, the hash [`InMemoryObjectStore`] reports.
pub fn content_hash(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Process-local store for tests and single-machine runs.
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, Bytes>>,
    hash_header: HeaderName,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            hash_header: HeaderName::from_static("x-sha1"),
        }
    }
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hash_header(hash_header: &str) -> Result<Self, ObjectStoreError> {
        let hash_header = HeaderName::from_bytes(hash_header.as_bytes())
            .map_err(|_| ObjectStoreError::InvalidHashHeader(hash_header.to_string()))?;
        Ok(Self {
            hash_header,
            ..Self::default()
        })
    }

    /// Store `data` under `key` directly, bypassing the gateway.
    pub async fn insert(&self, key: &str, data: impl Into<Bytes>) {
        self.objects.write().await.insert(key.to_string(), data.into());
    }

    pub async fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.read().await.get(key).cloned()
    }

    fn respond(&self, status: StatusCode, hash: Option<String>, body: Bytes) -> UpstreamResponse {
        let mut headers = HeaderMap::new();
        if let Some(value) = hash.and_then(|h| HeaderValue::from_str(&h).ok()) {
            headers.insert(self.hash_header.clone(), value);
        }
        UpstreamResponse {
            status,
            headers,
            body,
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn head(&self, key: &str) -> Result<Head, ObjectStoreError> {
        Ok(match self.objects.read().await.get(key) {
            Some(data) => Head::Found {
                hash: content_hash(data),
            },
            None => Head::NotFound,
        })
    }

    async fn get(&self, key: &str) -> Result<UpstreamResponse, ObjectStoreError> {
        let found = self.objects.read().await.get(key).cloned();
        Ok(match found {
            Some(data) => self.respond(StatusCode::OK, Some(content_hash(&data)), data),
            None => self.respond(StatusCode::NOT_FOUND, None, Bytes::new()),
        })
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<UpstreamResponse, ObjectStoreError> {
        let hash = content_hash(&data);
        self.objects.write().await.insert(key.to_string(), data);
        Ok(self.respond(StatusCode::OK, Some(hash.clone()), Bytes::from(hash)))
    }
}
