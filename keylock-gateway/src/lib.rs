//! `keylock-gateway`: HTTP front end doing lock-guarded conditional writes.
//!
//! Each `GET /{hexid}` or `POST /{hexid}` takes the cluster-wide lock for
//! `hexid` from a [`LockService`] (normally a `keylock_raft::ClusterNode`),
//! checks the write precondition against the [`ObjectStore`], performs the
//! store call, releases the lock and relays the store's response.

pub mod app;
pub mod errors;
pub mod http;
pub mod lock_service;
pub mod object_store;
pub mod service_configuration;

pub use app::{build_router, AppState};
pub use errors::{GatewayError, ObjectStoreError};
pub use lock_service::{LockGuard, LockService};
pub use object_store::{Head, HttpObjectStore, InMemoryObjectStore, ObjectStore, UpstreamResponse};
pub use service_configuration::{Args, ServiceConfiguration, Upstream};
