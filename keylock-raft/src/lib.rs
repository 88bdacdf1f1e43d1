//! `keylock-raft`: replicated lock table for keylock.
//!
//! Lock and unlock commands are committed through `openraft` and applied to
//! a deterministic lock table on every replica. The Raft log is persisted in
//! `redb`, snapshots as JSON files, and peers talk over HTTP.

pub mod commands;
pub mod consensus;
pub mod errors;
pub mod expiry_worker;
pub mod log_store;
pub mod network;
pub mod node;
pub mod server;
pub mod snapshot_store;
pub mod state_machine;
pub mod typ;

pub use commands::{CommandKind, LockCommand, LockResponse};
pub use consensus::ConsensusLog;
pub use errors::{NodeError, ProposeError};
pub use node::{ClusterNode, NodeConfig};
