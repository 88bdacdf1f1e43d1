//! Openraft type configuration for keylock.
//!
//! Log entries carry an [`EncodedCommand`]; applying one yields a [`LockResponse`].

use std::io::Cursor;

use crate::commands::{EncodedCommand, LockResponse};

pub type NodeId = u64;
pub type Node = openraft::BasicNode;

openraft::declare_raft_types!(
    /// The openraft type configuration for the lock table.
    pub TypeConfig:
        D = EncodedCommand,
        R = LockResponse,
        NodeId = NodeId,
        Node = Node,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
);
