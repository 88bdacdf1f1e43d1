//! Cluster-wide locks as seen by request handlers.

use std::sync::Arc;

use async_trait::async_trait;
use keylock_raft::typ::NodeId;
use keylock_raft::{ClusterNode, NodeError};
use tracing::{debug, warn};

#[async_trait]
pub trait LockService: Send + Sync {
    /// Block until `owner` holds `key` cluster-wide.
    async fn lock(&self, key: &str, owner: &str) -> Result<(), NodeError>;

    async fn unlock(&self, key: &str, owner: &str) -> Result<(), NodeError>;

    fn is_leader(&self) -> bool;

    fn current_leader(&self) -> Option<NodeId>;
}

#[async_trait]
impl LockService for ClusterNode {
    async fn lock(&self, key: &str, owner: &str) -> Result<(), NodeError> {
        ClusterNode::lock(self, key, owner).await
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<(), NodeError> {
        ClusterNode::unlock(self, key, owner).await
    }

    fn is_leader(&self) -> bool {
        ClusterNode::is_leader(self)
    }

    fn current_leader(&self) -> Option<NodeId> {
        ClusterNode::current_leader(self)
    }
}

/// A held lock. Released with [`LockGuard::release`]; a guard dropped
/// without it (a cancelled request) unlocks in a background task.
pub struct LockGuard {
    locks: Arc<dyn LockService>,
    key: String,
    owner: String,
    released: bool,
}

impl LockGuard {
    pub async fn acquire(
        locks: Arc<dyn LockService>,
        key: &str,
        owner: &str,
    ) -> Result<Self, NodeError> {
        locks.lock(key, owner).await?;
        debug!(key, owner, "lock acquired");
        Ok(Self {
            locks,
            key: key.to_string(),
            owner: owner.to_string(),
            released: false,
        })
    }

    pub async fn release(mut self) -> Result<(), NodeError> {
        self.released = true;
        self.locks.unlock(&self.key, &self.owner).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "lock guard dropped outside a runtime, lock left held");
            return;
        };
        let locks = self.locks.clone();
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);
        handle.spawn(async move {
            if let Err(e) = locks.unlock(&key, &owner).await {
                warn!(%key, error = %e, "background unlock failed");
            }
        });
    }
}
