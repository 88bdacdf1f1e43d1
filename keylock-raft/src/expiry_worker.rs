//! Background task that frees locks whose lease has run out, by proposing
//! `Expire` commands through Raft consensus.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::commands::{unix_millis, LockCommand, LockResponse};
use crate::consensus::ConsensusLog;
use crate::state_machine::LockStateMachine;

/// Run the lease expiry loop until `stopped` fires.
///
/// Followers skip every tick. Only the leader proposes expiries.
pub async fn run_expiry_worker(
    consensus: Arc<dyn ConsensusLog>,
    state_machine: LockStateMachine,
    interval: Duration,
    propose_timeout: Duration,
    stopped: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = stopped.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !consensus.is_leader() {
            continue;
        }

        let now_ms = unix_millis();
        let expired = state_machine.lock_table().await.expired(now_ms);
        if expired.is_empty() {
            continue;
        }
        debug!(count = expired.len(), "expiring lock leases");

        for (key, owner) in expired {
            let cmd = LockCommand::expire(&key, &owner, now_ms);
            match consensus.propose(&cmd, propose_timeout).await {
                Ok(LockResponse::Released) => debug!(%key, %owner, "expired lock released"),
                Ok(_) => {}
                Err(e) => warn!(%key, %owner, error = %e, "failed to propose lock expiry"),
            }
        }
    }
}
