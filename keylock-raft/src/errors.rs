use thiserror::Error;

/// A log payload that is not a valid lock command.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed command: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("command has an empty key")]
    EmptyKey,
}

/// Failure to persist, load or restore a lock table snapshot.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Failure to get a command committed through the consensus log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProposeError {
    #[error("proposal timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("not the leader (current leader: {leader:?})")]
    NotLeader { leader: Option<u64> },

    #[error("consensus error: {0}")]
    Consensus(String),

    #[error("forwarding to leader failed: {0}")]
    Forward(String),

    #[error("consensus log is shut down")]
    ShutDown,

    #[error("command could not be encoded: {0}")]
    Encode(String),
}

/// Errors returned by the cluster node's lock API.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Propose(#[from] ProposeError),

    #[error("lock on {key} still held by {owner} after {waited:?}")]
    LockTimeout {
        key: String,
        owner: String,
        waited: std::time::Duration,
    },

    #[error("{key} is held by {owner}, not by the caller")]
    NotOwner { key: String, owner: String },

    #[error("unexpected apply response: {0}")]
    Unexpected(String),

    #[error("node is stopped")]
    Stopped,
}
