//! Lock commands and their wire encoding.
//!
//! A command is the only unit of replicated mutation. It travels through the
//! Raft log as opaque bytes ([`EncodedCommand`]) and is decoded by the state
//! machine at apply time, so a replica that receives garbage drops the entry
//! instead of failing the whole apply batch.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::errors::CodecError;

/// Operations the lock table understands.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Lock,
    Unlock,
    /// Free a key whose lease ran out, if `owner` still holds it.
    Expire,
}

/// A decoded lock command.
///
/// `owner` identifies the requester holding (or releasing) the lock. Two
/// requests for the same key never share an owner token.
///
/// Time never comes from the applying replica: `now_ms` is the proposer's
/// wall clock and `expires_at_ms` the lease deadline it asked for, both in
/// milliseconds since the Unix epoch.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LockCommand {
    pub kind: CommandKind,
    pub key: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub now_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl LockCommand {
    pub fn lock(key: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::Lock,
            key: key.into(),
            owner: owner.into(),
            now_ms: 0,
            expires_at_ms: None,
        }
    }

    pub fn unlock(key: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::Unlock,
            key: key.into(),
            owner: owner.into(),
            now_ms: 0,
            expires_at_ms: None,
        }
    }

    pub fn expire(key: impl Into<String>, owner: impl Into<String>, now_ms: u64) -> Self {
        Self {
            kind: CommandKind::Expire,
            key: key.into(),
            owner: owner.into(),
            now_ms,
            expires_at_ms: None,
        }
    }

    /// Stamp a lock with the proposer's clock and, when `lease` is set, the
    /// deadline after which other owners may take the key over.
    pub fn at(mut self, now_ms: u64, lease: Option<Duration>) -> Self {
        self.now_ms = now_ms;
        self.expires_at_ms = lease.map(|l| now_ms.saturating_add(l.as_millis() as u64));
        self
    }

    /// Encode into the bytes carried by a Raft log entry.
    pub fn encode(&self) -> Result<EncodedCommand, CodecError> {
        Ok(EncodedCommand(serde_json::to_vec(self)?))
    }

    /// Decode a log payload. Malformed input is an error, never a panic.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let cmd: LockCommand = serde_json::from_slice(buf)?;
        if cmd.key.is_empty() {
            return Err(CodecError::EmptyKey);
        }
        Ok(cmd)
    }
}

/// The application payload of a Raft log entry: an encoded [`LockCommand`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EncodedCommand(pub Vec<u8>);

impl EncodedCommand {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Outcome of applying one log entry to the lock table.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum LockResponse {
    /// The key is now held by the requesting owner.
    Granted,
    /// The key is now free.
    Released,
    /// Lock refused: another owner holds the key. The table is unchanged.
    Held { owner: String },
    /// Unlock refused: the key is held by someone else. The table is unchanged.
    NotOwner { owner: String },
    /// The payload did not decode and was dropped.
    Dropped,
    /// Blank and membership entries, and expiries that no longer apply.
    Noop,
}
