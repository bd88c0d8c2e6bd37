//! Typed errors surfaced by the store
//!
//! The coordinator's retry engine matches on these kinds: region splits and
//! expired commit timestamps are recovered locally, everything else drives
//! the transaction to rollback.

use crate::types::Key;
use thiserror::Error;

/// Errors a store RPC can surface
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A newer committed version exists for the key
    #[error("write conflict on key {key:?}, conflicting commit ts {conflict_ts}")]
    WriteConflict { key: Key, conflict_ts: u64 },

    /// Unique constraint or existence check violated
    #[error("duplicate entry for key {key:?}")]
    DuplicateEntry { key: Key },

    /// The partition was rebalanced mid-RPC; re-resolve and retry
    #[error("region split, partition must be re-resolved")]
    RegionSplit,

    /// The chosen commit ts is no longer usable; fetch a fresh one
    #[error("commit ts expired, minimum usable ts {min_commit_ts}")]
    CommitTsExpired { min_commit_ts: u64 },

    /// A pessimistic lock wait exceeded its deadline
    #[error("lock wait timed out")]
    LockTimeout,

    /// Non-retriable RPC failure
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
