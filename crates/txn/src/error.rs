//! Error types for the transaction coordinator
//!
//! Region splits and expired commit timestamps never reach this enum: the
//! retry engine recovers them locally. Everything here is surfaced to the
//! caller after the transaction has been driven to rollback (or, for lock
//! waits, with the transaction preserved).

use meridian_common::TxnId;
use meridian_store::StoreError;
use thiserror::Error;

/// Errors surfaced by transaction operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TxnError {
    /// Optimistic prewrite collided with a newer committed version
    #[error("write conflict on key {key:?}, conflicting ts {conflict_ts}")]
    WriteConflict { key: Vec<u8>, conflict_ts: u64 },

    /// Unique constraint or existence check violated; never retried
    #[error("duplicate entry for key {key:?}")]
    DuplicateEntry { key: Vec<u8> },

    /// Pessimistic row lock or table lock wait exceeded its deadline
    #[error("Lock wait timeout exceeded")]
    LockWaitTimeout,

    /// The transaction was cancelled by an operator kill
    #[error("transaction {0} has been cancelled")]
    Cancelled(TxnId),

    /// API misuse: the operation is not legal in the current status
    #[error("invalid transaction state: {0}")]
    State(String),

    /// The primary key commit did not succeed within the lock timeout
    #[error("commit of primary key failed for transaction {txn_id}, commit ts {commit_ts}")]
    CommitPrimaryFailed { txn_id: TxnId, commit_ts: u64 },

    /// The per-job execution deadline elapsed
    #[error("query execution was interrupted, max_execution_time exceeded")]
    DeadlineExceeded,

    /// Non-retriable store failure after exhausting local recovery
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for TxnError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WriteConflict { key, conflict_ts } => {
                TxnError::WriteConflict { key, conflict_ts }
            }
            StoreError::DuplicateEntry { key } => TxnError::DuplicateEntry { key },
            StoreError::LockTimeout => TxnError::LockWaitTimeout,
            // Retriable kinds that ran out of budget are no longer retriable
            StoreError::RegionSplit | StoreError::CommitTsExpired { .. } => {
                TxnError::Unavailable(err.to_string())
            }
            StoreError::Unavailable(msg) => TxnError::Unavailable(msg),
        }
    }
}

/// Result type alias for coordinator operations
pub type TxnResult<T> = std::result::Result<T, TxnError>;
