//! Isolation levels and transaction modes
//!
//! The store is an MVCC engine, so only read-committed and snapshot
//! isolation are materially different on the wire. The session surface
//! accepts all four SQL-level names; levels stricter than snapshot
//! isolation degrade to it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Isolation level as seen by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Statements read the latest committed data
    ReadCommitted,
    /// All reads happen at the transaction's start timestamp
    SnapshotIsolation,
}

impl IsolationLevel {
    /// Map a `transaction_isolation` session value to a store-level isolation.
    ///
    /// `REPEATABLE-READ` and `SERIALIZABLE` degrade to snapshot isolation;
    /// the degradation is logged, not rejected.
    pub fn from_session_value(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "READ-UNCOMMITTED" | "READ-COMMITTED" => Some(IsolationLevel::ReadCommitted),
            "REPEATABLE-READ" => Some(IsolationLevel::SnapshotIsolation),
            "SERIALIZABLE" => {
                tracing::warn!("SERIALIZABLE is not supported, degrading to snapshot isolation");
                Some(IsolationLevel::SnapshotIsolation)
            }
            _ => None,
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadCommitted => write!(f, "read-committed"),
            IsolationLevel::SnapshotIsolation => write!(f, "snapshot-isolation"),
        }
    }
}

/// Default transaction mode for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnMode {
    /// Conflicts detected at prewrite
    Optimistic,
    /// Row locks taken as statements execute
    Pessimistic,
}

impl TxnMode {
    /// Parse a `txn_mode` session value.
    pub fn from_session_value(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "optimistic" => Some(TxnMode::Optimistic),
            "pessimistic" => Some(TxnMode::Pessimistic),
            _ => None,
        }
    }
}

impl fmt::Display for TxnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnMode::Optimistic => write!(f, "optimistic"),
            TxnMode::Pessimistic => write!(f, "pessimistic"),
        }
    }
}
