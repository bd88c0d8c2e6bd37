//! Transaction identifier
//!
//! A transaction is identified by the (server-id, start-ts, seq) triple.
//! The start timestamp dominates the ordering so that ids sort in begin
//! order; server id and sequence break ties between coordinators.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction identifier: (server-id, start-ts, seq)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId {
    /// Coordinator server that owns the transaction
    pub server_id: u64,
    /// Snapshot timestamp assigned at begin
    pub start_ts: u64,
    /// Per-server begin sequence
    pub seq: u64,
}

impl TxnId {
    /// Create a new transaction id
    pub const fn new(server_id: u64, start_ts: u64, seq: u64) -> Self {
        Self {
            server_id,
            start_ts,
            seq,
        }
    }
}

impl PartialOrd for TxnId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TxnId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Begin order first, then owner, then sequence
        (self.start_ts, self.server_id, self.seq).cmp(&(
            other.start_ts,
            other.server_id,
            other.seq,
        ))
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.server_id, self.start_ts, self.seq)
    }
}
