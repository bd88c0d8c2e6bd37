//! Transactional RPC contract
//!
//! One method per store RPC, with plain request structs. Implementations are
//! the real store client in production and `MemStore` in tests.

use crate::error::Result;
use crate::types::{KeyAddr, Mutation};
use async_trait::async_trait;
use std::time::Duration;

/// Phase-1 prewrite of a batch of mutations
#[derive(Debug, Clone)]
pub struct PrewriteRequest {
    pub start_ts: u64,
    /// Primary key of the owning transaction (lock records point at it)
    pub primary: KeyAddr,
    pub mutations: Vec<Mutation>,
    pub lock_ttl: Duration,
    /// Transaction-level for-update ts; pessimistic rows may override per mutation
    pub for_update_ts: Option<u64>,
}

/// Phase-2 commit of previously prewritten keys
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub start_ts: u64,
    pub commit_ts: u64,
    pub keys: Vec<KeyAddr>,
}

/// Pessimistic row-lock acquisition for one statement
#[derive(Debug, Clone)]
pub struct PessimisticLockRequest {
    pub start_ts: u64,
    pub for_update_ts: u64,
    pub keys: Vec<KeyAddr>,
    pub lock_ttl: Duration,
}

/// Release of pessimistic locks that will not be committed
#[derive(Debug, Clone)]
pub struct PessimisticRollbackRequest {
    pub start_ts: u64,
    pub for_update_ts: u64,
    pub keys: Vec<KeyAddr>,
}

/// TTL extension for the primary lock
#[derive(Debug, Clone)]
pub struct HeartbeatRequest {
    pub start_ts: u64,
    pub primary: KeyAddr,
    pub new_ttl: Duration,
}

/// Removal of prewrite intents after an abort
#[derive(Debug, Clone)]
pub struct BatchRollbackRequest {
    pub start_ts: u64,
    pub keys: Vec<KeyAddr>,
}

/// Typed RPCs against the transactional store
#[async_trait]
pub trait TxnStore: Send + Sync {
    /// Write lock records and data intents for a batch of mutations.
    async fn txn_prewrite(&self, req: PrewriteRequest) -> Result<()>;

    /// Commit prewritten keys at `commit_ts`.
    ///
    /// Returns `false` when nothing was there to commit. A key whose intent
    /// is gone but which was already committed by the same `start_ts` counts
    /// as committed.
    async fn txn_commit(&self, req: CommitRequest) -> Result<bool>;

    /// Acquire pessimistic row locks for one statement.
    async fn txn_pessimistic_lock(&self, req: PessimisticLockRequest) -> Result<()>;

    /// Best-effort release of pessimistic locks.
    async fn txn_pessimistic_rollback(&self, req: PessimisticRollbackRequest) -> Result<()>;

    /// Extend the primary lock's TTL.
    async fn txn_heartbeat(&self, req: HeartbeatRequest) -> Result<()>;

    /// Remove prewrite intents for an aborted transaction.
    async fn txn_batch_rollback(&self, req: BatchRollbackRequest) -> Result<()>;
}
