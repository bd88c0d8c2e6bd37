//! Retry engine
//!
//! Region splits and expired commit timestamps are retried inside the RPC
//! loops; this module holds the shared backoff, the write-conflict policy,
//! and the statement-level retry driver for auto-commit statements.

use crate::error::{TxnError, TxnResult};
use crate::registry::{StatementHandle, TxnEnv};
use crate::transaction::Transaction;
use meridian_common::TxnConfig;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Fixed pause between region-split retries
pub const REGION_SPLIT_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) async fn region_split_pause() {
    tokio::time::sleep(REGION_SPLIT_BACKOFF).await;
}

/// What to do about a write conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-plan the statement with a fresh start ts
    RetryStatement,
    /// Surface the conflict
    Abort,
}

/// Write-conflict policy: the statement is only the transactional unit for
/// optimistic auto-commit statements, and retry must be enabled and funded.
pub fn write_conflict_decision(
    auto_commit: bool,
    pessimistic: bool,
    config: &TxnConfig,
) -> RetryDecision {
    if !pessimistic && auto_commit && config.txn_retry && config.txn_retry_cnt > 0 {
        RetryDecision::RetryStatement
    } else {
        RetryDecision::Abort
    }
}

/// Run one auto-commit statement, re-planning on write conflicts.
///
/// Each attempt begins a fresh transaction (and therefore a fresh start ts),
/// replays the plan callback into it, and commits. Retries are bounded by
/// `txn_retry_cnt`; `max_execution_time` bounds the whole job when set.
/// Returns the commit timestamp of the successful attempt.
pub async fn run_auto_commit_statement<F, Fut>(
    env: &Arc<TxnEnv>,
    conn_id: u64,
    sql: &str,
    plan: F,
) -> TxnResult<u64>
where
    F: Fn(Arc<Transaction>, Arc<StatementHandle>) -> Fut,
    Fut: Future<Output = TxnResult<()>>,
{
    let conn = env.connection(conn_id);
    let config = conn.config();
    let deadline = (config.max_execution_time > Duration::ZERO)
        .then(|| tokio::time::Instant::now() + config.max_execution_time);
    let max_retries = if config.txn_retry {
        config.txn_retry_cnt
    } else {
        0
    };

    let mut attempt: u32 = 0;
    loop {
        let stmt = conn.start_statement();
        let txn = env.begin_with(conn_id, config.clone(), true);
        txn.attach_statement(stmt.clone());
        txn.add_sql(sql);

        let run = async {
            plan(txn.clone(), stmt.clone()).await?;
            txn.commit().await
        };
        let result = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, run).await {
                Ok(result) => result,
                Err(_) => Err(TxnError::DeadlineExceeded),
            },
            None => run.await,
        };
        if matches!(result, Err(TxnError::DeadlineExceeded)) {
            // The commit future was dropped mid-flight; clear any intents
            if let Err(e) = txn.rollback().await {
                tracing::error!("{} rollback after deadline failed: {}", txn.id(), e);
            }
        }
        txn.close().await;
        conn.finish_statement(stmt.id());

        match result {
            Ok(()) => return Ok(txn.commit_ts()),
            Err(TxnError::WriteConflict { .. })
                if !txn.is_pessimistic() && attempt < max_retries =>
            {
                attempt += 1;
                tracing::warn!(
                    "auto-commit statement hit a write conflict, re-planning with a fresh start ts (attempt {}/{})",
                    attempt,
                    max_retries
                );
            }
            Err(e) => return Err(e),
        }
    }
}
