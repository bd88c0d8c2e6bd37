//! Pessimistic lock lifecycle
//!
//! Row locks are taken as statements execute: the first write locks the
//! primary key in its own single-row request and starts the TTL heartbeat,
//! every statement advances the transaction's for-update ts, and whatever
//! was locked but never written is rolled back as residual before commit.
//! From prewrite onward the pessimistic path reuses the optimistic driver.

use crate::error::{TxnError, TxnResult};
use crate::transaction::{PessState, Transaction};
use meridian_store::{
    Key, KeyAddr, Mutation, PessimisticLockRequest, PessimisticRollbackRequest, PrimaryKey,
    TableId,
};
use std::sync::atomic::Ordering;

/// Lock and buffer one DML statement's rows.
pub(crate) async fn execute_dml(
    txn: &Transaction,
    state: &PessState,
    mutations: Vec<Mutation>,
) -> TxnResult<()> {
    let stmt_ts = txn.tso().now();
    txn.advance_for_update_ts(stmt_ts);

    let mut resolved = mutations;
    for m in &mut resolved {
        m.partition_id = txn.router().resolve(m.table_id, &m.key);
        m.for_update_ts = Some(stmt_ts);
    }

    if !state.primary_locked.load(Ordering::SeqCst) {
        // First write: the primary gets its own single-row lock request
        let first = &resolved[0];
        let primary = PrimaryKey::from_mutation(first);
        let primary_addr = first.addr();
        lock_keys(txn, state, stmt_ts, vec![primary_addr.clone()]).await?;
        txn.set_primary(primary);
        state.primary_locked.store(true, Ordering::SeqCst);
        txn.start_heartbeat(primary_addr.clone());
        tracing::info!("{} primary key locked", txn.id());

        let rest: Vec<KeyAddr> = resolved[1..].iter().map(Mutation::addr).collect();
        if let Err(e) = lock_keys(txn, state, stmt_ts, rest).await {
            // The statement failed; give back what it took, primary included
            release_statement_locks(txn, state, stmt_ts, &[primary_addr]).await;
            txn.abort_heartbeat();
            state.primary_locked.store(false, Ordering::SeqCst);
            txn.clear_primary();
            return Err(e);
        }
    } else {
        let keys: Vec<KeyAddr> = resolved.iter().map(Mutation::addr).collect();
        lock_keys(txn, state, stmt_ts, keys).await?;
    }

    let mut cache = txn.cache();
    for m in resolved {
        cache.merge(m);
    }
    Ok(())
}

/// Lock rows for SELECT ... FOR UPDATE and record them as lock entries in
/// the cache; unwritten ones become residual at commit time.
pub(crate) async fn lock_for_select(
    txn: &Transaction,
    state: &PessState,
    keys: Vec<(TableId, Key)>,
) -> TxnResult<()> {
    if keys.is_empty() {
        return Ok(());
    }
    let stmt_ts = txn.tso().now();
    txn.advance_for_update_ts(stmt_ts);

    let addrs: Vec<KeyAddr> = keys
        .into_iter()
        .map(|(table_id, key)| {
            let partition = txn.router().resolve(table_id, &key);
            KeyAddr::new(table_id, partition, key)
        })
        .collect();
    lock_keys(txn, state, stmt_ts, addrs.clone()).await?;

    let mut cache = txn.cache();
    for addr in addrs {
        let mut m = Mutation::lock(addr.table_id, addr.key);
        m.partition_id = addr.partition_id;
        m.for_update_ts = Some(stmt_ts);
        cache.merge(m);
    }
    Ok(())
}

/// Acquire pessimistic locks for one statement, bounded by the session's
/// lock wait timeout. Successful locks join the acquired set.
async fn lock_keys(
    txn: &Transaction,
    state: &PessState,
    for_update_ts: u64,
    keys: Vec<KeyAddr>,
) -> TxnResult<()> {
    if keys.is_empty() {
        return Ok(());
    }
    let req = PessimisticLockRequest {
        start_ts: txn.start_ts(),
        for_update_ts,
        keys: keys.clone(),
        lock_ttl: txn.config().lock_ttl,
    };
    let result = match tokio::time::timeout(
        txn.lock_timeout(),
        txn.store().txn_pessimistic_lock(req),
    )
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TxnError::from(e)),
        Err(_) => Err(TxnError::LockWaitTimeout),
    };
    match result {
        Ok(()) => {
            state
                .acquired
                .lock()
                .extend(keys.into_iter().map(|k| (k, for_update_ts)));
            Ok(())
        }
        Err(e) => {
            tracing::warn!("{} pessimistic lock failed: {}", txn.id(), e);
            Err(e)
        }
    }
}

async fn release_statement_locks(
    txn: &Transaction,
    state: &PessState,
    for_update_ts: u64,
    keys: &[KeyAddr],
) {
    if keys.is_empty() {
        return;
    }
    let req = PessimisticRollbackRequest {
        start_ts: txn.start_ts(),
        for_update_ts,
        keys: keys.to_vec(),
    };
    if let Err(e) = txn.store().txn_pessimistic_rollback(req).await {
        tracing::warn!("{} failed to release statement locks: {}", txn.id(), e);
    }
    state.acquired.lock().retain(|(k, _)| !keys.contains(k));
}

/// Roll back locks never covered by a buffered write. Runs before commit
/// and on the empty-commit path; always best-effort.
pub(crate) async fn rollback_residual_locks(txn: &Transaction, state: &PessState) {
    let residual = txn.cache().residual_locks();
    if residual.is_empty() {
        return;
    }
    tracing::info!(
        "{} rolling back {} residual pessimistic locks",
        txn.id(),
        residual.len()
    );
    for (for_update_ts, keys) in group_by_ts(residual, txn.for_update_ts()) {
        let req = PessimisticRollbackRequest {
            start_ts: txn.start_ts(),
            for_update_ts,
            keys: keys.clone(),
        };
        if let Err(e) = txn.store().txn_pessimistic_rollback(req).await {
            tracing::warn!("{} residual lock rollback failed: {}", txn.id(), e);
        }
        state.acquired.lock().retain(|(k, _)| !keys.contains(k));
    }
    txn.cache().remove_locks();
}

/// Release every lock the transaction still owns. Used by rollback; errors
/// are logged, never raised.
pub(crate) async fn rollback_all_locks(txn: &Transaction, state: &PessState) {
    let acquired: Vec<(KeyAddr, u64)> = std::mem::take(&mut *state.acquired.lock());
    if acquired.is_empty() {
        return;
    }
    tracing::info!(
        "{} rolling back {} pessimistic locks",
        txn.id(),
        acquired.len()
    );
    let entries = acquired.into_iter().map(|(k, ts)| (k, Some(ts))).collect();
    for (for_update_ts, keys) in group_by_ts(entries, txn.for_update_ts()) {
        let req = PessimisticRollbackRequest {
            start_ts: txn.start_ts(),
            for_update_ts,
            keys,
        };
        if let Err(e) = txn.store().txn_pessimistic_rollback(req).await {
            tracing::warn!("{} pessimistic rollback failed: {}", txn.id(), e);
        }
    }
}

fn group_by_ts(
    entries: Vec<(KeyAddr, Option<u64>)>,
    fallback_ts: u64,
) -> Vec<(u64, Vec<KeyAddr>)> {
    let mut groups: Vec<(u64, Vec<KeyAddr>)> = Vec::new();
    for (addr, ts) in entries {
        let ts = ts.unwrap_or(fallback_ts);
        match groups.iter_mut().find(|(t, _)| *t == ts) {
            Some((_, group)) => group.push(addr),
            None => groups.push((ts, vec![addr])),
        }
    }
    groups
}
