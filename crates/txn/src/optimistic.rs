//! Optimistic commit path: prewrite and the commit RPC loops
//!
//! Pessimistic transactions share everything here from prewrite onward;
//! their mutations simply carry a per-row for-update ts.

use crate::error::{TxnError, TxnResult};
use crate::retry;
use crate::state::TxnStatus;
use crate::transaction::Transaction;
use meridian_store::{
    CommitRequest, KeyAddr, Mutation, Op, PartitionId, PrewriteRequest, PrimaryKey, StoreError,
};
use std::collections::VecDeque;
use std::time::Instant;

/// How a successful prewrite ended
pub(crate) enum PrewriteOutcome {
    /// Primary and all secondaries are prewritten
    Done,
    /// The primary was a pure existence check; there is nothing to commit
    PrimaryCheckNotExists,
}

/// Prewrite the primary key, then all secondaries grouped by partition.
pub(crate) async fn run_prewrite(txn: &Transaction) -> TxnResult<PrewriteOutcome> {
    tracing::info!("{} start prewrite primary key", txn.id());
    txn.check_continue()?;

    // A pessimistic transaction chose (and locked) its primary at the first
    // write; otherwise the first buffered write is the primary.
    let primary_mutation = {
        let cache = txn.cache();
        match txn.primary() {
            Some(chosen) => cache.get(chosen.table_id, &chosen.key).cloned(),
            None => cache.primary().cloned(),
        }
    }
    .ok_or_else(|| {
        TxnError::State(format!("{} has no mutation to choose as primary", txn.id()))
    })?;
    let primary = PrimaryKey::from_mutation(&primary_mutation);
    txn.set_primary(primary.clone());

    prewrite_primary(txn, primary_mutation.clone()).await?;
    txn.set_status(TxnStatus::PreWritePrimaryKey);
    txn.profile().end_prewrite_primary();
    tracing::info!("{} prewrite primary key end", txn.id());

    if primary_mutation.op == Op::CheckNotExists {
        tracing::info!(
            "{} primary op is check-not-exists, nothing further to write",
            txn.id()
        );
        return Ok(PrewriteOutcome::PrimaryCheckNotExists);
    }

    txn.check_continue()?;
    prewrite_secondaries(txn, &primary).await?;
    txn.set_status(TxnStatus::PreWrite);
    txn.profile().end_prewrite_secondary();
    Ok(PrewriteOutcome::Done)
}

/// Prewrite the primary key alone, retrying expired commit timestamps and
/// region splits within the lock timeout.
async fn prewrite_primary(txn: &Transaction, mut mutation: Mutation) -> TxnResult<()> {
    let deadline = Instant::now() + txn.lock_timeout();
    loop {
        let req = PrewriteRequest {
            start_ts: txn.start_ts(),
            primary: mutation.addr(),
            mutations: vec![mutation.clone()],
            lock_ttl: txn.config().lock_ttl,
            for_update_ts: mutation.for_update_ts,
        };
        let err = match txn.store().txn_prewrite(req).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        match &err {
            StoreError::CommitTsExpired { min_commit_ts } => {
                tracing::warn!(
                    "{} prewrite primary: commit ts expired (min {}), refreshing",
                    txn.id(),
                    min_commit_ts
                );
                txn.refresh_commit_ts(*min_commit_ts);
            }
            StoreError::RegionSplit => {
                tracing::warn!(
                    "{} prewrite primary: region split, re-resolving partition",
                    txn.id()
                );
                let partition = txn.router().resolve(mutation.table_id, &mutation.key);
                mutation.partition_id = partition;
                txn.update_primary_partition(partition);
                retry::region_split_pause().await;
            }
            _ => return Err(err.into()),
        }
        if Instant::now() >= deadline {
            return Err(err.into());
        }
    }
}

/// Prewrite every secondary, one RPC per participant partition. Region
/// splits re-route the affected batch and retry.
async fn prewrite_secondaries(txn: &Transaction, primary: &PrimaryKey) -> TxnResult<()> {
    let mut queue: VecDeque<Vec<Mutation>> = {
        let cache = txn.cache();
        cache
            .write_groups()
            .into_iter()
            .map(|(_, batch)| {
                batch
                    .into_iter()
                    .filter(|m| !(m.table_id == primary.table_id && m.key == primary.key))
                    .collect::<Vec<_>>()
            })
            .filter(|batch| !batch.is_empty())
            .collect()
    };

    let deadline = Instant::now() + txn.lock_timeout();
    while let Some(batch) = queue.pop_front() {
        txn.check_continue()?;
        let req = PrewriteRequest {
            start_ts: txn.start_ts(),
            primary: primary.addr(),
            mutations: batch.clone(),
            lock_ttl: txn.config().lock_ttl,
            for_update_ts: None,
        };
        match txn.store().txn_prewrite(req).await {
            Ok(()) => {}
            Err(StoreError::RegionSplit) => {
                if Instant::now() >= deadline {
                    return Err(StoreError::RegionSplit.into());
                }
                tracing::warn!(
                    "{} prewrite: region split, re-routing {} mutations",
                    txn.id(),
                    batch.len()
                );
                for group in reroute_mutations(txn, batch) {
                    queue.push_back(group);
                }
                retry::region_split_pause().await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn reroute_mutations(txn: &Transaction, batch: Vec<Mutation>) -> Vec<Vec<Mutation>> {
    let mut groups: Vec<(PartitionId, Vec<Mutation>)> = Vec::new();
    for mut m in batch {
        m.partition_id = txn.router().resolve(m.table_id, &m.key);
        match groups.iter_mut().find(|(p, _)| *p == m.partition_id) {
            Some((_, group)) => group.push(m),
            None => groups.push((m.partition_id, vec![m])),
        }
    }
    groups.into_iter().map(|(_, group)| group).collect()
}

/// Commit the primary key, retrying region splits and expired commit
/// timestamps until success or the lock timeout. Best-effort: every failure
/// mode reports `false` and the caller rolls back.
pub(crate) async fn commit_primary_key(txn: &Transaction) -> bool {
    let Some(mut primary) = txn.primary() else {
        tracing::error!("{} has no primary key to commit", txn.id());
        return false;
    };
    let deadline = Instant::now() + txn.lock_timeout();
    loop {
        let req = CommitRequest {
            start_ts: txn.start_ts(),
            commit_ts: txn.commit_ts(),
            keys: vec![primary.addr()],
        };
        match txn.store().txn_commit(req).await {
            Ok(found) => {
                if !found {
                    tracing::error!(
                        "{} commit primary key found nothing to commit, commit ts {}",
                        txn.id(),
                        txn.commit_ts()
                    );
                }
                return found;
            }
            Err(StoreError::RegionSplit) => {
                tracing::error!(
                    "{} commit primary key: region split, re-resolving partition",
                    txn.id()
                );
                let partition = txn.router().resolve(primary.table_id, &primary.key);
                primary.partition_id = partition;
                txn.update_primary_partition(partition);
                retry::region_split_pause().await;
            }
            Err(StoreError::CommitTsExpired { min_commit_ts }) => {
                tracing::error!(
                    "{} commit primary key: commit ts expired (min {})",
                    txn.id(),
                    min_commit_ts
                );
                txn.refresh_commit_ts(min_commit_ts);
            }
            Err(e) => {
                tracing::error!("{} commit primary key failed: {}", txn.id(), e);
                return false;
            }
        }
        if Instant::now() >= deadline {
            tracing::error!("{} commit primary key exceeded the lock timeout", txn.id());
            return false;
        }
    }
}

/// Commit all secondaries. Runs on the commit pool after the primary is
/// durable; failures are logged and abandoned, the store resolves the rest
/// through the primary.
pub(crate) async fn commit_secondaries(txn: std::sync::Arc<Transaction>) {
    let Some(primary) = txn.primary() else {
        return;
    };
    let commit_ts = txn.commit_ts();
    let mut queue: VecDeque<Vec<KeyAddr>> = {
        let cache = txn.cache();
        cache
            .write_groups()
            .into_iter()
            .map(|(_, batch)| {
                batch
                    .iter()
                    .filter(|m| !(m.table_id == primary.table_id && m.key == primary.key))
                    .map(Mutation::addr)
                    .collect::<Vec<_>>()
            })
            .filter(|batch| !batch.is_empty())
            .collect()
    };

    let deadline = Instant::now() + txn.lock_timeout();
    while let Some(keys) = queue.pop_front() {
        let req = CommitRequest {
            start_ts: txn.start_ts(),
            commit_ts,
            keys: keys.clone(),
        };
        match txn.store().txn_commit(req).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("{} secondary commit found keys already resolved", txn.id());
            }
            Err(StoreError::RegionSplit) if Instant::now() < deadline => {
                tracing::warn!(
                    "{} secondary commit: region split, re-routing {} keys",
                    txn.id(),
                    keys.len()
                );
                for group in reroute_keys(&txn, keys) {
                    queue.push_back(group);
                }
                retry::region_split_pause().await;
            }
            Err(e) => {
                tracing::error!(
                    "{} secondary commit failed: {}; the store resolves the rest via the primary",
                    txn.id(),
                    e
                );
                return;
            }
        }
    }
    tracing::info!("{} secondary commit end", txn.id());
}

fn reroute_keys(txn: &Transaction, keys: Vec<KeyAddr>) -> Vec<Vec<KeyAddr>> {
    let mut groups: Vec<(PartitionId, Vec<KeyAddr>)> = Vec::new();
    for mut addr in keys {
        addr.partition_id = txn.router().resolve(addr.table_id, &addr.key);
        match groups.iter_mut().find(|(p, _)| *p == addr.partition_id) {
            Some((_, group)) => group.push(addr),
            None => groups.push((addr.partition_id, vec![addr])),
        }
    }
    groups.into_iter().map(|(_, group)| group).collect()
}
