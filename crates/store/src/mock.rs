//! In-memory store stand-in
//!
//! `MemStore` implements the full `TxnStore` contract over an in-process
//! MVCC map: committed version histories per key, prewrite intents, and a
//! pessimistic lock table. Error injection queues let tests drive the
//! coordinator's retry paths, and an RPC log exposes call ordering for
//! properties like primary-first commit.

use crate::api::{
    BatchRollbackRequest, CommitRequest, HeartbeatRequest, PessimisticLockRequest,
    PessimisticRollbackRequest, PrewriteRequest, TxnStore,
};
use crate::error::{Result, StoreError};
use crate::types::{Key, Mutation, Op, TableId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

/// RPC kinds, used for error injection and the call log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rpc {
    Prewrite,
    Commit,
    PessimisticLock,
    PessimisticRollback,
    Heartbeat,
    BatchRollback,
}

/// One logged RPC with the keys it addressed, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcEvent {
    pub rpc: Rpc,
    pub keys: Vec<Key>,
}

#[derive(Debug, Clone)]
struct Version {
    op: Op,
    value: Vec<u8>,
    start_ts: u64,
}

#[derive(Debug, Clone)]
struct Intent {
    start_ts: u64,
    op: Op,
    value: Vec<u8>,
    ttl: Duration,
    since: Instant,
}

#[derive(Debug, Clone)]
struct PessLock {
    start_ts: u64,
    ttl: Duration,
    since: Instant,
}

#[derive(Debug, Default)]
struct KeyState {
    /// commit_ts -> committed version
    versions: BTreeMap<u64, Version>,
    intent: Option<Intent>,
    pess_lock: Option<PessLock>,
}

impl KeyState {
    fn live_intent(&self) -> Option<&Intent> {
        self.intent.as_ref().filter(|i| i.since.elapsed() <= i.ttl)
    }

    fn live_pess_lock(&self) -> Option<&PessLock> {
        self.pess_lock
            .as_ref()
            .filter(|l| l.since.elapsed() <= l.ttl)
    }

    /// Latest committed commit_ts, if any
    fn latest_commit_ts(&self) -> Option<u64> {
        self.versions.last_key_value().map(|(ts, _)| *ts)
    }

    /// Value visible to a snapshot at `read_ts`
    fn visible(&self, read_ts: u64) -> Option<&[u8]> {
        self.versions
            .range(..=read_ts)
            .next_back()
            .and_then(|(_, v)| match v.op {
                Op::Put => Some(v.value.as_slice()),
                _ => None,
            })
    }

    /// Whether another transaction currently blocks this key
    fn blocked_for(&self, start_ts: u64) -> bool {
        if let Some(lock) = self.live_pess_lock()
            && lock.start_ts != start_ts
        {
            return true;
        }
        if let Some(intent) = self.live_intent()
            && intent.start_ts != start_ts
        {
            return true;
        }
        false
    }
}

#[derive(Default)]
struct Inner {
    keys: HashMap<(TableId, Key), KeyState>,
    faults: HashMap<Rpc, VecDeque<StoreError>>,
    events: Vec<RpcEvent>,
}

/// In-memory MVCC store
pub struct MemStore {
    inner: Mutex<Inner>,
    /// How long a pessimistic lock request waits before `LockTimeout`
    lock_wait: Mutex<Duration>,
    /// Artificial latency applied to prewrite calls
    prewrite_delay: Mutex<Duration>,
    /// Artificial latency applied to commit calls, after logging the event
    commit_delay: Mutex<Duration>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            lock_wait: Mutex::new(Duration::from_secs(30)),
            prewrite_delay: Mutex::new(Duration::ZERO),
            commit_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Bound the server-side wait of `txn_pessimistic_lock`
    pub fn set_lock_wait(&self, wait: Duration) {
        *self.lock_wait.lock() = wait;
    }

    /// Delay every prewrite call, for cancellation-window tests
    pub fn set_prewrite_delay(&self, delay: Duration) {
        *self.prewrite_delay.lock() = delay;
    }

    /// Delay every commit call after its event is logged, so tests can
    /// observe an in-flight commit
    pub fn set_commit_delay(&self, delay: Duration) {
        *self.commit_delay.lock() = delay;
    }

    /// Queue an error to be returned by the next call of the given RPC
    pub fn inject_error(&self, rpc: Rpc, err: StoreError) {
        tracing::debug!("injecting {:?} fault: {}", rpc, err);
        self.inner
            .lock()
            .faults
            .entry(rpc)
            .or_default()
            .push_back(err);
    }

    /// Snapshot of the RPC log
    pub fn events(&self) -> Vec<RpcEvent> {
        self.inner.lock().events.clone()
    }

    /// Snapshot read at `read_ts`
    pub fn get(&self, table_id: TableId, key: &[u8], read_ts: u64) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        inner
            .keys
            .get(&(table_id, key.to_vec()))
            .and_then(|state| state.visible(read_ts))
            .map(|v| v.to_vec())
    }

    /// Number of live pessimistic locks owned by `start_ts`
    pub fn pessimistic_lock_count(&self, start_ts: u64) -> usize {
        let inner = self.inner.lock();
        inner
            .keys
            .values()
            .filter(|s| s.live_pess_lock().is_some_and(|l| l.start_ts == start_ts))
            .count()
    }

    /// Number of live prewrite intents owned by `start_ts`
    pub fn intent_count(&self, start_ts: u64) -> usize {
        let inner = self.inner.lock();
        inner
            .keys
            .values()
            .filter(|s| s.live_intent().is_some_and(|i| i.start_ts == start_ts))
            .count()
    }

    fn record(inner: &mut Inner, rpc: Rpc, keys: Vec<Key>) {
        inner.events.push(RpcEvent { rpc, keys });
    }

    fn take_fault(inner: &mut Inner, rpc: Rpc) -> Result<()> {
        if let Some(err) = inner.faults.get_mut(&rpc).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(())
    }

    fn check_prewrite(inner: &Inner, req: &PrewriteRequest, m: &Mutation) -> Result<()> {
        let read_ts = m
            .for_update_ts
            .or(req.for_update_ts)
            .unwrap_or(req.start_ts);
        let Some(state) = inner.keys.get(&(m.table_id, m.key.clone())) else {
            return Ok(());
        };

        if let Some(lock) = state.live_pess_lock()
            && lock.start_ts != req.start_ts
        {
            return Err(StoreError::WriteConflict {
                key: m.key.clone(),
                conflict_ts: lock.start_ts,
            });
        }
        if let Some(intent) = state.live_intent()
            && intent.start_ts != req.start_ts
        {
            return Err(StoreError::WriteConflict {
                key: m.key.clone(),
                conflict_ts: intent.start_ts,
            });
        }
        if let Some(commit_ts) = state.latest_commit_ts()
            && commit_ts > read_ts
        {
            return Err(StoreError::WriteConflict {
                key: m.key.clone(),
                conflict_ts: commit_ts,
            });
        }
        if matches!(m.op, Op::CheckNotExists | Op::PutIfAbsent) && state.visible(read_ts).is_some()
        {
            return Err(StoreError::DuplicateEntry { key: m.key.clone() });
        }
        Ok(())
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TxnStore for MemStore {
    async fn txn_prewrite(&self, req: PrewriteRequest) -> Result<()> {
        let delay = *self.prewrite_delay.lock();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock();
        Self::record(
            &mut inner,
            Rpc::Prewrite,
            req.mutations.iter().map(|m| m.key.clone()).collect(),
        );
        Self::take_fault(&mut inner, Rpc::Prewrite)?;

        // Validate the whole batch before writing any intent
        for m in &req.mutations {
            Self::check_prewrite(&inner, &req, m)?;
        }

        for m in &req.mutations {
            let state = inner.keys.entry((m.table_id, m.key.clone())).or_default();
            match m.op {
                // A pure existence check leaves no write behind
                Op::CheckNotExists => {}
                _ => {
                    state.intent = Some(Intent {
                        start_ts: req.start_ts,
                        op: m.op,
                        value: m.value.clone(),
                        ttl: req.lock_ttl,
                        since: Instant::now(),
                    });
                    // The prewrite supersedes this transaction's pessimistic lock
                    state.pess_lock = None;
                }
            }
        }
        Ok(())
    }

    async fn txn_commit(&self, req: CommitRequest) -> Result<bool> {
        {
            let mut inner = self.inner.lock();
            Self::record(
                &mut inner,
                Rpc::Commit,
                req.keys.iter().map(|k| k.key.clone()).collect(),
            );
        }
        let delay = *self.commit_delay.lock();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock();
        Self::take_fault(&mut inner, Rpc::Commit)?;

        let mut all_found = true;
        for addr in &req.keys {
            let Some(state) = inner.keys.get_mut(&(addr.table_id, addr.key.clone())) else {
                all_found = false;
                continue;
            };
            match state.intent.take_if(|i| i.start_ts == req.start_ts) {
                Some(intent) => {
                    match intent.op {
                        Op::Put | Op::PutIfAbsent => {
                            state.versions.insert(
                                req.commit_ts,
                                Version {
                                    op: Op::Put,
                                    value: intent.value,
                                    start_ts: req.start_ts,
                                },
                            );
                        }
                        Op::Delete => {
                            state.versions.insert(
                                req.commit_ts,
                                Version {
                                    op: Op::Delete,
                                    value: Vec::new(),
                                    start_ts: req.start_ts,
                                },
                            );
                        }
                        // Lock records release without writing a version
                        Op::Lock | Op::CheckNotExists => {}
                    }
                }
                None => {
                    // Already resolved by this transaction counts as committed
                    let resolved = state
                        .versions
                        .values()
                        .any(|v| v.start_ts == req.start_ts);
                    if !resolved {
                        all_found = false;
                    }
                }
            }
        }
        Ok(all_found)
    }

    async fn txn_pessimistic_lock(&self, req: PessimisticLockRequest) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            Self::record(
                &mut inner,
                Rpc::PessimisticLock,
                req.keys.iter().map(|k| k.key.clone()).collect(),
            );
            Self::take_fault(&mut inner, Rpc::PessimisticLock)?;
        }

        let deadline = Instant::now() + *self.lock_wait.lock();
        loop {
            {
                let mut inner = self.inner.lock();

                for addr in &req.keys {
                    if let Some(state) = inner.keys.get(&(addr.table_id, addr.key.clone()))
                        && let Some(commit_ts) = state.latest_commit_ts()
                        && commit_ts > req.for_update_ts
                    {
                        return Err(StoreError::WriteConflict {
                            key: addr.key.clone(),
                            conflict_ts: commit_ts,
                        });
                    }
                }

                let blocked = req.keys.iter().any(|addr| {
                    inner
                        .keys
                        .get(&(addr.table_id, addr.key.clone()))
                        .is_some_and(|s| s.blocked_for(req.start_ts))
                });

                if !blocked {
                    // All free: take every lock under the same guard
                    for addr in &req.keys {
                        let state = inner
                            .keys
                            .entry((addr.table_id, addr.key.clone()))
                            .or_default();
                        state.pess_lock = Some(PessLock {
                            start_ts: req.start_ts,
                            ttl: req.lock_ttl,
                            since: Instant::now(),
                        });
                    }
                    return Ok(());
                }
            }

            if Instant::now() >= deadline {
                return Err(StoreError::LockTimeout);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn txn_pessimistic_rollback(&self, req: PessimisticRollbackRequest) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::record(
            &mut inner,
            Rpc::PessimisticRollback,
            req.keys.iter().map(|k| k.key.clone()).collect(),
        );
        Self::take_fault(&mut inner, Rpc::PessimisticRollback)?;

        for addr in &req.keys {
            if let Some(state) = inner.keys.get_mut(&(addr.table_id, addr.key.clone())) {
                if state
                    .pess_lock
                    .as_ref()
                    .is_some_and(|l| l.start_ts == req.start_ts)
                {
                    state.pess_lock = None;
                }
            }
        }
        Ok(())
    }

    async fn txn_heartbeat(&self, req: HeartbeatRequest) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::record(&mut inner, Rpc::Heartbeat, vec![req.primary.key.clone()]);
        Self::take_fault(&mut inner, Rpc::Heartbeat)?;

        if let Some(state) = inner
            .keys
            .get_mut(&(req.primary.table_id, req.primary.key.clone()))
        {
            if let Some(lock) = state.pess_lock.as_mut()
                && lock.start_ts == req.start_ts
            {
                lock.ttl = req.new_ttl;
                lock.since = Instant::now();
            }
            if let Some(intent) = state.intent.as_mut()
                && intent.start_ts == req.start_ts
            {
                intent.ttl = req.new_ttl;
                intent.since = Instant::now();
            }
        }
        Ok(())
    }

    async fn txn_batch_rollback(&self, req: BatchRollbackRequest) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::record(
            &mut inner,
            Rpc::BatchRollback,
            req.keys.iter().map(|k| k.key.clone()).collect(),
        );
        Self::take_fault(&mut inner, Rpc::BatchRollback)?;

        for addr in &req.keys {
            if let Some(state) = inner.keys.get_mut(&(addr.table_id, addr.key.clone())) {
                if state
                    .intent
                    .as_ref()
                    .is_some_and(|i| i.start_ts == req.start_ts)
                {
                    state.intent = None;
                }
                if state
                    .pess_lock
                    .as_ref()
                    .is_some_and(|l| l.start_ts == req.start_ts)
                {
                    state.pess_lock = None;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KeyAddr, PartitionId};

    const TABLE: TableId = TableId(1);
    const PART: PartitionId = PartitionId(0);

    fn addr(key: &[u8]) -> KeyAddr {
        KeyAddr::new(TABLE, PART, key.to_vec())
    }

    fn put(key: &[u8], value: &[u8]) -> Mutation {
        Mutation::put(TABLE, key.to_vec(), value.to_vec())
    }

    fn prewrite_req(start_ts: u64, mutations: Vec<Mutation>) -> PrewriteRequest {
        let primary = mutations[0].addr();
        PrewriteRequest {
            start_ts,
            primary,
            mutations,
            lock_ttl: Duration::from_secs(3),
            for_update_ts: None,
        }
    }

    async fn commit_all(store: &MemStore, start_ts: u64, commit_ts: u64, keys: Vec<KeyAddr>) {
        let found = store
            .txn_commit(CommitRequest {
                start_ts,
                commit_ts,
                keys,
            })
            .await
            .unwrap();
        assert!(found);
    }

    #[tokio::test]
    async fn test_prewrite_commit_visibility() {
        let store = MemStore::new();

        store
            .txn_prewrite(prewrite_req(100, vec![put(b"a", b"1")]))
            .await
            .unwrap();
        commit_all(&store, 100, 150, vec![addr(b"a")]).await;

        assert_eq!(store.get(TABLE, b"a", 150), Some(b"1".to_vec()));
        assert_eq!(store.get(TABLE, b"a", 149), None);
    }

    #[tokio::test]
    async fn test_write_conflict_on_newer_commit() {
        let store = MemStore::new();

        store
            .txn_prewrite(prewrite_req(100, vec![put(b"a", b"1")]))
            .await
            .unwrap();
        commit_all(&store, 100, 110, vec![addr(b"a")]).await;

        // A transaction that started before the commit conflicts
        let err = store
            .txn_prewrite(prewrite_req(105, vec![put(b"a", b"2")]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::WriteConflict { conflict_ts: 110, .. }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_entry() {
        let store = MemStore::new();

        store
            .txn_prewrite(prewrite_req(100, vec![put(b"a", b"1")]))
            .await
            .unwrap();
        commit_all(&store, 100, 110, vec![addr(b"a")]).await;

        let err = store
            .txn_prewrite(prewrite_req(
                120,
                vec![Mutation::put_if_absent(TABLE, b"a".to_vec(), b"2".to_vec())],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEntry { .. }));

        // Deleted keys are free again
        store
            .txn_prewrite(prewrite_req(130, vec![Mutation::delete(TABLE, b"a".to_vec())]))
            .await
            .unwrap();
        commit_all(&store, 130, 140, vec![addr(b"a")]).await;
        store
            .txn_prewrite(prewrite_req(
                150,
                vec![Mutation::check_not_exists(TABLE, b"a".to_vec())],
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_commit_already_resolved() {
        let store = MemStore::new();

        store
            .txn_prewrite(prewrite_req(100, vec![put(b"a", b"1")]))
            .await
            .unwrap();
        commit_all(&store, 100, 150, vec![addr(b"a")]).await;

        // Second commit of the same key by the same transaction is a success
        commit_all(&store, 100, 150, vec![addr(b"a")]).await;

        // A transaction that never prewrote reports false
        let found = store
            .txn_commit(CommitRequest {
                start_ts: 300,
                commit_ts: 310,
                keys: vec![addr(b"zzz")],
            })
            .await
            .unwrap();
        assert!(!found);
    }

    #[tokio::test]
    async fn test_pessimistic_lock_wait_and_timeout() {
        let store = MemStore::new();
        store.set_lock_wait(Duration::from_millis(50));

        store
            .txn_pessimistic_lock(PessimisticLockRequest {
                start_ts: 100,
                for_update_ts: 100,
                keys: vec![addr(b"a")],
                lock_ttl: Duration::from_secs(3),
            })
            .await
            .unwrap();

        let err = store
            .txn_pessimistic_lock(PessimisticLockRequest {
                start_ts: 200,
                for_update_ts: 200,
                keys: vec![addr(b"a")],
                lock_ttl: Duration::from_secs(3),
            })
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::LockTimeout);

        // Releasing unblocks the next waiter
        store
            .txn_pessimistic_rollback(PessimisticRollbackRequest {
                start_ts: 100,
                for_update_ts: 100,
                keys: vec![addr(b"a")],
            })
            .await
            .unwrap();
        store
            .txn_pessimistic_lock(PessimisticLockRequest {
                start_ts: 200,
                for_update_ts: 200,
                keys: vec![addr(b"a")],
                lock_ttl: Duration::from_secs(3),
            })
            .await
            .unwrap();
        assert_eq!(store.pessimistic_lock_count(200), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_extends_ttl() {
        let store = MemStore::new();

        store
            .txn_pessimistic_lock(PessimisticLockRequest {
                start_ts: 100,
                for_update_ts: 100,
                keys: vec![addr(b"a")],
                lock_ttl: Duration::from_millis(40),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(25)).await;
        store
            .txn_heartbeat(HeartbeatRequest {
                start_ts: 100,
                primary: addr(b"a"),
                new_ttl: Duration::from_millis(40),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;

        // Without the heartbeat the lock would have expired by now
        assert_eq!(store.pessimistic_lock_count(100), 1);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemStore::new();
        store.inject_error(Rpc::Commit, StoreError::RegionSplit);

        store
            .txn_prewrite(prewrite_req(100, vec![put(b"a", b"1")]))
            .await
            .unwrap();

        let err = store
            .txn_commit(CommitRequest {
                start_ts: 100,
                commit_ts: 150,
                keys: vec![addr(b"a")],
            })
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::RegionSplit);

        // The injected error is consumed; the retry succeeds
        commit_all(&store, 100, 150, vec![addr(b"a")]).await;
        assert_eq!(store.events().iter().filter(|e| e.rpc == Rpc::Commit).count(), 2);
    }

    #[tokio::test]
    async fn test_batch_rollback_clears_intents() {
        let store = MemStore::new();

        store
            .txn_prewrite(prewrite_req(100, vec![put(b"a", b"1"), put(b"b", b"2")]))
            .await
            .unwrap();
        assert_eq!(store.intent_count(100), 2);

        store
            .txn_batch_rollback(BatchRollbackRequest {
                start_ts: 100,
                keys: vec![addr(b"a"), addr(b"b")],
            })
            .await
            .unwrap();
        assert_eq!(store.intent_count(100), 0);
        assert_eq!(store.get(TABLE, b"a", u64::MAX), None);
    }
}
