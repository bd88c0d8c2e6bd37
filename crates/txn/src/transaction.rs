//! Transaction core and two-phase commit driver
//!
//! A `Transaction` is the shared core plus a kind tag: `None` for
//! non-transactional sessions, `Optimistic`, or `Pessimistic` with its lock
//! bookkeeping. Kind-specific behavior lives in free functions in the
//! `optimistic` and `pessimistic` modules; the commit state machine here is
//! common to both.
//!
//! Every public operation serializes on the transaction's async mutex, so a
//! transaction is only ever driven by one caller at a time. The cancel flag
//! and the heartbeat run outside that mutex and touch only atomics and
//! immutable fields.

use crate::cache::TxnCache;
use crate::error::{TxnError, TxnResult};
use crate::heartbeat;
use crate::optimistic::{self, PrewriteOutcome};
use crate::pessimistic;
use crate::pool::TaskPool;
use crate::profile::CommitProfile;
use crate::registry::{StatementHandle, TxnEnv};
use crate::retry::{self, RetryDecision};
use crate::state::TxnStatus;
use dashmap::DashMap;
use meridian_common::{IsolationLevel, TxnConfig, TxnId};
use meridian_store::{
    BatchRollbackRequest, Key, KeyAddr, Mutation, PartitionId, PartitionRouter, PrimaryKey,
    TableId, TxnStore,
};
use meridian_tso::Tso;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Message sent to cross-node participants of a transaction
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PeerMessage {
    /// The owning coordinator cancelled the transaction
    Cancelled(TxnId),
    /// The transaction closed
    Finished(TxnId),
}

/// Pessimistic lock bookkeeping
#[derive(Default)]
pub struct PessState {
    /// Locks acquired by executed statements, with their statement ts
    pub(crate) acquired: Mutex<Vec<(KeyAddr, u64)>>,
    pub(crate) primary_locked: AtomicBool,
}

/// Transaction kind tag
pub enum TxnKind {
    /// Non-transactional session; commit and rollback are no-ops
    None,
    Optimistic,
    Pessimistic(PessState),
}

/// A client-side distributed transaction
pub struct Transaction {
    pub(crate) id: TxnId,
    conn_id: u64,
    kind: TxnKind,
    config: TxnConfig,
    isolation: IsolationLevel,
    auto_commit: bool,
    start_ts: u64,
    for_update_ts: AtomicU64,
    commit_ts: AtomicU64,
    status: Mutex<TxnStatus>,
    cancelled: AtomicBool,
    closed: AtomicBool,
    cross_node: AtomicBool,
    primary: Mutex<Option<PrimaryKey>>,
    cache: Mutex<TxnCache>,
    sql_list: Mutex<Vec<String>>,
    current_stmt: Mutex<Option<Arc<StatementHandle>>>,
    peers: DashMap<u64, mpsc::UnboundedSender<PeerMessage>>,
    finished: watch::Sender<bool>,
    lock_wirings: Mutex<Vec<tokio::sync::oneshot::Sender<()>>>,
    commit_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    profile: Mutex<CommitProfile>,
    /// Serializes commit, rollback and close
    op_lock: tokio::sync::Mutex<()>,
    env: Weak<TxnEnv>,
    store: Arc<dyn TxnStore>,
    router: Arc<dyn PartitionRouter>,
    tso: Arc<Tso>,
    commit_pool: TaskPool,
    cleanup_pool: TaskPool,
}

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: TxnId,
        conn_id: u64,
        kind: TxnKind,
        config: TxnConfig,
        auto_commit: bool,
        env: Weak<TxnEnv>,
        store: Arc<dyn TxnStore>,
        router: Arc<dyn PartitionRouter>,
        tso: Arc<Tso>,
        commit_pool: TaskPool,
        cleanup_pool: TaskPool,
    ) -> Arc<Self> {
        let (finished, _) = watch::channel(false);
        let isolation = config.isolation;
        Arc::new(Self {
            id,
            conn_id,
            kind,
            isolation,
            auto_commit,
            start_ts: id.start_ts,
            for_update_ts: AtomicU64::new(id.start_ts),
            commit_ts: AtomicU64::new(0),
            status: Mutex::new(TxnStatus::Start),
            cancelled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cross_node: AtomicBool::new(false),
            primary: Mutex::new(None),
            cache: Mutex::new(TxnCache::new()),
            sql_list: Mutex::new(Vec::new()),
            current_stmt: Mutex::new(None),
            peers: DashMap::new(),
            finished,
            lock_wirings: Mutex::new(Vec::new()),
            commit_task: Mutex::new(None),
            heartbeat_task: Mutex::new(None),
            profile: Mutex::new(CommitProfile::default()),
            op_lock: tokio::sync::Mutex::new(()),
            env,
            store,
            router,
            tso,
            commit_pool,
            cleanup_pool,
            config,
        })
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    /// Commit timestamp; zero until the commit phase assigns one
    pub fn commit_ts(&self) -> u64 {
        self.commit_ts.load(Ordering::SeqCst)
    }

    pub fn for_update_ts(&self) -> u64 {
        self.for_update_ts.load(Ordering::SeqCst)
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub fn status(&self) -> TxnStatus {
        *self.status.lock()
    }

    pub fn is_pessimistic(&self) -> bool {
        matches!(self.kind, TxnKind::Pessimistic(_))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_cross_node(&self) -> bool {
        self.cross_node.load(Ordering::SeqCst)
    }

    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            TxnKind::None => "None",
            TxnKind::Optimistic => "OptimisticTransaction",
            TxnKind::Pessimistic(_) => "PessimisticTransaction",
        }
    }

    /// Deadline shared by table-lock waits and commit retry loops
    pub fn lock_timeout(&self) -> Duration {
        self.config.lock_wait_timeout
    }

    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    pub fn add_sql(&self, sql: &str) {
        self.sql_list.lock().push(sql.to_string());
    }

    pub fn sql_list(&self) -> Vec<String> {
        self.sql_list.lock().clone()
    }

    /// Completes when the transaction closes, on every exit path
    pub fn finished(&self) -> watch::Receiver<bool> {
        self.finished.subscribe()
    }

    pub(crate) fn complete_finished(&self) {
        let _ = self.finished.send(true);
    }

    /// Register a channel to a cross-node participant
    pub fn register_peer(&self, server_id: u64, channel: mpsc::UnboundedSender<PeerMessage>) {
        self.peers.insert(server_id, channel);
        self.cross_node.store(true, Ordering::SeqCst);
        tracing::info!("{} registered cross-node peer {}", self.id, server_id);
    }

    fn notify_peers(&self, message: PeerMessage) {
        for entry in self.peers.iter() {
            let _ = entry.value().send(message.clone());
        }
    }

    /// Set the cancel flag. Observed at the next phase checkpoint; in-flight
    /// RPCs are not interrupted.
    pub fn cancel(&self) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::info!("{} {} cancel flag set", self.id, self.kind_label());
            self.notify_peers(PeerMessage::Cancelled(self.id));
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self
                .current_stmt
                .lock()
                .as_ref()
                .is_some_and(|s| s.is_cancelled())
    }

    pub(crate) fn check_continue(&self) -> TxnResult<()> {
        if self.is_cancelled() {
            tracing::info!("{} {} has been cancelled", self.id, self.kind_label());
            return Err(TxnError::Cancelled(self.id));
        }
        Ok(())
    }

    /// Attach the statement currently driving this transaction; kill-query
    /// cancellation is polled through it.
    pub fn attach_statement(&self, stmt: Arc<StatementHandle>) {
        *self.current_stmt.lock() = Some(stmt);
    }

    pub(crate) fn set_status(&self, next: TxnStatus) {
        let mut status = self.status.lock();
        if !status.can_transition_to(next) {
            tracing::error!("{} illegal status transition {} -> {}", self.id, *status, next);
        }
        *status = next;
    }

    pub(crate) fn cache(&self) -> MutexGuard<'_, TxnCache> {
        self.cache.lock()
    }

    pub(crate) fn profile(&self) -> MutexGuard<'_, CommitProfile> {
        self.profile.lock()
    }

    pub(crate) fn store(&self) -> &Arc<dyn TxnStore> {
        &self.store
    }

    pub(crate) fn router(&self) -> &Arc<dyn PartitionRouter> {
        &self.router
    }

    pub(crate) fn tso(&self) -> &Arc<Tso> {
        &self.tso
    }

    pub fn primary(&self) -> Option<PrimaryKey> {
        self.primary.lock().clone()
    }

    pub(crate) fn set_primary(&self, primary: PrimaryKey) {
        *self.primary.lock() = Some(primary);
    }

    pub(crate) fn clear_primary(&self) {
        *self.primary.lock() = None;
    }

    pub(crate) fn update_primary_partition(&self, partition: PartitionId) {
        if let Some(primary) = self.primary.lock().as_mut() {
            primary.partition_id = partition;
        }
    }

    pub(crate) fn advance_for_update_ts(&self, ts: u64) {
        self.for_update_ts.fetch_max(ts, Ordering::SeqCst);
    }

    pub(crate) fn refresh_commit_ts(&self, min_commit_ts: u64) {
        let fresh = self.tso.now().max(min_commit_ts + 1);
        self.commit_ts.store(fresh, Ordering::SeqCst);
    }

    pub(crate) fn start_heartbeat(&self, primary: KeyAddr) {
        let handle = heartbeat::start(
            self.store.clone(),
            self.id,
            primary,
            self.start_ts,
            self.config.lock_ttl,
        );
        *self.heartbeat_task.lock() = Some(handle);
    }

    pub(crate) fn abort_heartbeat(&self) {
        if let Some(task) = self.heartbeat_task.lock().take() {
            task.abort();
        }
    }

    /// Keep a table-lock release wiring alive for the transaction's lifetime
    pub(crate) fn hold_lock_wiring(&self, wiring: tokio::sync::oneshot::Sender<()>) {
        self.lock_wirings.lock().push(wiring);
    }

    /// Buffer the mutations of one DML statement.
    ///
    /// Pessimistic transactions advance `for_update_ts` and lock the rows
    /// before buffering; the first write also locks the primary key and
    /// starts the lock heartbeat.
    pub async fn dml(
        &self,
        stmt: &Arc<StatementHandle>,
        sql: &str,
        mutations: Vec<Mutation>,
    ) -> TxnResult<()> {
        self.attach_statement(stmt.clone());
        if self.is_closed() || self.status() != TxnStatus::Start {
            return Err(TxnError::State(format!(
                "{} cannot execute DML in status {}",
                self.id,
                self.status()
            )));
        }
        self.check_continue()?;
        self.add_sql(sql);
        if mutations.is_empty() {
            return Ok(());
        }
        match &self.kind {
            TxnKind::None => Err(TxnError::State(format!(
                "{} is not a transactional session",
                self.id
            ))),
            TxnKind::Optimistic => {
                let mut cache = self.cache.lock();
                for mut m in mutations {
                    m.partition_id = self.router.resolve(m.table_id, &m.key);
                    cache.merge(m);
                }
                Ok(())
            }
            TxnKind::Pessimistic(state) => pessimistic::execute_dml(self, state, mutations).await,
        }
    }

    /// Lock rows read by a SELECT ... FOR UPDATE without writing them.
    ///
    /// Locks not later covered by a write are residual and are rolled back
    /// before commit.
    pub async fn select_for_update(
        &self,
        stmt: &Arc<StatementHandle>,
        sql: &str,
        keys: Vec<(TableId, Key)>,
    ) -> TxnResult<()> {
        self.attach_statement(stmt.clone());
        if self.is_closed() || self.status() != TxnStatus::Start {
            return Err(TxnError::State(format!(
                "{} cannot lock rows in status {}",
                self.id,
                self.status()
            )));
        }
        self.check_continue()?;
        self.add_sql(sql);
        match &self.kind {
            TxnKind::Pessimistic(state) => pessimistic::lock_for_select(self, state, keys).await,
            _ => Err(TxnError::State(format!(
                "{} select for update requires a pessimistic transaction",
                self.id
            ))),
        }
    }

    /// Drive the two-phase commit.
    ///
    /// Phase order: prewrite primary, prewrite secondaries by partition,
    /// residual pessimistic rollback, commit primary, then asynchronous
    /// secondary commit on the commit pool. The call returns success once
    /// the primary commit RPC succeeds; secondaries are awaited unless the
    /// transaction was cancelled meanwhile.
    pub async fn commit(self: &Arc<Self>) -> TxnResult<()> {
        let _op = self.op_lock.lock().await;
        if self.is_closed() {
            return Ok(());
        }
        if matches!(self.kind, TxnKind::None) {
            return Ok(());
        }
        tracing::info!("{} {} start commit", self.id, self.kind_label());
        {
            let status = *self.status.lock();
            if status != TxnStatus::Start {
                return Err(TxnError::State(format!(
                    "{} {} commit is unavailable in status {}",
                    self.id,
                    self.kind_label(),
                    status
                )));
            }
        }
        self.profile.lock().start();
        if self.is_cancelled() {
            self.set_status(TxnStatus::Cancel);
            if let Err(e) = self.rollback_inner().await {
                tracing::error!("{} rollback after cancel failed: {}", self.id, e);
            }
            return Err(TxnError::Cancelled(self.id));
        }
        if self.sql_list.lock().is_empty() || !self.cache.lock().check_continue() {
            tracing::warn!("{} {} has no data to commit", self.id, self.kind_label());
            if let TxnKind::Pessimistic(state) = &self.kind {
                pessimistic::rollback_residual_locks(self, state).await;
            }
            return Ok(());
        }

        // Phase 1: prewrite
        let commit_start = Instant::now();
        self.set_status(TxnStatus::PreWriteStart);
        let prewrite_result = optimistic::run_prewrite(self).await;
        tracing::info!(
            "{} prewrite end, status {}, cost {:?}",
            self.id,
            self.status(),
            commit_start.elapsed()
        );
        match prewrite_result {
            Ok(PrewriteOutcome::PrimaryCheckNotExists) => return Ok(()),
            Ok(PrewriteOutcome::Done) => {}
            Err(e) => return self.fail_prewrite(e).await,
        }

        if let TxnKind::Pessimistic(state) = &self.kind {
            pessimistic::rollback_residual_locks(self, state).await;
        }

        // Phase 2: commit
        if self.is_cancelled() {
            tracing::info!("{} cancelled before commit primary key", self.id);
            self.set_status(TxnStatus::Cancel);
            if let Err(e) = self.rollback_inner().await {
                tracing::error!("{} rollback after cancel failed: {}", self.id, e);
            }
            return Err(TxnError::Cancelled(self.id));
        }
        tracing::info!("{} start commit primary key", self.id);
        self.commit_ts.store(self.tso.now(), Ordering::SeqCst);
        let committed = optimistic::commit_primary_key(self).await;
        self.profile.lock().end_commit_primary();
        if !committed {
            let commit_ts = self.commit_ts();
            self.set_status(TxnStatus::CommitFail);
            if let Err(e) = self.rollback_inner().await {
                tracing::error!(
                    "{} rollback after failed primary commit failed: {}",
                    self.id,
                    e
                );
            }
            return Err(TxnError::CommitPrimaryFailed {
                txn_id: self.id,
                commit_ts,
            });
        }
        self.set_status(TxnStatus::CommitPrimaryKey);
        tracing::info!("{} commit primary key end", self.id);

        // The commit decision is durable; secondaries go to the commit pool
        let task = self
            .commit_pool
            .spawn(optimistic::commit_secondaries(self.clone()));
        *self.commit_task.lock() = Some(task);

        if self.is_cancelled() {
            tracing::warn!(
                "{} cancelled after primary commit; secondaries resolve via the primary",
                self.id
            );
        } else {
            let task = self.commit_task.lock().take();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    tracing::error!("{} secondary commit task failed: {}", self.id, e);
                }
            }
            self.profile.lock().end_commit_secondary();
        }
        self.set_status(TxnStatus::Commit);
        tracing::info!(
            "{} commit end, status {}, cost {:?}",
            self.id,
            self.status(),
            commit_start.elapsed()
        );
        Ok(())
    }

    async fn fail_prewrite(self: &Arc<Self>, err: TxnError) -> TxnResult<()> {
        tracing::error!("{} prewrite failed: {}", self.id, err);
        match &err {
            TxnError::Cancelled(_) => self.set_status(TxnStatus::Cancel),
            TxnError::WriteConflict { .. } => {
                self.set_status(TxnStatus::PreWriteFail);
                match retry::write_conflict_decision(
                    self.auto_commit,
                    self.is_pessimistic(),
                    &self.config,
                ) {
                    RetryDecision::RetryStatement => tracing::warn!(
                        "{} write conflict; statement is eligible for re-planning with a fresh start ts",
                        self.id
                    ),
                    RetryDecision::Abort => {}
                }
            }
            _ => self.set_status(TxnStatus::PreWriteFail),
        }
        if let Err(e) = self.rollback_inner().await {
            tracing::error!("{} rollback after failed prewrite failed: {}", self.id, e);
        }
        Err(err)
    }

    /// Roll the transaction back.
    ///
    /// Idempotent: once the transaction reaches `Rollback` or `Close`,
    /// further calls are no-ops and never raise.
    pub async fn rollback(self: &Arc<Self>) -> TxnResult<()> {
        let _op = self.op_lock.lock().await;
        self.rollback_inner().await
    }

    async fn rollback_inner(&self) -> TxnResult<()> {
        if matches!(self.kind, TxnKind::None) {
            return Ok(());
        }
        let status = self.status();
        if self.is_closed() || matches!(status, TxnStatus::Rollback | TxnStatus::Close) {
            return Ok(());
        }
        if status == TxnStatus::Commit {
            tracing::warn!("{} already committed, nothing to roll back", self.id);
            return Ok(());
        }
        // Pessimistic locks are released on every abort path
        if let TxnKind::Pessimistic(state) = &self.kind {
            pessimistic::rollback_all_locks(self, state).await;
        }
        if status == TxnStatus::Start {
            tracing::warn!("{} status is START, no data to roll back", self.id);
            return Ok(());
        }
        if self.sql_list.lock().is_empty() || !self.cache.lock().check_continue() {
            tracing::warn!("{} has no data to roll back", self.id);
            return Ok(());
        }
        let started = Instant::now();
        tracing::info!("{} rollback start", self.id);
        let keys = self.cache.lock().write_keys();
        let req = BatchRollbackRequest {
            start_ts: self.start_ts,
            keys,
        };
        match self.store.txn_batch_rollback(req).await {
            Ok(()) => {
                self.set_status(TxnStatus::Rollback);
                tracing::info!(
                    "{} rollback end, status {}, cost {:?}",
                    self.id,
                    self.status(),
                    started.elapsed()
                );
                Ok(())
            }
            Err(e) => {
                self.set_status(TxnStatus::RollbackFail);
                tracing::error!("{} rollback failed: {}", self.id, e);
                Err(e.into())
            }
        }
    }

    /// Close the transaction: run cleanup, unregister, and mark `Close`.
    ///
    /// Always completes the finished future first, releasing any table-lock
    /// waiters wired to this transaction.
    pub async fn close(self: &Arc<Self>) {
        let _op = self.op_lock.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.clean_up();
        if let Some(env) = self.env.upgrade() {
            env.unregister(self.id);
        }
        self.set_status(TxnStatus::Close);
        tracing::info!("{} {} closed", self.id, self.kind_label());
    }

    fn clean_up(self: &Arc<Self>) {
        if let Some(task) = self.heartbeat_task.lock().take() {
            task.abort();
            tracing::info!("{} heartbeat stopped", self.id);
        }
        self.complete_finished();
        self.notify_peers(PeerMessage::Finished(self.id));
        if matches!(self.kind, TxnKind::None) {
            return;
        }
        let pessimistic = self.is_pessimistic();
        if self.sql_list.lock().is_empty()
            || !self.cache.lock().check_clean_continue(pessimistic)
        {
            tracing::warn!("{} {} has no data to clean up", self.id, self.kind_label());
            return;
        }
        let txn = self.clone();
        self.cleanup_pool.spawn(async move {
            // Cleanup waits for the secondary commit before dropping the cache
            let task = txn.commit_task.lock().take();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    tracing::error!("{} secondary commit task failed: {}", txn.id, e);
                }
            }
            let dropped = {
                let mut cache = txn.cache.lock();
                let count = cache.len();
                cache.clear();
                count
            };
            let mut profile = txn.profile.lock();
            profile.end_clean();
            profile.log(&txn.id);
            tracing::debug!("{} cleanup dropped {} buffered mutations", txn.id, dropped);
        });
    }
}
