//! Transaction environment, registries and the kill surface
//!
//! `TxnEnv` is the long-lived value everything else hangs off: store and
//! router handles, the timestamp oracle, the task pools, the table-lock
//! manager, and the two process-wide registries (transactions and
//! connections). It is passed to constructors instead of living in a global
//! so tests can run environments side by side.
//!
//! Connections hold their current transaction weakly and transactions carry
//! only the owning connection id, so dropping either side never leaks the
//! other.

use crate::error::{TxnError, TxnResult};
use crate::pool::TaskPool;
use crate::table_lock::{TableLockKind, TableLockManager, TableLockRequest};
use crate::transaction::{Transaction, TxnKind};
use dashmap::DashMap;
use meridian_common::{ConfigError, TxnConfig, TxnId, TxnMode};
use meridian_store::{PartitionRouter, TableId, TxnStore};
use meridian_tso::Tso;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Cancellable handle of one in-flight statement
pub struct StatementHandle {
    id: Uuid,
    cancelled: AtomicBool,
}

impl StatementHandle {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::now_v7(),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// One client connection: session config, in-flight statements, and a weak
/// reference to the current transaction
pub struct Connection {
    id: u64,
    config: Mutex<TxnConfig>,
    statements: DashMap<Uuid, Arc<StatementHandle>>,
    current_txn: Mutex<Weak<Transaction>>,
}

impl Connection {
    fn new(id: u64, config: TxnConfig) -> Arc<Self> {
        Arc::new(Self {
            id,
            config: Mutex::new(config),
            statements: DashMap::new(),
            current_txn: Mutex::new(Weak::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> TxnConfig {
        self.config.lock().clone()
    }

    /// Apply session variables to this connection's config
    pub fn apply_session_vars(&self, vars: &HashMap<String, String>) -> Result<(), ConfigError> {
        self.config.lock().apply_session_vars(vars)
    }

    /// Register an in-flight statement so kill-query can reach it
    pub fn start_statement(&self) -> Arc<StatementHandle> {
        let stmt = StatementHandle::new();
        self.statements.insert(stmt.id(), stmt.clone());
        stmt
    }

    pub fn finish_statement(&self, id: Uuid) {
        self.statements.remove(&id);
    }

    pub fn current_txn(&self) -> Option<Arc<Transaction>> {
        self.current_txn.lock().upgrade()
    }

    fn set_current_txn(&self, txn: &Arc<Transaction>) {
        *self.current_txn.lock() = Arc::downgrade(txn);
    }
}

/// The coordinator environment
pub struct TxnEnv {
    server_id: u64,
    seq: AtomicU64,
    store: Arc<dyn TxnStore>,
    router: Arc<dyn PartitionRouter>,
    tso: Arc<Tso>,
    default_config: TxnConfig,
    commit_pool: TaskPool,
    cleanup_pool: TaskPool,
    table_locks: TableLockManager,
    txns: DashMap<TxnId, Arc<Transaction>>,
    connections: DashMap<u64, Arc<Connection>>,
}

impl TxnEnv {
    pub fn new(
        server_id: u64,
        store: Arc<dyn TxnStore>,
        router: Arc<dyn PartitionRouter>,
    ) -> Arc<Self> {
        Self::with_config(server_id, store, router, TxnConfig::default())
    }

    pub fn with_config(
        server_id: u64,
        store: Arc<dyn TxnStore>,
        router: Arc<dyn PartitionRouter>,
        default_config: TxnConfig,
    ) -> Arc<Self> {
        let tso = Arc::new(Tso::new());
        Arc::new(Self {
            server_id,
            seq: AtomicU64::new(0),
            store,
            router,
            tso: tso.clone(),
            default_config,
            commit_pool: TaskPool::new("txn-commit", 16),
            cleanup_pool: TaskPool::new("txn-cleanup", 4),
            table_locks: TableLockManager::new(tso),
            txns: DashMap::new(),
            connections: DashMap::new(),
        })
    }

    pub fn server_id(&self) -> u64 {
        self.server_id
    }

    pub fn tso(&self) -> &Arc<Tso> {
        &self.tso
    }

    pub fn store(&self) -> &Arc<dyn TxnStore> {
        &self.store
    }

    pub fn table_locks(&self) -> &TableLockManager {
        &self.table_locks
    }

    /// Get or create the connection with the given id
    pub fn connection(&self, conn_id: u64) -> Arc<Connection> {
        self.connections
            .entry(conn_id)
            .or_insert_with(|| Connection::new(conn_id, self.default_config.clone()))
            .value()
            .clone()
    }

    /// Begin a transaction using the connection's session config
    pub fn begin(self: &Arc<Self>, conn_id: u64, auto_commit: bool) -> Arc<Transaction> {
        let config = self.connection(conn_id).config();
        self.begin_with(conn_id, config, auto_commit)
    }

    /// Begin a transaction with an explicit config
    pub fn begin_with(
        self: &Arc<Self>,
        conn_id: u64,
        config: TxnConfig,
        auto_commit: bool,
    ) -> Arc<Transaction> {
        let kind = match config.mode {
            TxnMode::Optimistic => TxnKind::Optimistic,
            TxnMode::Pessimistic => TxnKind::Pessimistic(Default::default()),
        };
        self.begin_kind(conn_id, kind, config, auto_commit)
    }

    /// Begin a non-transactional session handle
    pub fn begin_none(self: &Arc<Self>, conn_id: u64) -> Arc<Transaction> {
        self.begin_kind(conn_id, TxnKind::None, self.default_config.clone(), true)
    }

    fn begin_kind(
        self: &Arc<Self>,
        conn_id: u64,
        kind: TxnKind,
        config: TxnConfig,
        auto_commit: bool,
    ) -> Arc<Transaction> {
        let start_ts = self.tso.now();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let id = TxnId::new(self.server_id, start_ts, seq);
        let txn = Transaction::new(
            id,
            conn_id,
            kind,
            config,
            auto_commit,
            Arc::downgrade(self),
            self.store.clone(),
            self.router.clone(),
            self.tso.clone(),
            self.commit_pool.clone(),
            self.cleanup_pool.clone(),
        );
        self.txns.insert(id, txn.clone());
        self.connection(conn_id).set_current_txn(&txn);
        tracing::info!("{} {} registered", id, txn.kind_label());
        txn
    }

    pub fn get_txn(&self, id: TxnId) -> Option<Arc<Transaction>> {
        self.txns.get(&id).map(|t| t.value().clone())
    }

    pub fn txn_count(&self) -> usize {
        self.txns.len()
    }

    pub(crate) fn unregister(&self, id: TxnId) {
        self.txns.remove(&id);
        tracing::info!("{} unregistered", id);
    }

    /// Cancel every in-flight statement on a connection. The transaction
    /// observes the cancellation through its attached statement.
    pub fn kill_query(&self, conn_id: u64) {
        let Some(conn) = self.connections.get(&conn_id) else {
            return;
        };
        let mut killed = 0;
        for stmt in conn.statements.iter() {
            stmt.cancel();
            killed += 1;
        }
        tracing::info!("kill query on connection {}: {} statements", conn_id, killed);
    }

    /// Kill a connection: cancel its statements and its transaction, and
    /// wake anything waiting on the transaction's finished future.
    pub fn kill_connection(&self, conn_id: u64) {
        self.kill_query(conn_id);
        let txn = self
            .connections
            .get(&conn_id)
            .and_then(|conn| conn.current_txn());
        if let Some(txn) = txn {
            txn.cancel();
            txn.complete_finished();
            tracing::info!("kill connection {}: cancelled {}", conn_id, txn.id());
        }
    }

    /// Broadcast cancel to every registered transaction
    pub fn cancel_all(&self) {
        for entry in self.txns.iter() {
            entry.value().cancel();
        }
        tracing::info!("cancel broadcast to {} transactions", self.txns.len());
    }

    /// Take a table lock on behalf of a transaction.
    ///
    /// The lock's release is wired to the transaction's finished future, so
    /// commit, rollback, cancel and connection drop all release it. The wait
    /// is bounded by the session's lock wait timeout.
    pub async fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        table_id: TableId,
        kind: TableLockKind,
    ) -> TxnResult<()> {
        let (req, handle) = TableLockRequest::new(table_id, txn.start_ts(), kind);
        self.table_locks.lock(req);

        let mut finished = txn.finished();
        let released = handle.released;
        let (wiring_tx, wiring_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::select! {
                _ = finished.wait_for(|done| *done) => {}
                _ = wiring_rx => {}
            }
            // Dropping the sender releases the table lock
            drop(released);
        });

        match tokio::time::timeout(txn.lock_timeout(), handle.granted).await {
            Ok(Ok(())) => {
                txn.hold_lock_wiring(wiring_tx);
                Ok(())
            }
            Ok(Err(_)) => Err(TxnError::State(format!(
                "{} table lock request dropped by the manager",
                txn.id()
            ))),
            Err(_) => {
                // Abandon the wiring; if the lock is granted later it is
                // released immediately
                drop(wiring_tx);
                tracing::warn!("{} table lock wait on {} timed out", txn.id(), table_id);
                Err(TxnError::LockWaitTimeout)
            }
        }
    }
}
