//! Per-table lock waiter
//!
//! Serializes DDL against running DML: row locks are mutually compatible,
//! table locks are exclusive. Waiters queue per table in FIFO order, with
//! one exception: a row request may overtake a blocked table request while
//! that table request is still behind a held row lock that was enqueued
//! before it. New readers can batch with the readers that blocked the
//! writer, but once those drain the writer goes next.
//!
//! A request carries two oneshot channels: the waiter keeps `granted`, the
//! manager keeps `released`. Dropping the release sender also releases, so
//! a lock cannot outlive its holder on any exit path.

use meridian_store::TableId;
use meridian_tso::Tso;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Lock granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableLockKind {
    /// Compatible with other row locks
    Row,
    /// Exclusive
    Table,
}

/// A lock request handed to the manager
pub struct TableLockRequest {
    pub table_id: TableId,
    pub lock_ts: u64,
    pub kind: TableLockKind,
    granted: oneshot::Sender<()>,
    released: oneshot::Receiver<()>,
}

/// The waiter's side of a request
pub struct TableLockHandle {
    /// Resolves when the lock is granted
    pub granted: oneshot::Receiver<()>,
    /// Send (or drop) to release the lock
    pub released: oneshot::Sender<()>,
}

impl TableLockRequest {
    pub fn new(table_id: TableId, lock_ts: u64, kind: TableLockKind) -> (Self, TableLockHandle) {
        let (granted_tx, granted_rx) = oneshot::channel();
        let (released_tx, released_rx) = oneshot::channel();
        (
            Self {
                table_id,
                lock_ts,
                kind,
                granted: granted_tx,
                released: released_rx,
            },
            TableLockHandle {
                granted: granted_rx,
                released: released_tx,
            },
        )
    }
}

struct Holder {
    seq: u64,
    kind: TableLockKind,
    lock_ts: u64,
    current_ts: u64,
}

struct Waiter {
    seq: u64,
    kind: TableLockKind,
    lock_ts: u64,
    granted: oneshot::Sender<()>,
    released: oneshot::Receiver<()>,
}

#[derive(Default)]
struct TableQueue {
    next_seq: u64,
    holders: Vec<Holder>,
    waiters: VecDeque<Waiter>,
}

impl TableQueue {
    fn admits(&self, kind: TableLockKind) -> bool {
        match kind {
            TableLockKind::Row => self.holders.iter().all(|h| h.kind == TableLockKind::Row),
            TableLockKind::Table => self.holders.is_empty(),
        }
    }

    /// Whether a waiter with `seq` is still behind a held row lock
    fn behind_held_row(&self, seq: u64) -> bool {
        self.holders
            .iter()
            .any(|h| h.kind == TableLockKind::Row && h.seq < seq)
    }
}

/// Shared per-table lock manager
#[derive(Clone)]
pub struct TableLockManager {
    tables: Arc<Mutex<HashMap<TableId, TableQueue>>>,
    tso: Arc<Tso>,
}

impl TableLockManager {
    pub fn new(tso: Arc<Tso>) -> Self {
        Self {
            tables: Arc::new(Mutex::new(HashMap::new())),
            tso,
        }
    }

    /// Enqueue a request; the caller awaits its handle's `granted` future
    pub fn lock(&self, req: TableLockRequest) {
        let mut tables = self.tables.lock();
        let queue = tables.entry(req.table_id).or_default();

        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.waiters.push_back(Waiter {
            seq,
            kind: req.kind,
            lock_ts: req.lock_ts,
            granted: req.granted,
            released: req.released,
        });

        self.pump(req.table_id, queue);
    }

    /// Current holders as (lock-ts, grant-ts, kind)
    pub fn holders(&self, table_id: TableId) -> Vec<(u64, u64, TableLockKind)> {
        let tables = self.tables.lock();
        tables
            .get(&table_id)
            .map(|q| {
                q.holders
                    .iter()
                    .map(|h| (h.lock_ts, h.current_ts, h.kind))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn waiter_count(&self, table_id: TableId) -> usize {
        let tables = self.tables.lock();
        tables.get(&table_id).map_or(0, |q| q.waiters.len())
    }

    fn pump(&self, table_id: TableId, queue: &mut TableQueue) {
        // Strict FIFO: grant from the front while the head fits
        while queue
            .waiters
            .front()
            .is_some_and(|w| queue.admits(w.kind))
        {
            if let Some(waiter) = queue.waiters.pop_front() {
                self.grant(table_id, queue, waiter);
            }
        }

        // Row batching: let row requests jump table requests that are still
        // behind an earlier held row lock
        let head_is_blocked_table = queue
            .waiters
            .front()
            .is_some_and(|w| w.kind == TableLockKind::Table);
        if head_is_blocked_table {
            let mut i = 0;
            while i < queue.waiters.len() {
                match queue.waiters[i].kind {
                    TableLockKind::Table => {
                        if !queue.behind_held_row(queue.waiters[i].seq) {
                            break;
                        }
                        i += 1;
                    }
                    TableLockKind::Row => {
                        if let Some(waiter) = queue.waiters.remove(i) {
                            self.grant(table_id, queue, waiter);
                        }
                    }
                }
            }
        }
    }

    fn grant(&self, table_id: TableId, queue: &mut TableQueue, waiter: Waiter) {
        let Waiter {
            seq,
            kind,
            lock_ts,
            granted,
            released,
        } = waiter;

        queue.holders.push(Holder {
            seq,
            kind,
            lock_ts,
            current_ts: self.tso.now(),
        });
        // If the waiter gave up, the release watcher fires immediately
        let _ = granted.send(());

        let manager = self.clone();
        tokio::spawn(async move {
            // Completed or dropped: both mean released
            let _ = released.await;
            manager.release(table_id, seq);
        });
    }

    fn release(&self, table_id: TableId, seq: u64) {
        let mut tables = self.tables.lock();
        if let Some(queue) = tables.get_mut(&table_id) {
            queue.holders.retain(|h| h.seq != seq);
            self.pump(table_id, queue);
            if queue.holders.is_empty() && queue.waiters.is_empty() {
                tables.remove(&table_id);
            }
        }
    }
}
