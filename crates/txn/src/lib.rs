//! Client-side distributed transaction coordinator
//!
//! Drives two-phase commit against a sharded MVCC store: optimistic and
//! pessimistic transactions, table-level lock coordination between DDL and
//! DML, write-conflict resolution, region-split retry, and the
//! per-connection kill surface.

mod cache;
mod error;
mod heartbeat;
mod optimistic;
mod pessimistic;
mod pool;
mod profile;
mod registry;
mod retry;
mod state;
mod table_lock;
mod transaction;

pub use cache::TxnCache;
pub use error::TxnError;
pub use error::TxnResult;
pub use pool::TaskPool;
pub use registry::Connection;
pub use registry::StatementHandle;
pub use registry::TxnEnv;
pub use retry::REGION_SPLIT_BACKOFF;
pub use retry::RetryDecision;
pub use retry::run_auto_commit_statement;
pub use retry::write_conflict_decision;
pub use state::TxnStatus;
pub use table_lock::TableLockHandle;
pub use table_lock::TableLockKind;
pub use table_lock::TableLockManager;
pub use table_lock::TableLockRequest;
pub use transaction::PeerMessage;
pub use transaction::PessState;
pub use transaction::Transaction;
pub use transaction::TxnKind;
