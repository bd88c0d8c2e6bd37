//! Typed client surface of the transactional KV store
//!
//! This crate defines the RPC contract the transaction coordinator drives:
//! prewrite, commit, pessimistic locking and rollback, lock heartbeats, and
//! batch rollback, together with the typed errors the store can surface and
//! a partition router for key placement. `MemStore` is the in-process
//! stand-in the test suites run against.

mod api;
mod error;
mod mock;
mod router;
mod types;

pub use api::BatchRollbackRequest;
pub use api::CommitRequest;
pub use api::HeartbeatRequest;
pub use api::PessimisticLockRequest;
pub use api::PessimisticRollbackRequest;
pub use api::PrewriteRequest;
pub use api::TxnStore;
pub use error::Result;
pub use error::StoreError;
pub use mock::MemStore;
pub use mock::Rpc;
pub use mock::RpcEvent;
pub use router::HashRouter;
pub use router::PartitionRouter;
pub use types::Key;
pub use types::KeyAddr;
pub use types::Mutation;
pub use types::Op;
pub use types::PartitionId;
pub use types::PrimaryKey;
pub use types::TableId;
