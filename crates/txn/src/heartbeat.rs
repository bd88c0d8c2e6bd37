//! Primary-lock heartbeat
//!
//! A pessimistic transaction keeps its primary lock alive by extending the
//! TTL at a third of the TTL interval. The task holds no transaction state
//! beyond immutable fields and is aborted by cleanup before the registry
//! entry goes away.

use meridian_common::TxnId;
use meridian_store::{HeartbeatRequest, KeyAddr, TxnStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Start the heartbeat task for a primary lock
pub(crate) fn start(
    store: Arc<dyn TxnStore>,
    txn_id: TxnId,
    primary: KeyAddr,
    start_ts: u64,
    lock_ttl: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(lock_ttl / 3);
        // The first tick fires immediately; the lock was just taken
        interval.tick().await;

        loop {
            interval.tick().await;

            let req = HeartbeatRequest {
                start_ts,
                primary: primary.clone(),
                new_ttl: lock_ttl,
            };
            if let Err(e) = store.txn_heartbeat(req).await {
                tracing::warn!("{} failed to extend primary lock: {}", txn_id, e);
            }
        }
    })
}
