//! Table-lock coordination between transactions: FIFO, exclusivity, and
//! release through the transaction's finished future

use meridian_common::TxnConfig;
use meridian_store::{HashRouter, MemStore, TableId};
use meridian_txn::{TableLockKind, TxnEnv, TxnError};
use std::sync::Arc;
use std::time::Duration;

const TABLE: TableId = TableId(1);

fn setup() -> Arc<TxnEnv> {
    let store = Arc::new(MemStore::new());
    let router = Arc::new(HashRouter::new(4));
    TxnEnv::new(1, store, router)
}

#[tokio::test]
async fn test_row_locks_share_the_table() {
    let env = setup();

    let t1 = env.begin(1, false);
    let t2 = env.begin(2, false);

    env.lock_table(&t1, TABLE, TableLockKind::Row).await.unwrap();
    env.lock_table(&t2, TABLE, TableLockKind::Row).await.unwrap();
    assert_eq!(env.table_locks().holders(TABLE).len(), 2);

    t1.close().await;
    t2.close().await;
}

#[tokio::test]
async fn test_ddl_waits_for_dml_and_wakes_on_close() {
    let env = setup();

    let dml = env.begin(1, false);
    env.lock_table(&dml, TABLE, TableLockKind::Row).await.unwrap();

    // DDL on another connection queues behind the row lock
    let ddl = env.begin(2, false);
    let env2 = env.clone();
    let ddl2 = ddl.clone();
    let waiter = tokio::spawn(async move {
        env2.lock_table(&ddl2, TABLE, TableLockKind::Table).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    assert_eq!(env.table_locks().waiter_count(TABLE), 1);

    // Closing the DML transaction releases its lock via the finished future
    dml.close().await;
    waiter.await.unwrap().unwrap();
    assert_eq!(env.table_locks().holders(TABLE).len(), 1);

    ddl.close().await;
}

#[tokio::test]
async fn test_table_lock_wait_times_out() {
    let env = setup();

    let dml = env.begin(1, false);
    env.lock_table(&dml, TABLE, TableLockKind::Row).await.unwrap();

    let mut config = TxnConfig::default();
    config.lock_wait_timeout = Duration::from_millis(200);
    let ddl = env.begin_with(2, config, false);

    let err = env
        .lock_table(&ddl, TABLE, TableLockKind::Table)
        .await
        .unwrap_err();
    assert_eq!(err, TxnError::LockWaitTimeout);

    // The timed-out request must not hold the table once granted
    dml.close().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(env.table_locks().holders(TABLE).is_empty());

    ddl.close().await;
}

#[tokio::test]
async fn test_fifo_between_waiting_transactions() {
    let env = setup();

    let holder = env.begin(1, false);
    env.lock_table(&holder, TABLE, TableLockKind::Table)
        .await
        .unwrap();

    // Two more table locks queue in order
    let second = env.begin(2, false);
    let third = env.begin(3, false);

    let env2 = env.clone();
    let second2 = second.clone();
    let second_wait = tokio::spawn(async move {
        env2.lock_table(&second2, TABLE, TableLockKind::Table).await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let env3 = env.clone();
    let third2 = third.clone();
    let third_wait = tokio::spawn(async move {
        env3.lock_table(&third2, TABLE, TableLockKind::Table).await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    holder.close().await;
    second_wait.await.unwrap().unwrap();
    // Third still waits behind second
    assert!(!third_wait.is_finished());

    second.close().await;
    third_wait.await.unwrap().unwrap();
    third.close().await;
}

#[tokio::test]
async fn test_rollback_path_releases_table_lock() {
    let env = setup();

    let t1 = env.begin(1, false);
    env.lock_table(&t1, TABLE, TableLockKind::Table).await.unwrap();

    let t2 = env.begin(2, false);
    let env2 = env.clone();
    let t2b = t2.clone();
    let waiter =
        tokio::spawn(async move { env2.lock_table(&t2b, TABLE, TableLockKind::Row).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    // Rollback and close: the lock goes away on this exit path too
    t1.rollback().await.unwrap();
    t1.close().await;

    waiter.await.unwrap().unwrap();
    t2.close().await;
}
