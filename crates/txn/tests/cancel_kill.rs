//! Cancellation, kill-query / kill-connection, and registry lifetime

use meridian_store::{HashRouter, MemStore, Mutation, Rpc, TableId};
use meridian_txn::{PeerMessage, TxnEnv, TxnError, TxnStatus};
use std::sync::Arc;
use std::time::Duration;

const TABLE: TableId = TableId(1);

fn setup() -> (Arc<TxnEnv>, Arc<MemStore>) {
    let store = Arc::new(MemStore::new());
    let router = Arc::new(HashRouter::new(4));
    let env = TxnEnv::new(1, store.clone(), router);
    (env, store)
}

fn put(key: &[u8], value: &[u8]) -> Mutation {
    Mutation::put(TABLE, key.to_vec(), value.to_vec())
}

#[tokio::test]
async fn test_kill_query_mid_prewrite_rolls_back() {
    let (env, store) = setup();
    let conn = env.connection(1);
    let stmt = conn.start_statement();

    let txn = env.begin(1, false);
    txn.dml(&stmt, "INSERT", vec![put(b"a", b"1"), put(b"b", b"2")])
        .await
        .unwrap();

    // Every prewrite call stalls long enough for the kill to land
    store.set_prewrite_delay(Duration::from_millis(150));

    let commit_txn = txn.clone();
    let commit = tokio::spawn(async move { commit_txn.commit().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    env.kill_query(1);

    let err = commit.await.unwrap().unwrap_err();
    assert!(matches!(err, TxnError::Cancelled(_)));

    // Cancel was observed at a checkpoint and the prewritten keys were
    // batch-rolled-back; the transaction never reached COMMIT
    assert_eq!(txn.status(), TxnStatus::Rollback);
    assert!(
        store
            .events()
            .iter()
            .any(|e| e.rpc == Rpc::BatchRollback)
    );
    assert_eq!(store.intent_count(txn.start_ts()), 0);
    assert_eq!(store.get(TABLE, b"a", env.tso().now()), None);
    assert_eq!(txn.commit_ts(), 0);

    txn.close().await;
    assert_eq!(txn.status(), TxnStatus::Close);
}

#[tokio::test]
async fn test_cancel_after_primary_commit_does_not_uncommit() {
    let (env, store) = setup();
    let conn = env.connection(1);
    let stmt = conn.start_statement();

    let txn = env.begin(1, false);
    txn.dml(&stmt, "INSERT", vec![put(b"a", b"1"), put(b"b", b"2")])
        .await
        .unwrap();

    // Stall commit RPCs so the cancel lands while the primary commit is
    // already in flight
    store.set_commit_delay(Duration::from_millis(150));

    let commit_txn = txn.clone();
    let commit = tokio::spawn(async move { commit_txn.commit().await });

    // Wait until the primary commit RPC has started, then cancel
    loop {
        if store.events().iter().any(|e| e.rpc == Rpc::Commit) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    txn.cancel();

    // The commit decision is durable; cancellation only skips waiting on
    // the secondaries
    commit.await.unwrap().unwrap();
    assert_eq!(txn.status(), TxnStatus::Commit);

    txn.close().await;

    // The secondaries still resolve through the commit pool
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if store.get(TABLE, b"b", txn.commit_ts()).is_some() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "secondary never committed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.get(TABLE, b"a", txn.commit_ts()), Some(b"1".to_vec()));
}

#[tokio::test]
async fn test_cancel_before_commit() {
    let (env, store) = setup();
    let conn = env.connection(1);
    let stmt = conn.start_statement();

    let txn = env.begin(1, false);
    txn.dml(&stmt, "INSERT", vec![put(b"a", b"1")]).await.unwrap();

    txn.cancel();
    let err = txn.commit().await.unwrap_err();
    assert!(matches!(err, TxnError::Cancelled(_)));
    assert_ne!(txn.status(), TxnStatus::Commit);

    // Nothing was prewritten, nothing is visible
    assert_eq!(store.get(TABLE, b"a", env.tso().now()), None);
    txn.close().await;
}

#[tokio::test]
async fn test_kill_query_spares_the_transaction() {
    let (env, _) = setup();
    let conn = env.connection(1);

    let stmt = conn.start_statement();
    let txn = env.begin(1, false);
    txn.dml(&stmt, "INSERT", vec![put(b"a", b"1")]).await.unwrap();

    env.kill_query(1);

    // The killed statement is dead
    let err = txn
        .dml(&stmt, "INSERT", vec![put(b"b", b"2")])
        .await
        .unwrap_err();
    assert!(matches!(err, TxnError::Cancelled(_)));
    conn.finish_statement(stmt.id());

    // But a fresh statement on the same transaction works
    let stmt = conn.start_statement();
    txn.dml(&stmt, "INSERT", vec![put(b"c", b"3")]).await.unwrap();
    txn.commit().await.unwrap();
    assert_eq!(txn.status(), TxnStatus::Commit);
    txn.close().await;
}

#[tokio::test]
async fn test_kill_connection_cancels_the_transaction() {
    let (env, _) = setup();
    let conn = env.connection(1);
    let stmt = conn.start_statement();

    let txn = env.begin(1, false);
    txn.dml(&stmt, "INSERT", vec![put(b"a", b"1")]).await.unwrap();

    let mut finished = txn.finished();
    env.kill_connection(1);

    // The finished future completes, waking any table-lock waiters
    finished.wait_for(|done| *done).await.unwrap();
    assert!(txn.is_cancelled());

    let err = txn.commit().await.unwrap_err();
    assert!(matches!(err, TxnError::Cancelled(_)));
    txn.close().await;
    assert_eq!(txn.status(), TxnStatus::Close);
}

#[tokio::test]
async fn test_cancel_broadcast() {
    let (env, _) = setup();

    let t1 = env.begin(1, false);
    let t2 = env.begin(2, false);
    assert_eq!(env.txn_count(), 2);

    env.cancel_all();
    assert!(t1.is_cancelled());
    assert!(t2.is_cancelled());

    t1.close().await;
    t2.close().await;
    assert_eq!(env.txn_count(), 0);
}

#[tokio::test]
async fn test_registry_lifetime() {
    let (env, _) = setup();

    let txn = env.begin(1, false);
    let id = txn.id();
    assert!(env.get_txn(id).is_some());
    assert_eq!(env.txn_count(), 1);

    txn.close().await;
    assert!(env.get_txn(id).is_none());
    assert_eq!(env.txn_count(), 0);

    // The connection's weak reference is gone once the registry lets go
    drop(txn);
    assert!(env.connection(1).current_txn().is_none());
}

#[tokio::test]
async fn test_peers_hear_cancel_and_finish() {
    let (env, _) = setup();

    let txn = env.begin(1, false);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    txn.register_peer(2, tx);
    assert!(txn.is_cross_node());

    txn.cancel();
    assert_eq!(rx.recv().await, Some(PeerMessage::Cancelled(txn.id())));

    txn.close().await;
    assert_eq!(rx.recv().await, Some(PeerMessage::Finished(txn.id())));
}
