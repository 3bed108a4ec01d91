use std::time::{Duration, Instant};

use gridtx::prelude::*;

use super::{begin, setup_cluster};
use crate::common::{counter_batch, counter_value};

#[test]
fn test_lost_finish_makes_outcome_unknown() {
    let cluster = setup_cluster(Duration::from_millis(100));
    let txn = begin(&cluster.grid, TxDurability::Strict);
    txn.write("key1", counter_batch(5)).unwrap();
    txn.prepare().unwrap();
    assert_eq!(cluster.backup.participant().staged_count(), 1);

    // The backup acknowledged prepare but never hears about the commit.
    cluster.network.isolate(2);
    let started = Instant::now();
    assert_eq!(txn.commit().unwrap(), TxOutcome::Unknown);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(txn.state(), TxState::Unknown);
    assert_eq!(
        futures::executor::block_on(txn.finish_future()),
        TxOutcome::Unknown
    );

    // Locally the write is applied and the lock released.
    assert_eq!(counter_value(&cluster.grid.get("key1").unwrap().unwrap()), 5);
    assert!(!cluster.grid.lock_table().is_locked("key1"));
    assert!(!cluster.backup.store().contains_key("key1"));
}

#[test]
fn test_unreachable_backup_times_out_prepare() {
    let cluster = setup_cluster(Duration::from_millis(100));
    cluster.network.isolate(2);

    let txn = cluster
        .grid
        .begin(
            TxConcurrency::Optimistic,
            TransactionIsolation::RepeatableRead,
            Duration::from_millis(200),
        )
        .unwrap();
    txn.write("key1", counter_batch(1)).unwrap();
    assert_eq!(txn.commit(), Err(GridTxError::Timeout { xid: txn.xid() }));
    assert_eq!(txn.state(), TxState::RolledBack);
    assert!(cluster.grid.get("key1").unwrap().is_none());
}

#[test]
fn test_healed_network_commits_again() {
    let cluster = setup_cluster(Duration::from_millis(200));
    cluster.network.isolate(2);
    cluster.network.heal(2);

    let txn = begin(&cluster.grid, TxDurability::Strict);
    txn.write("key1", counter_batch(9)).unwrap();
    assert!(matches!(txn.commit().unwrap(), TxOutcome::Committed { .. }));
    assert!(cluster.backup.store().contains_key("key1"));
}

#[test]
fn test_shutdown_backup_fails_prepare() {
    let cluster = setup_cluster(Duration::from_millis(200));
    cluster.backup.shutdown();

    let txn = begin(&cluster.grid, TxDurability::Strict);
    txn.write("key1", counter_batch(1)).unwrap();
    assert!(matches!(txn.commit(), Err(GridTxError::Transport(_))));
    assert_eq!(txn.state(), TxState::RolledBack);
}
