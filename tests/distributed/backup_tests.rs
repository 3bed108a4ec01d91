use std::time::Duration;

use gridtx::prelude::*;

use super::{begin, setup_cluster, PARTITIONS};
use crate::common::{counter_batch, counter_value, wait_for_condition};

#[test]
fn test_sync_commit_waits_for_backup() {
    let cluster = setup_cluster(Duration::from_secs(2));
    let txn = begin(&cluster.grid, TxDurability::Strict);
    txn.write("key1", counter_batch(42)).unwrap();

    let outcome = txn.commit().unwrap();
    let TxOutcome::Committed { commit_version } = outcome else {
        panic!("expected commit, got {:?}", outcome);
    };
    assert!(txn.node_ids().contains(&2));

    // The backup applied the write before the commit returned.
    let backup_value = cluster.backup.store().get("key1").unwrap();
    assert_eq!(counter_value(backup_value.data()), 42);
    assert_eq!(backup_value.version(), commit_version);
    assert_eq!(cluster.backup.participant().staged_count(), 0);
    assert!(cluster.storage.get("key1").is_some());
}

#[test]
fn test_remote_delete_reaches_backup() {
    let cluster = setup_cluster(Duration::from_secs(2));
    cluster.grid.put("key1", counter_batch(1)).unwrap();
    assert!(cluster.backup.store().contains_key("key1"));

    cluster.grid.remove("key1").unwrap();
    assert!(!cluster.backup.store().contains_key("key1"));
}

#[test]
fn test_ec_commit_does_not_wait_for_backup() {
    let cluster = setup_cluster(Duration::from_secs(2));
    let txn = begin(&cluster.grid, TxDurability::Ec);
    txn.write("key1", counter_batch(7)).unwrap();

    assert!(matches!(txn.commit().unwrap(), TxOutcome::Committed { .. }));
    assert_eq!(counter_value(&cluster.grid.get("key1").unwrap().unwrap()), 7);
    assert!(wait_for_condition(
        || cluster.backup.store().contains_key("key1"),
        2000
    ));
}

#[test]
fn test_ec_commit_succeeds_while_backup_is_unreachable() {
    let cluster = setup_cluster(Duration::from_millis(100));
    cluster.network.isolate(2);

    let txn = begin(&cluster.grid, TxDurability::Ec);
    txn.write("key1", counter_batch(7)).unwrap();
    assert!(matches!(txn.commit().unwrap(), TxOutcome::Committed { .. }));
    assert!(!cluster.backup.store().contains_key("key1"));
    assert!(cluster.network.lost_messages() >= 1);
}

#[test]
fn test_backup_rejection_rolls_back() {
    let cluster = setup_cluster(Duration::from_secs(2));
    cluster.backup.participant().set_reject_prepares(true);

    let txn = begin(&cluster.grid, TxDurability::Strict);
    txn.write("key1", counter_batch(1)).unwrap();
    match txn.commit() {
        Err(GridTxError::BackupRejected { node, .. }) => assert_eq!(node, 2),
        other => panic!("expected backup rejection, got {:?}", other),
    }
    assert_eq!(txn.state(), TxState::RolledBack);
    assert!(cluster.grid.get("key1").unwrap().is_none());
    assert!(cluster.storage.get("key1").is_none());
    assert!(!cluster.grid.lock_table().is_locked("key1"));
}

#[test]
fn test_backup_reports_invalid_partition() {
    let cluster = setup_cluster(Duration::from_secs(2));
    let partition = partition_of("key1", PARTITIONS);
    cluster.backup.participant().disown(partition);

    let txn = begin(&cluster.grid, TxDurability::Strict);
    txn.write("key1", counter_batch(1)).unwrap();
    match txn.commit() {
        Err(GridTxError::InvalidPartition { partitions }) => {
            assert_eq!(partitions, vec![partition])
        }
        other => panic!("expected invalid partition, got {:?}", other),
    }
    assert!(txn.invalid_partitions().contains(&partition));
    assert_eq!(txn.state(), TxState::RolledBack);
}
