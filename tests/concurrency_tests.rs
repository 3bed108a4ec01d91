// Declare the common module *within this test crate*
mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use common::{counter_batch, counter_value, setup_grid, wait_for_condition};
use gridtx::prelude::*;
use rand::Rng;

#[test]
fn test_pessimistic_increments_are_mutually_exclusive() {
    let (grid, _) = setup_grid(GridTxConfig::default());
    grid.put("counter", counter_batch(0)).unwrap();

    let threads = 4;
    let per_thread = 25;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let grid = grid.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..per_thread {
                    let txn = grid
                        .begin(
                            TxConcurrency::Pessimistic,
                            TransactionIsolation::RepeatableRead,
                            Duration::ZERO,
                        )
                        .unwrap();
                    let current = counter_value(&txn.read("counter").unwrap().unwrap());
                    txn.write("counter", counter_batch(current + 1)).unwrap();
                    assert!(matches!(txn.commit().unwrap(), TxOutcome::Committed { .. }));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let total = counter_value(&grid.get("counter").unwrap().unwrap());
    assert_eq!(total, (threads * per_thread) as i64);
    assert!(!grid.lock_table().is_locked("counter"));
}

#[test]
fn test_optimistic_writers_in_opposite_order_do_not_deadlock() {
    let (grid, _) = setup_grid(GridTxConfig::default());
    let barrier = Arc::new(Barrier::new(2));

    let spawn_writer = |keys: [&'static str; 2], value: i64| {
        let grid = grid.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            let txn = grid
                .begin(
                    TxConcurrency::Optimistic,
                    TransactionIsolation::RepeatableRead,
                    Duration::from_secs(5),
                )
                .unwrap();
            for key in keys {
                txn.write(key, counter_batch(value)).unwrap();
            }
            barrier.wait();
            txn.commit()
        })
    };
    let first = spawn_writer(["a", "b"], 1);
    let second = spawn_writer(["b", "a"], 2);
    let results = [first.join().unwrap(), second.join().unwrap()];

    let committed = results.iter().filter(|r| r.is_ok()).count();
    assert!(committed >= 1, "results: {:?}", results);
    for result in &results {
        if let Err(e) = result {
            assert!(matches!(e, GridTxError::TransactionConflict { .. }), "{}", e);
        }
    }

    // Both keys come from the same winner.
    let a = counter_value(&grid.get("a").unwrap().unwrap());
    let b = counter_value(&grid.get("b").unwrap().unwrap());
    assert_eq!(a, b);
}

#[test]
fn test_serializable_prevents_write_skew() {
    let (grid, _) = setup_grid(GridTxConfig::default());
    grid.put("a", counter_batch(1)).unwrap();
    grid.put("b", counter_batch(1)).unwrap();

    let begin = || {
        grid.begin(
            TxConcurrency::Optimistic,
            TransactionIsolation::Serializable,
            Duration::from_secs(5),
        )
        .unwrap()
    };
    let t1 = begin();
    let t2 = begin();
    for txn in [&t1, &t2] {
        txn.read("a").unwrap();
        txn.read("b").unwrap();
    }
    t1.write("a", counter_batch(0)).unwrap();
    t2.write("b", counter_batch(0)).unwrap();

    t1.prepare().unwrap();
    assert!(t1.owns_lock("b").unwrap());

    // t1 holds the lock on its read key, so t2 cannot prepare until t1 is done.
    let second = {
        let t2 = t2.clone();
        thread::spawn(move || t2.prepare())
    };
    assert!(wait_for_condition(|| t2.state() == TxState::Preparing, 1000));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(t2.state(), TxState::Preparing);

    assert!(matches!(t1.commit().unwrap(), TxOutcome::Committed { .. }));
    let err = second.join().unwrap().unwrap_err();
    assert!(matches!(
        err,
        GridTxError::TransactionConflict { .. } | GridTxError::SerializabilityViolation { .. }
    ));
    assert!(t2.commit().is_err());

    let a = counter_value(&grid.get("a").unwrap().unwrap());
    let b = counter_value(&grid.get("b").unwrap().unwrap());
    assert_eq!((a, b), (0, 1));
    assert!(!grid.lock_table().is_locked("a"));
    assert!(!grid.lock_table().is_locked("b"));
}

#[test]
fn test_lock_wait_times_out() {
    let (grid, _) = setup_grid(GridTxConfig::default());
    let holder = grid
        .begin(
            TxConcurrency::Pessimistic,
            TransactionIsolation::RepeatableRead,
            Duration::ZERO,
        )
        .unwrap();
    holder.write("key1", counter_batch(1)).unwrap();

    let waiter = grid
        .begin(
            TxConcurrency::Pessimistic,
            TransactionIsolation::RepeatableRead,
            Duration::from_millis(10),
        )
        .unwrap();
    let started = Instant::now();
    let err = waiter.write("key1", counter_batch(2)).unwrap_err();
    assert_eq!(err, GridTxError::Timeout { xid: waiter.xid() });
    assert!(started.elapsed() < Duration::from_secs(2));

    // The holder is not disturbed and the waiter ends up rolled back.
    assert!(matches!(holder.commit().unwrap(), TxOutcome::Committed { .. }));
    assert!(wait_for_condition(
        || waiter.state() == TxState::RolledBack,
        1000
    ));
    assert!(!grid.lock_table().is_locked("key1"));
}

#[test]
fn test_timeout_processor_rolls_back_idle_transaction() {
    let (grid, _) = setup_grid(GridTxConfig::default());
    let txn = grid
        .begin(
            TxConcurrency::Pessimistic,
            TransactionIsolation::RepeatableRead,
            Duration::from_millis(10),
        )
        .unwrap();
    txn.write("key1", counter_batch(1)).unwrap();
    let finished = txn.finish_future();

    thread::sleep(Duration::from_millis(50));
    assert!(wait_for_condition(|| txn.state() == TxState::RolledBack, 1000));
    assert_eq!(futures::executor::block_on(finished), TxOutcome::RolledBack);
    assert!(!grid.lock_table().is_locked("key1"));
    assert!(matches!(txn.commit(), Err(GridTxError::InvalidState { .. })));
}

#[test]
fn test_rollback_wakes_lock_waiter() {
    let (grid, _) = setup_grid(GridTxConfig::default());
    let holder = grid
        .begin(
            TxConcurrency::Pessimistic,
            TransactionIsolation::RepeatableRead,
            Duration::ZERO,
        )
        .unwrap();
    holder.write("key1", counter_batch(1)).unwrap();

    let grid_waiter = grid.clone();
    let waiter = thread::spawn(move || {
        let txn = grid_waiter
            .begin(
                TxConcurrency::Pessimistic,
                TransactionIsolation::RepeatableRead,
                Duration::from_secs(5),
            )
            .unwrap();
        txn.write("key1", counter_batch(2)).unwrap();
        txn.commit().unwrap()
    });

    thread::sleep(Duration::from_millis(20));
    holder.rollback().unwrap();
    assert!(matches!(waiter.join().unwrap(), TxOutcome::Committed { .. }));
    assert_eq!(counter_value(&grid.get("key1").unwrap().unwrap()), 2);
}

#[test]
fn test_gateway_shutdown_while_operations_run() {
    let (grid, _) = setup_grid(GridTxConfig::default());
    let barrier = Arc::new(Barrier::new(5));

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let grid = grid.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let mut closed = false;
                for n in 0..200 {
                    match grid.put(format!("k{}-{}", i, n), counter_batch(n)) {
                        Ok(_) => {}
                        Err(GridTxError::GatewayClosed) => {
                            closed = true;
                            break;
                        }
                        Err(GridTxError::InvalidState { .. }) => {}
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
                closed
            })
        })
        .collect();

    barrier.wait();
    thread::sleep(Duration::from_millis(5));
    grid.stop();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(grid.gateway().state(), NodeState::Stopped);
    assert!(matches!(grid.put("late", counter_batch(0)), Err(GridTxError::GatewayClosed)));
    assert!(matches!(
        grid.gateway().try_enter(Duration::from_millis(10)),
        Err(GridTxError::GatewayClosed)
    ));
}

#[test]
fn test_topology_change_fails_pessimistic_commit() {
    let config = GridTxConfig::default().with_partitions(16, 0);
    let (grid, _) = setup_grid(config);
    let txn = grid
        .begin(
            TxConcurrency::Pessimistic,
            TransactionIsolation::RepeatableRead,
            Duration::ZERO,
        )
        .unwrap();
    let keys: Vec<String> = (0..32).map(|i| format!("key{}", i)).collect();
    for key in &keys {
        txn.write(key.clone(), counter_batch(1)).unwrap();
    }
    assert_eq!(txn.topology_version(), Some(1));

    let changed = grid.on_topology_change([1, 2]);
    assert!(!changed.is_empty());
    assert_eq!(grid.topology().version(), 2);
    assert_eq!(txn.invalid_partitions(), changed);

    // Half of the partitions move to the new node, so some of the 32 keys
    // land on a moved partition.
    assert!(keys.iter().any(|k| changed.contains(&partition_of(k, 16))));
    assert!(matches!(txn.commit(), Err(GridTxError::InvalidPartition { .. })));
    assert_eq!(txn.state(), TxState::RolledBack);
    assert!(grid.get("key0").unwrap().is_none());

    // Transactions bound after the change are unaffected.
    let fresh = grid.begin_default().unwrap();
    fresh.write("key0", counter_batch(2)).unwrap();
    assert_eq!(fresh.topology_version(), Some(2));
    assert!(fresh.commit().is_ok());
}

#[test]
fn test_random_contention_keeps_totals() {
    let (grid, _) = setup_grid(GridTxConfig::default());
    let accounts = 5;
    for i in 0..accounts {
        grid.put(format!("acct{}", i), counter_batch(100)).unwrap();
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let grid = grid.clone();
            thread::spawn(move || {
                let mut rng = rand::rng();
                for _ in 0..50 {
                    let from = rng.random_range(0..accounts);
                    let to = (from + rng.random_range(1..accounts)) % accounts;
                    let amount = rng.random_range(1..10);
                    let txn = grid
                        .begin(
                            TxConcurrency::Optimistic,
                            TransactionIsolation::Serializable,
                            Duration::from_secs(5),
                        )
                        .unwrap();
                    let (from, to) = (format!("acct{}", from), format!("acct{}", to));
                    let a = counter_value(&txn.read(&from).unwrap().unwrap());
                    let b = counter_value(&txn.read(&to).unwrap().unwrap());
                    txn.write(from, counter_batch(a - amount)).unwrap();
                    txn.write(to, counter_batch(b + amount)).unwrap();
                    match txn.commit() {
                        Ok(_) => {}
                        Err(e) => assert!(e.is_retryable(), "unexpected error: {}", e),
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let total: i64 = (0..accounts)
        .map(|i| counter_value(&grid.get(&format!("acct{}", i)).unwrap().unwrap()))
        .sum();
    assert_eq!(total, 100 * accounts as i64);
    assert_eq!(grid.active_transactions(), 0);
}
