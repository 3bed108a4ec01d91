use ahash::AHashSet as HashSet;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Instant;

use crate::context::GridContext;
use crate::data_store::versioned_value::VersionedValue;
use crate::errors::{GridTxError, Result};
use crate::storage::StorageMutation;
use crate::transaction::entry::TxEntry;
use crate::transaction::state::{TxDurability, TxOutcome, TxState};
use crate::transaction::Transaction;
use crate::twopc::messages::{FinishDecision, FinishRequest, TxMessage};
use crate::twopc::prepare::check_invalid_partitions;
use crate::CacheKey;

/// Drives commit and rollback of prepared or failed transactions and
/// completes their finish signal.
pub struct FinishTracker {
    ctx: Arc<GridContext>,
}

impl FinishTracker {
    pub fn new(ctx: Arc<GridContext>) -> Self {
        Self { ctx }
    }

    /// Commits a `Prepared` transaction.
    ///
    /// Pending values are written through to storage and applied to the
    /// cache before any lock is released, so a waiter promoted by the lock
    /// table always observes the complete write.
    ///
    /// # Errors
    ///
    /// * `InvalidState` if the transaction is not prepared or another thread
    ///   is already finishing it.
    /// * `InvalidPartition` if the topology changed under a written key; the
    ///   transaction is rolled back.
    /// * Storage errors; the transaction is rolled back.
    pub fn commit(&self, tx: &Arc<Transaction>) -> Result<TxOutcome> {
        let state = tx.state();
        if state != TxState::Prepared || !tx.mark_finalizing() {
            return Err(GridTxError::InvalidState {
                xid: tx.xid(),
                state,
                op: "commit",
            });
        }

        if let Err(e) = check_invalid_partitions(tx) {
            self.rollback_inner(tx)?;
            return Err(e);
        }

        let Some(commit_version) = tx.commit_version() else {
            self.rollback_inner(tx)?;
            return Err(GridTxError::Other(format!(
                "tx {} was prepared without a commit version",
                tx.xid()
            )));
        };

        let writes: Vec<TxEntry> = tx
            .write_set()
            .into_iter()
            .filter(|e| e.op().is_write())
            .collect();

        if !writes.is_empty() {
            let mutations = writes
                .iter()
                .map(|e| match e.pending() {
                    Some(batch) => StorageMutation::Insert(e.key().clone(), batch.clone()),
                    None => StorageMutation::Delete(e.key().clone()),
                })
                .collect();
            if let Err(e) = self.ctx.storage.apply_mutations(mutations) {
                warn!("Write-through of tx {} failed, rolling back: {}", tx.xid(), e);
                self.rollback_inner(tx)?;
                return Err(e);
            }
        }

        if !tx.set_state(TxState::Committing) {
            return Err(GridTxError::InvalidState {
                xid: tx.xid(),
                state: tx.state(),
                op: "commit",
            });
        }

        for entry in &writes {
            match entry.pending() {
                Some(batch) => self.ctx.store.insert(
                    entry.key().clone(),
                    VersionedValue::new(Arc::new(batch.clone()), commit_version),
                ),
                None => {
                    self.ctx.store.delete(entry.key());
                }
            }
        }
        let write_keys: HashSet<CacheKey> = writes.iter().map(|e| e.key().clone()).collect();
        self.ctx
            .completed
            .record_committed(tx.xid(), commit_version, write_keys);

        let wait = tx.sync_commit() && tx.durability() != TxDurability::Ec;
        let confirmed = self.finish_remote(tx, FinishDecision::Commit, wait);

        let released = tx.release_locks();
        tx.set_end_version(self.ctx.clock.next());

        let outcome = if confirmed {
            tx.set_state(TxState::Committed);
            TxOutcome::Committed { commit_version }
        } else {
            tx.set_state(TxState::Unknown);
            TxOutcome::Unknown
        };
        debug!(
            "Tx {} finished commit as {:?}, released {} locks",
            tx.xid(),
            outcome,
            released
        );
        self.complete(tx, outcome);
        Ok(outcome)
    }

    /// Finishes a transaction that touched no keys: no locks, no messages.
    pub fn commit_empty(&self, tx: &Arc<Transaction>) -> Result<TxOutcome> {
        if !tx.mark_finalizing() {
            return Err(GridTxError::InvalidState {
                xid: tx.xid(),
                state: tx.state(),
                op: "commit",
            });
        }
        for next in [TxState::Preparing, TxState::Prepared, TxState::Committing] {
            if !tx.set_state(next) {
                let state = tx.state();
                self.rollback_inner(tx)?;
                return Err(GridTxError::InvalidState {
                    xid: tx.xid(),
                    state,
                    op: "commit",
                });
            }
        }
        tx.seal();
        let commit_version = self.ctx.clock.next();
        tx.set_commit_version(commit_version);
        tx.set_end_version(self.ctx.clock.next());
        tx.set_state(TxState::Committed);

        let outcome = TxOutcome::Committed { commit_version };
        self.complete(tx, outcome);
        Ok(outcome)
    }

    /// Rolls a transaction back from any state before commit.
    ///
    /// Concurrent and repeated calls are safe: one caller performs the
    /// rollback, the others get its outcome.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the transaction committed or is committing.
    pub fn rollback(&self, tx: &Arc<Transaction>) -> Result<TxOutcome> {
        let state = tx.state();
        // A prepared transaction is finished by whoever claims it first.
        let claimed = match state {
            TxState::Prepared => tx.mark_finalizing(),
            TxState::Committing | TxState::Committed => false,
            _ => true,
        };
        if !claimed {
            return Err(GridTxError::InvalidState {
                xid: tx.xid(),
                state,
                op: "rollback",
            });
        }
        self.rollback_inner(tx)
    }

    fn rollback_inner(&self, tx: &Arc<Transaction>) -> Result<TxOutcome> {
        if tx.state().is_pre_commit() {
            tx.set_state(TxState::MarkedRollback);
        }
        if !tx.set_state(TxState::RollingBack) {
            return match tx.state() {
                TxState::RolledBack => Ok(TxOutcome::RolledBack),
                TxState::Unknown => Ok(TxOutcome::Unknown),
                TxState::RollingBack => Ok(futures::executor::block_on(tx.finish_future())),
                state => Err(GridTxError::InvalidState {
                    xid: tx.xid(),
                    state,
                    op: "rollback",
                }),
            };
        }

        tx.interrupt();
        tx.discard_pending();
        let confirmed = self.finish_remote(tx, FinishDecision::Rollback, tx.sync_rollback());
        let released = tx.release_locks();
        self.ctx.completed.record_rolled_back(tx.xid());
        tx.set_end_version(self.ctx.clock.next());

        let outcome = if confirmed {
            tx.set_state(TxState::RolledBack);
            TxOutcome::RolledBack
        } else {
            tx.set_state(TxState::Unknown);
            TxOutcome::Unknown
        };
        debug!(
            "Tx {} rolled back as {:?}, released {} locks",
            tx.xid(),
            outcome,
            released
        );
        self.complete(tx, outcome);
        Ok(outcome)
    }

    fn complete(&self, tx: &Transaction, outcome: TxOutcome) {
        tx.signal_finished(outcome);
        self.ctx.registry.unregister(tx.xid());
    }

    /// Sends the decision to every remote participant. When `wait` is set,
    /// returns `false` if any of them did not answer within the finish
    /// timeout.
    fn finish_remote(&self, tx: &Transaction, decision: FinishDecision, wait: bool) -> bool {
        let nodes = tx.node_ids();
        if nodes.is_empty() {
            return true;
        }
        let Some(transport) = self.ctx.transport() else {
            return true;
        };

        let invalid: Vec<u32> = tx.invalid_partitions().into_iter().collect();
        let mut confirmed = true;
        let mut pending = Vec::with_capacity(nodes.len());
        for node in nodes {
            let request = FinishRequest {
                xid: tx.xid(),
                commit_version: tx.commit_version(),
                decision,
                origin: self.ctx.node_id(),
                invalid_partitions: invalid.clone(),
                sync: wait,
            };
            match transport.send(node, TxMessage::Finish(request)) {
                Ok(rx) => pending.push((node, rx)),
                Err(e) => {
                    self.ctx.log_throttle.warn(&format!(
                        "Failed to send {:?} of tx {} to node {}: {}",
                        decision,
                        tx.xid(),
                        node,
                        e
                    ));
                    confirmed = false;
                }
            }
        }
        if !wait {
            return true;
        }

        let deadline = Instant::now() + self.ctx.config.finish_timeout;
        for (node, rx) in pending {
            match rx.recv_deadline(deadline) {
                Ok(resp) => {
                    if let Some(reason) = resp.error() {
                        self.ctx.log_throttle.warn(&format!(
                            "Node {} failed to apply {:?} of tx {}: {}",
                            node,
                            decision,
                            tx.xid(),
                            reason
                        ));
                    }
                }
                Err(_) => {
                    warn!(
                        "Node {} did not confirm {:?} of tx {}, outcome unknown",
                        node,
                        decision,
                        tx.xid()
                    );
                    confirmed = false;
                }
            }
        }
        confirmed
    }
}
