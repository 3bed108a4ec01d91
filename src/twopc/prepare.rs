use crossbeam_channel as channel;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::conflict::detection::{apply_filters, detect_conflicts};
use crate::context::GridContext;
use crate::errors::{GridTxError, Result};
use crate::transaction::state::{TxConcurrency, TxDurability, TxState};
use crate::transaction::Transaction;
use crate::twopc::messages::{PrepareRequest, TxMessage, TxResponse, WireEntry};
use crate::version::Version;
use crate::{CacheKey, NodeId};

/// Drives the prepare phase of local transactions.
pub struct PrepareCoordinator {
    ctx: Arc<GridContext>,
}

impl PrepareCoordinator {
    pub fn new(ctx: Arc<GridContext>) -> Self {
        Self { ctx }
    }

    /// Moves `tx` from `Active` to `Prepared`.
    ///
    /// Locks (optimistic) or checks (pessimistic) the write set, validates
    /// it, assigns the commit version and forwards the writes to their remote
    /// owners.
    ///
    /// # Errors
    ///
    /// Conflicts, serializability violations, invalid partitions, timeouts
    /// and backup failures. The transaction is marked for rollback before the
    /// error is returned.
    pub fn prepare(&self, tx: &Arc<Transaction>) -> Result<()> {
        if !tx.set_state(TxState::Preparing) {
            return Err(GridTxError::InvalidState {
                xid: tx.xid(),
                state: tx.state(),
                op: "prepare",
            });
        }
        tx.seal();

        if let Err(e) = self.run(tx) {
            tx.set_state(TxState::MarkedRollback);
            debug!("Prepare of tx {} failed: {}", tx.xid(), e);
            return Err(e);
        }

        if !tx.set_state(TxState::Prepared) {
            return Err(GridTxError::InvalidState {
                xid: tx.xid(),
                state: tx.state(),
                op: "prepare",
            });
        }
        debug!("Tx {} prepared at {:?}", tx.xid(), tx.commit_version());
        Ok(())
    }

    fn run(&self, tx: &Arc<Transaction>) -> Result<()> {
        tx.remaining_time()?;

        if !tx.is_empty() {
            match tx.concurrency() {
                TxConcurrency::Optimistic => self.lock_and_validate(tx)?,
                TxConcurrency::Pessimistic => {
                    apply_filters(tx.xid(), &mut tx.entries_mut().writes, &self.ctx.store);
                }
            }
            check_invalid_partitions(tx)?;

            if tx.needs_completed_versions() {
                self.validate_serializable(tx)?;
            }
        }

        let commit_version = self.ctx.clock.next();
        tx.set_commit_version(commit_version);

        self.forward_to_owners(tx, commit_version)
    }

    /// Acquires write locks in key order, then validates every entry against
    /// the store.
    ///
    /// Serializable transactions lock their read keys too, so that no other
    /// transaction can commit over a read between validation and commit.
    fn lock_and_validate(&self, tx: &Arc<Transaction>) -> Result<()> {
        // Every optimistic transaction locks in the same global key order.
        let keys: BTreeSet<CacheKey> = {
            let entries = tx.entries_mut();
            let mut keys: BTreeSet<CacheKey> = entries.writes.keys().cloned().collect();
            if tx.needs_completed_versions() {
                keys.extend(entries.reads.keys().cloned());
            }
            keys
        };
        for key in &keys {
            tx.remaining_time()?;
            tx.lock_key(key)?;
        }

        let mut entries = tx.entries_mut();
        let conflicts = detect_conflicts(
            tx.xid(),
            tx.isolation(),
            &entries.reads,
            &entries.writes,
            &self.ctx.store,
        );
        if let Some((key, kind)) = conflicts.into_iter().next() {
            debug!("Tx {} failed validation on '{}': {:?}", tx.xid(), key, kind);
            return Err(GridTxError::TransactionConflict { key });
        }
        apply_filters(tx.xid(), &mut entries.writes, &self.ctx.store);
        Ok(())
    }

    fn validate_serializable(&self, tx: &Arc<Transaction>) -> Result<()> {
        let snapshot = self.ctx.completed.snapshot(tx.start_version());
        tx.set_completed_versions(snapshot.clone());
        let reads: Vec<(CacheKey, Option<Version>)> = tx
            .read_set()
            .into_iter()
            .map(|e| (e.key().clone(), e.snapshot_version()))
            .collect();
        self.ctx
            .completed
            .validate_serializable(tx.xid(), &reads, &snapshot)
    }

    /// Sends the write set to every remote owner of a written partition.
    fn forward_to_owners(&self, tx: &Arc<Transaction>, commit_version: Version) -> Result<()> {
        let Some(transport) = self.ctx.transport() else {
            return Ok(());
        };
        let topology = self.ctx.topology();
        let local = self.ctx.node_id();

        let mut per_node: BTreeMap<NodeId, Vec<WireEntry>> = BTreeMap::new();
        for entry in tx.write_set().iter().filter(|e| e.op().is_write()) {
            for node in topology.owners(entry.partition()) {
                if node != local {
                    per_node
                        .entry(node)
                        .or_default()
                        .push(WireEntry::from_entry(entry)?);
                }
            }
        }
        if per_node.is_empty() {
            return Ok(());
        }

        let invalid: Vec<u32> = tx.invalid_partitions().into_iter().collect();
        let mut pending = Vec::with_capacity(per_node.len());
        for (node, writes) in per_node {
            tx.add_node_id(node);
            let request = PrepareRequest {
                xid: tx.xid(),
                start_version: tx.start_version(),
                commit_version,
                topology_version: tx.topology_version().unwrap_or(topology.version()),
                origin: local,
                master_node_ids: tx.master_node_ids().iter().copied().collect(),
                other_node_id: tx.other_node_id(),
                concurrency: tx.concurrency(),
                isolation: tx.isolation(),
                durability: tx.durability(),
                sync_commit: tx.sync_commit(),
                invalid_partitions: invalid.clone(),
                writes,
            };
            debug!("Tx {} sends prepare to node {}", tx.xid(), node);
            pending.push((node, transport.send(node, TxMessage::Prepare(request))?));
        }

        // EC transactions never wait for backups.
        if tx.sync_commit() && tx.durability() != TxDurability::Ec {
            self.await_acks(tx, pending)
        } else {
            self.reconcile_async(tx.xid(), pending);
            Ok(())
        }
    }

    fn await_acks(
        &self,
        tx: &Arc<Transaction>,
        pending: Vec<(NodeId, channel::Receiver<TxResponse>)>,
    ) -> Result<()> {
        let wait = tx.remaining_time()?.unwrap_or(self.ctx.config.finish_timeout);
        let deadline = Instant::now() + wait;

        for (node, rx) in pending {
            match rx.recv_deadline(deadline) {
                Ok(TxResponse::Prepare(resp)) => {
                    self.ctx.clock.on_remote(resp.version);
                    if !resp.invalid_partitions.is_empty() {
                        for p in &resp.invalid_partitions {
                            tx.add_invalid_partition(*p);
                        }
                        return Err(GridTxError::InvalidPartition {
                            partitions: resp.invalid_partitions,
                        });
                    }
                    if let Some(reason) = resp.error {
                        return Err(GridTxError::BackupRejected { node, reason });
                    }
                }
                Ok(other) => {
                    return Err(GridTxError::Transport(format!(
                        "unexpected response from node {}: {:?}",
                        node, other
                    )));
                }
                Err(channel::RecvTimeoutError::Timeout) => {
                    return Err(GridTxError::Timeout { xid: tx.xid() });
                }
                Err(channel::RecvTimeoutError::Disconnected) => {
                    return Err(GridTxError::Transport(format!(
                        "node {} dropped the prepare of tx {}",
                        node,
                        tx.xid()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Collects acknowledgments in the background, logging the ones that fail.
    fn reconcile_async(&self, xid: Version, pending: Vec<(NodeId, channel::Receiver<TxResponse>)>) {
        let throttle = Arc::clone(&self.ctx.log_throttle);
        let wait = self.ctx.config.finish_timeout;
        let spawned = thread::Builder::new()
            .name("gridtx-reconcile".to_string())
            .spawn(move || {
                let deadline = Instant::now() + wait;
                for (node, rx) in pending {
                    match rx.recv_deadline(deadline) {
                        Ok(resp) => {
                            if let Some(reason) = resp.error() {
                                throttle.warn(&format!(
                                    "Backup node {} rejected prepare of tx {}: {}",
                                    node, xid, reason
                                ));
                            }
                        }
                        Err(_) => {
                            throttle.warn(&format!(
                                "Backup node {} did not acknowledge prepare of tx {} within {:?}",
                                node, xid, wait
                            ));
                        }
                    }
                }
            });
        if let Err(e) = spawned {
            self.ctx
                .log_throttle
                .warn(&format!("Failed to spawn reconcile thread: {}", e));
        }
    }
}

/// Fails if a written key maps to a partition invalidated by a topology change.
pub(crate) fn check_invalid_partitions(tx: &Transaction) -> Result<()> {
    let invalid = tx.invalid_partitions();
    if invalid.is_empty() {
        return Ok(());
    }
    let hit: Vec<u32> = tx
        .write_partitions()
        .intersection(&invalid)
        .copied()
        .collect();
    if hit.is_empty() {
        Ok(())
    } else {
        debug!("Tx {} writes to invalid partitions {:?}", tx.xid(), hit);
        Err(GridTxError::InvalidPartition { partitions: hit })
    }
}
