use ahash::AHashMap as HashMap;
use crossbeam_channel as channel;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::data_store::cache_store::CacheStore;
use crate::data_store::versioned_value::VersionedValue;
use crate::distributed::channel_ext::Envelope;
use crate::distributed::network::LocalNetwork;
use crate::errors::{GridTxError, Result};
use crate::topology::partition_of;
use crate::twopc::messages::{
    decode_changes, FinishDecision, FinishRequest, FinishResponse, PrepareRequest,
    PrepareResponse, TxMessage, TxResponse,
};
use crate::twopc::{ParticipantError, TransactionChanges, TwoPhaseCommitParticipant};
use crate::version::{Version, VersionClock};
use crate::NodeId;

struct Staged {
    commit_version: Version,
    changes: TransactionChanges,
}

/// Backup copy of the partitions a node owns.
///
/// Prepared writes are staged per transaction and only reach the store when
/// the coordinator's commit decision arrives.
pub struct BackupParticipant {
    node_id: NodeId,
    partitions: u32,
    clock: VersionClock,
    store: CacheStore,
    staged: Mutex<HashMap<Version, Staged>>,
    // Partitions this node no longer owns after a rebalance.
    disowned: RwLock<BTreeSet<u32>>,
    reject_prepares: AtomicBool,
}

impl BackupParticipant {
    pub fn new(node_id: NodeId, node_order: u32, partitions: u32) -> Self {
        Self {
            node_id,
            partitions: partitions.max(1),
            clock: VersionClock::new(node_order),
            store: CacheStore::new(),
            staged: Mutex::new(HashMap::new()),
            disowned: RwLock::new(BTreeSet::new()),
            reject_prepares: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Committed backup values.
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Number of prepared transactions awaiting a decision.
    pub fn staged_count(&self) -> usize {
        self.staged.lock().len()
    }

    /// Makes every following prepare fail.
    pub fn set_reject_prepares(&self, reject: bool) {
        self.reject_prepares.store(reject, Ordering::Release);
    }

    pub fn disown(&self, partition: u32) {
        self.disowned.write().insert(partition);
    }

    fn stage(&self, xid: Version, commit_version: Version, changes: TransactionChanges) -> bool {
        if self.reject_prepares.load(Ordering::Acquire) {
            return false;
        }
        self.staged.lock().insert(
            xid,
            Staged {
                commit_version,
                changes,
            },
        );
        true
    }

    fn handle(&self, msg: TxMessage) -> TxResponse {
        match msg {
            TxMessage::Prepare(req) => TxResponse::Prepare(self.on_prepare(req)),
            TxMessage::Finish(req) => TxResponse::Finish(self.on_finish(req)),
        }
    }

    fn on_prepare(&self, req: PrepareRequest) -> PrepareResponse {
        self.clock.on_remote(req.commit_version);
        let mut resp = PrepareResponse {
            xid: req.xid,
            from: self.node_id,
            version: self.clock.last(),
            invalid_partitions: Vec::new(),
            error: None,
        };

        let invalid: BTreeSet<u32> = {
            let disowned = self.disowned.read();
            req.writes
                .iter()
                .map(|w| partition_of(&w.key, self.partitions))
                .filter(|p| disowned.contains(p))
                .collect()
        };
        if !invalid.is_empty() {
            resp.invalid_partitions = invalid.into_iter().collect();
            return resp;
        }

        let result = decode_changes(&req.writes)
            .map_err(ParticipantError::from)
            .map(|changes| self.stage(req.xid, req.commit_version, changes));
        match result {
            Ok(true) => debug!("Node {} prepared tx {}", self.node_id, req.xid),
            Ok(false) => resp.error = Some("participant refused to prepare".to_string()),
            Err(e) => resp.error = Some(e.to_string()),
        }
        resp
    }

    fn on_finish(&self, req: FinishRequest) -> FinishResponse {
        if let Some(version) = req.commit_version {
            self.clock.on_remote(version);
        }
        let result = match req.decision {
            FinishDecision::Commit => self.commit_transaction(req.xid),
            FinishDecision::Rollback => self.abort_transaction(req.xid),
        };
        FinishResponse {
            xid: req.xid,
            from: self.node_id,
            error: result.err().map(|e| e.to_string()),
        }
    }
}

impl TwoPhaseCommitParticipant for BackupParticipant {
    type GlobalTransactionId = Version;

    fn prepare_transaction(
        &self,
        global_tx_id: Version,
        changes: TransactionChanges,
    ) -> std::result::Result<bool, ParticipantError> {
        let commit_version = self.clock.next();
        Ok(self.stage(global_tx_id, commit_version, changes))
    }

    fn commit_transaction(&self, global_tx_id: Version) -> std::result::Result<(), ParticipantError> {
        let staged = self.staged.lock().remove(&global_tx_id).ok_or_else(|| {
            ParticipantError::Other(format!("tx {} was never prepared here", global_tx_id))
        })?;
        for (key, value) in staged.changes {
            match value {
                Some(batch) => self.store.insert(
                    key,
                    VersionedValue::new(Arc::new(batch), staged.commit_version),
                ),
                None => {
                    self.store.delete(&key);
                }
            }
        }
        debug!("Node {} committed tx {}", self.node_id, global_tx_id);
        Ok(())
    }

    fn abort_transaction(&self, global_tx_id: Version) -> std::result::Result<(), ParticipantError> {
        // A rollback may arrive for a transaction that never prepared here.
        if self.staged.lock().remove(&global_tx_id).is_some() {
            debug!("Node {} discarded tx {}", self.node_id, global_tx_id);
        }
        Ok(())
    }
}

/// A backup participant served by its own thread on a [`LocalNetwork`].
pub struct BackupNode {
    participant: Arc<BackupParticipant>,
    network: Arc<LocalNetwork>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackupNode {
    /// Registers `node_id` on `network` and starts serving its messages.
    ///
    /// # Errors
    ///
    /// Fails if the worker thread cannot be spawned.
    pub fn spawn(
        node_id: NodeId,
        node_order: u32,
        partitions: u32,
        network: Arc<LocalNetwork>,
    ) -> Result<Self> {
        let participant = Arc::new(BackupParticipant::new(node_id, node_order, partitions));
        let inbox = network.register(node_id);
        let worker = Arc::clone(&participant);
        let handle = thread::Builder::new()
            .name(format!("gridtx-backup-{}", node_id))
            .spawn(move || serve(&worker, inbox))
            .map_err(|e| {
                network.unregister(node_id);
                GridTxError::Other(format!("failed to spawn backup worker: {}", e))
            })?;
        Ok(Self {
            participant,
            network,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn participant(&self) -> &Arc<BackupParticipant> {
        &self.participant
    }

    pub fn store(&self) -> &CacheStore {
        self.participant.store()
    }

    /// Detaches from the network and waits for the worker to drain.
    pub fn shutdown(&self) {
        self.network.unregister(self.participant.node_id());
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("Backup worker of node {} panicked", self.participant.node_id());
            }
        }
    }
}

impl Drop for BackupNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve(participant: &BackupParticipant, inbox: channel::Receiver<Envelope>) {
    for envelope in inbox {
        let msg: TxMessage = match bincode::deserialize(&envelope.bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(
                    "Node {} dropped an undecodable message: {}",
                    participant.node_id(),
                    e
                );
                continue;
            }
        };
        let response = participant.handle(msg);
        // The coordinator may have stopped waiting.
        let _ = envelope.reply.send(response);
    }
    debug!("Backup worker of node {} stopped", participant.node_id());
}
