use arrow::record_batch::RecordBatch;
use crossbeam_channel as channel;
use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use crate::context::GridContext;
use crate::conflict::completed::CompletedVersions;
use crate::errors::{GridTxError, Result};
use crate::mvcc::candidate::LockCandidate;
use crate::twopc::finish::FinishTracker;
use crate::twopc::prepare::PrepareCoordinator;
use crate::version::Version;
use crate::{CacheKey, NodeId, TransactionIsolation};

use entry::{EntryFilter, EntryOp, TxEntry};
use state::{TxConcurrency, TxDurability, TxFlags, TxOutcome, TxState};
use topology_guard::TopologyGuard;

/// Read and write records of a transaction.
pub mod entry;
/// The transaction state machine and mode enums.
pub mod state;
/// Topology binding of a transaction.
pub mod topology_guard;

/// Messages pushed to a transaction while it waits for a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    /// The transaction became owner of `key`'s lock.
    OwnerChanged { key: CacheKey, version: Version },
    /// The wait must be abandoned (timeout or node shutdown).
    Interrupted,
}

/// Resolves with the transaction's outcome once it committed or rolled back.
///
/// Any number of clones can be awaited. If the transaction is dropped without
/// reaching a final state, the future resolves to [`TxOutcome::Unknown`].
#[derive(Clone)]
pub struct FinishFuture {
    inner: Shared<oneshot::Receiver<TxOutcome>>,
}

impl Future for FinishFuture {
    type Output = TxOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner)
            .poll(cx)
            .map(|res| res.unwrap_or(TxOutcome::Unknown))
    }
}

/// Options of a new transaction beyond concurrency, isolation and timeout.
#[derive(Debug, Clone)]
pub struct TxOptions {
    pub concurrency: TxConcurrency,
    pub isolation: TransactionIsolation,
    /// Zero means no deadline.
    pub timeout: Duration,
    pub durability: TxDurability,
    pub flags: TxFlags,
    /// Defaults to the node configuration when `None`.
    pub sync_commit: Option<bool>,
    pub sync_rollback: Option<bool>,
    pub master_node_ids: Vec<NodeId>,
    pub other_node_id: Option<NodeId>,
    pub event_node_id: Option<NodeId>,
    pub user: Option<String>,
}

impl TxOptions {
    pub fn new(concurrency: TxConcurrency, isolation: TransactionIsolation, timeout: Duration) -> Self {
        Self {
            concurrency,
            isolation,
            timeout,
            durability: TxDurability::Strict,
            flags: TxFlags::local(),
            sync_commit: None,
            sync_rollback: None,
            master_node_ids: Vec::new(),
            other_node_id: None,
            event_node_id: None,
            user: None,
        }
    }

    pub fn with_durability(mut self, durability: TxDurability) -> Self {
        self.durability = durability;
        self
    }

    pub fn with_flags(mut self, flags: TxFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_sync_commit(mut self, sync: bool) -> Self {
        self.sync_commit = Some(sync);
        self
    }

    pub fn with_sync_rollback(mut self, sync: bool) -> Self {
        self.sync_rollback = Some(sync);
        self
    }

    pub fn with_master_node_ids(mut self, ids: impl IntoIterator<Item = NodeId>) -> Self {
        self.master_node_ids = ids.into_iter().collect();
        self
    }

    pub fn with_other_node_id(mut self, id: NodeId) -> Self {
        self.other_node_id = Some(id);
        self
    }

    pub fn with_event_node_id(mut self, id: NodeId) -> Self {
        self.event_node_id = Some(id);
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

#[derive(Default)]
pub(crate) struct TxEntries {
    pub(crate) reads: BTreeMap<CacheKey, TxEntry>,
    pub(crate) writes: BTreeMap<CacheKey, TxEntry>,
}

/// Represents a single transaction.
///
/// Transactions are created by [`GridTx::begin`](crate::gridtx::GridTx::begin)
/// and shared as `Arc<Transaction>`: the owning thread adds entries, while
/// the timeout worker, the lock table and coordinators observe and change
/// its status concurrently. Status fields are atomics or short critical
/// sections, so they can be read from any thread.
pub struct Transaction {
    ctx: Arc<GridContext>,
    xid: Version,
    start_version: Version,
    concurrency: TxConcurrency,
    isolation: TransactionIsolation,
    durability: TxDurability,
    flags: TxFlags,
    sync_commit: bool,
    sync_rollback: bool,
    timeout: Duration,
    deadline: Option<Instant>,
    master_node_ids: BTreeSet<NodeId>,
    other_node_id: Option<NodeId>,
    event_node_id: NodeId,
    user: Option<String>,

    state: AtomicU8,
    sealed: AtomicBool,
    finalizing: AtomicBool,
    invalidate: AtomicBool,
    system_invalidate: AtomicBool,

    entries: Mutex<TxEntries>,
    topology: TopologyGuard,
    commit_version: Mutex<Option<Version>>,
    end_version: Mutex<Option<Version>>,
    completed_versions: Mutex<Option<CompletedVersions>>,
    node_ids: Mutex<BTreeSet<NodeId>>,
    // Keys with a queued candidate. Inserting and draining happen under this
    // mutex together with a state check, so a rollback never misses a lock.
    lock_keys: Mutex<BTreeSet<CacheKey>>,

    events_tx: channel::Sender<LockEvent>,
    events_rx: channel::Receiver<LockEvent>,
    finish_tx: Mutex<Option<oneshot::Sender<TxOutcome>>>,
    finish_rx: FinishFuture,
}

impl Transaction {
    pub(crate) fn new(ctx: Arc<GridContext>, opts: TxOptions) -> Arc<Self> {
        let start_version = ctx.clock.next();
        let xid = ctx.clock.next();
        let deadline = (!opts.timeout.is_zero()).then(|| Instant::now() + opts.timeout);
        let (events_tx, events_rx) = channel::unbounded();
        let (finish_tx, finish_rx) = oneshot::channel();

        let tx = Arc::new(Self {
            xid,
            start_version,
            concurrency: opts.concurrency,
            isolation: opts.isolation,
            durability: opts.durability,
            flags: opts.flags,
            sync_commit: opts.sync_commit.unwrap_or(ctx.config.sync_commit),
            sync_rollback: opts.sync_rollback.unwrap_or(ctx.config.sync_rollback),
            timeout: opts.timeout,
            deadline,
            master_node_ids: opts.master_node_ids.into_iter().collect(),
            other_node_id: opts.other_node_id,
            event_node_id: opts.event_node_id.unwrap_or(ctx.config.node_id),
            user: opts.user,
            state: AtomicU8::new(TxState::Active as u8),
            sealed: AtomicBool::new(false),
            finalizing: AtomicBool::new(false),
            invalidate: AtomicBool::new(false),
            system_invalidate: AtomicBool::new(false),
            entries: Mutex::new(TxEntries::default()),
            topology: TopologyGuard::new(),
            commit_version: Mutex::new(None),
            end_version: Mutex::new(None),
            completed_versions: Mutex::new(None),
            node_ids: Mutex::new(BTreeSet::new()),
            lock_keys: Mutex::new(BTreeSet::new()),
            events_tx,
            events_rx,
            finish_tx: Mutex::new(Some(finish_tx)),
            finish_rx: FinishFuture {
                inner: finish_rx.shared(),
            },
            ctx,
        });
        tx.ctx.registry.register(&tx);
        debug!(
            "Started tx {} ({:?}, {:?}, timeout {:?})",
            tx.xid, tx.concurrency, tx.isolation, tx.timeout
        );
        tx
    }

    /// Unique identity of the transaction.
    pub fn xid(&self) -> Version {
        self.xid
    }

    pub fn start_version(&self) -> Version {
        self.start_version
    }

    /// Version assigned at the end of prepare, once.
    pub fn commit_version(&self) -> Option<Version> {
        *self.commit_version.lock()
    }

    /// Assigns the commit version. Returns `false` if one is already set.
    pub fn set_commit_version(&self, version: Version) -> bool {
        let mut slot = self.commit_version.lock();
        if slot.is_some() {
            return false;
        }
        debug_assert!(version > self.start_version);
        *slot = Some(version);
        true
    }

    pub fn end_version(&self) -> Option<Version> {
        *self.end_version.lock()
    }

    pub(crate) fn set_end_version(&self, version: Version) -> bool {
        let mut slot = self.end_version.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(version);
        true
    }

    pub fn concurrency(&self) -> TxConcurrency {
        self.concurrency
    }

    pub fn isolation(&self) -> TransactionIsolation {
        self.isolation
    }

    pub fn durability(&self) -> TxDurability {
        self.durability
    }

    pub fn flags(&self) -> TxFlags {
        self.flags
    }

    pub fn sync_commit(&self) -> bool {
        self.sync_commit
    }

    pub fn sync_rollback(&self) -> bool {
        self.sync_rollback
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn master_node_ids(&self) -> &BTreeSet<NodeId> {
        &self.master_node_ids
    }

    pub fn other_node_id(&self) -> Option<NodeId> {
        self.other_node_id
    }

    /// Remote nodes that took part in this transaction so far.
    pub fn node_ids(&self) -> BTreeSet<NodeId> {
        self.node_ids.lock().clone()
    }

    pub(crate) fn add_node_id(&self, node: NodeId) {
        self.node_ids.lock().insert(node);
    }

    /// Node on whose behalf cache events of this transaction are recorded.
    pub fn event_node_id(&self) -> NodeId {
        self.event_node_id
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn state(&self) -> TxState {
        TxState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves the transaction to `next` if that is a legal edge from the
    /// current state. Illegal transitions are rejected with `false`, so
    /// racing callers do not need to coordinate.
    pub fn set_state(&self, next: TxState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = TxState::from_u8(current);
            if !from.can_transition_to(next) {
                debug!("Tx {} rejected transition {:?} -> {:?}", self.xid, from, next);
                return false;
            }
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!("Tx {} state {:?} -> {:?}", self.xid, from, next);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Freezes the read and write sets.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Claims the finish phase. Only the first call returns `true`.
    pub fn mark_finalizing(&self) -> bool {
        self.finalizing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_finalizing(&self) -> bool {
        self.finalizing.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) -> bool {
        self.invalidate.load(Ordering::Acquire)
    }

    pub fn set_invalidate(&self, invalidate: bool) {
        self.invalidate.store(invalidate, Ordering::Release);
    }

    pub fn system_invalidate(&self) -> bool {
        self.system_invalidate.load(Ordering::Acquire)
    }

    pub fn set_system_invalidate(&self, invalidate: bool) {
        self.system_invalidate.store(invalidate, Ordering::Release);
    }

    /// A transaction with neither reads nor writes.
    pub fn is_empty(&self) -> bool {
        let entries = self.entries.lock();
        entries.reads.is_empty() && entries.writes.is_empty()
    }

    /// Time left until the deadline, `None` if the transaction has none.
    ///
    /// # Errors
    ///
    /// Once the deadline has passed, marks the transaction for rollback and
    /// returns `GridTxError::Timeout`.
    pub fn remaining_time(&self) -> Result<Option<Duration>> {
        let Some(deadline) = self.deadline else {
            return Ok(None);
        };
        let now = Instant::now();
        if now >= deadline {
            if self.state().is_pre_commit() {
                self.set_state(TxState::MarkedRollback);
            }
            return Err(GridTxError::Timeout { xid: self.xid });
        }
        Ok(Some(deadline - now))
    }

    pub(crate) fn is_timed_out(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Serializable validation applies to transactions started on this node.
    pub fn enforce_serializable(&self) -> bool {
        self.isolation == TransactionIsolation::Serializable && !self.flags.remote
    }

    /// Whether prepare must snapshot completed versions to validate reads.
    ///
    /// Pessimistic reads hold their locks, so only optimistic transactions
    /// need it.
    pub fn needs_completed_versions(&self) -> bool {
        self.enforce_serializable() && self.concurrency == TxConcurrency::Optimistic
    }

    pub fn set_completed_versions(&self, completed: CompletedVersions) {
        *self.completed_versions.lock() = Some(completed);
    }

    pub fn completed_versions(&self) -> Option<CompletedVersions> {
        self.completed_versions.lock().clone()
    }

    /// Topology version the transaction is bound to, if it accessed any key yet.
    pub fn topology_version(&self) -> Option<u32> {
        self.topology.topology_version()
    }

    /// Binds the transaction to `top_ver` unless it is already bound; returns
    /// the bound version.
    pub fn bind_topology(&self, top_ver: u32) -> u32 {
        self.topology.bind(top_ver)
    }

    pub fn add_invalid_partition(&self, partition: u32) {
        debug!("Tx {} partition {} invalidated", self.xid, partition);
        self.topology.add_invalid_partition(partition);
    }

    pub fn invalid_partitions(&self) -> BTreeSet<u32> {
        self.topology.invalid_partitions()
    }

    /// Partitions of the keys this transaction writes.
    pub fn write_partitions(&self) -> BTreeSet<u32> {
        self.entries
            .lock()
            .writes
            .values()
            .filter(|e| e.op().is_write())
            .map(|e| e.partition())
            .collect()
    }

    /// Reads `key`.
    ///
    /// Values written earlier in the transaction are returned as written.
    /// Under `RepeatableRead` and `Serializable` the first read of a key is
    /// recorded and later reads return the same value; pessimistic
    /// transactions lock the key first.
    ///
    /// # Panics
    ///
    /// Panics if the transaction is sealed.
    pub fn read(&self, key: &str) -> Result<Option<RecordBatch>> {
        self.read_filtered(key, None)
    }

    /// Reads `key`, returning `None` unless `filter` accepts the value.
    pub fn read_filtered(&self, key: &str, filter: Option<EntryFilter>) -> Result<Option<RecordBatch>> {
        let _guard = self.ctx.gateway.enter()?;
        self.check_active("read")?;
        let apply = |value: Option<RecordBatch>| match &filter {
            Some(f) if !f(value.as_ref()) => None,
            _ => value,
        };

        {
            let entries = self.entries.lock();
            if let Some(w) = entries.writes.get(key) {
                let value = match w.op() {
                    EntryOp::NoOp => w.snapshot_value().map(|v| v.as_ref().clone()),
                    _ => w.pending().cloned(),
                };
                return Ok(apply(value));
            }
            if self.isolation != TransactionIsolation::ReadCommitted {
                if let Some(r) = entries.reads.get(key) {
                    return Ok(apply(r.snapshot_value().map(|v| v.as_ref().clone())));
                }
            }
        }

        self.bind_topology(self.ctx.topology_version());
        let lock = self.concurrency == TxConcurrency::Pessimistic
            && self.isolation != TransactionIsolation::ReadCommitted;
        if lock {
            self.lock_key(key)?;
        }

        let current = self.ctx.store.get(key);
        let value = current.as_ref().map(|v| v.data().as_ref().clone());

        if self.isolation != TransactionIsolation::ReadCommitted {
            let mut entry = TxEntry::new(key.to_string(), EntryOp::Read, self.ctx.partition(key));
            entry.snapshot = current.as_ref().map(|v| v.version());
            entry.snapshot_value = current.map(|v| Arc::clone(v.data()));
            entry.explicit_lock = lock;
            entry.filter = filter.clone();
            self.entries
                .lock()
                .reads
                .entry(key.to_string())
                .or_insert(entry);
        }
        Ok(apply(value))
    }

    /// Stages `value` under `key`.
    ///
    /// # Panics
    ///
    /// Panics if the transaction is sealed.
    pub fn write(&self, key: impl Into<CacheKey>, value: RecordBatch) -> Result<()> {
        self.stage(key.into(), Some(value), None)
    }

    /// Stages `value` under `key`, to be applied only if `filter` accepts the
    /// value found under the key once it is locked. A rejected write becomes
    /// a no-op without failing the transaction.
    pub fn write_if(&self, key: impl Into<CacheKey>, value: RecordBatch, filter: EntryFilter) -> Result<()> {
        self.stage(key.into(), Some(value), Some(filter))
    }

    /// Stages a delete of `key`.
    pub fn remove(&self, key: impl Into<CacheKey>) -> Result<()> {
        self.stage(key.into(), None, None)
    }

    fn stage(&self, key: CacheKey, value: Option<RecordBatch>, filter: Option<EntryFilter>) -> Result<()> {
        let _guard = self.ctx.gateway.enter()?;
        self.check_active("write")?;
        self.bind_topology(self.ctx.topology_version());

        let pessimistic = self.concurrency == TxConcurrency::Pessimistic;
        if pessimistic {
            self.lock_key(&key)?;
        }

        let mut entries = self.entries.lock();
        let (snapshot, snapshot_value) = match entries.writes.get(&key).or_else(|| entries.reads.get(&key)) {
            Some(seen) => (seen.snapshot, seen.snapshot_value.clone()),
            None => {
                let current = self.ctx.store.get(&key);
                (
                    current.as_ref().map(|v| v.version()),
                    current.map(|v| Arc::clone(v.data())),
                )
            }
        };
        let op = match (&value, snapshot) {
            (None, _) => EntryOp::Delete,
            (Some(_), None) => EntryOp::Create,
            (Some(_), Some(_)) => EntryOp::Update,
        };

        let mut entry = TxEntry::new(key.clone(), op, self.ctx.partition(&key));
        entry.snapshot = snapshot;
        entry.snapshot_value = snapshot_value;
        entry.pending = value;
        entry.explicit_lock = pessimistic;
        entry.filter = filter;
        debug!("Tx {} staged {:?} on '{}'", self.xid, op, key);
        entries.writes.insert(key, entry);
        Ok(())
    }

    fn check_active(&self, op: &'static str) -> Result<()> {
        assert!(
            !self.is_sealed(),
            "tx {} is sealed, '{}' cannot add entries",
            self.xid,
            op
        );
        let state = self.state();
        if state != TxState::Active {
            return Err(GridTxError::InvalidState {
                xid: self.xid,
                state,
                op,
            });
        }
        self.remaining_time()?;
        Ok(())
    }

    pub fn has_read_key(&self, key: &str) -> bool {
        self.entries.lock().reads.contains_key(key)
    }

    pub fn has_write_key(&self, key: &str) -> bool {
        self.entries.lock().writes.contains_key(key)
    }

    /// Read entries in key order.
    pub fn read_set(&self) -> Vec<TxEntry> {
        self.entries.lock().reads.values().cloned().collect()
    }

    /// Write entries in key order.
    pub fn write_set(&self) -> Vec<TxEntry> {
        self.entries.lock().writes.values().cloned().collect()
    }

    /// The entry for `key`, the write entry taking precedence.
    pub fn entry(&self, key: &str) -> Option<TxEntry> {
        let entries = self.entries.lock();
        entries
            .writes
            .get(key)
            .or_else(|| entries.reads.get(key))
            .cloned()
    }

    /// The value staged for `key` without touching the cache:
    /// `Some(None)` for a staged delete, `None` if the key is not written.
    pub fn peek(&self, key: &str) -> Option<Option<RecordBatch>> {
        self.entries
            .lock()
            .writes
            .get(key)
            .filter(|e| e.op() != EntryOp::NoOp)
            .map(|e| e.pending().cloned())
    }

    pub fn is_removed(&self, key: &str) -> bool {
        self.entries
            .lock()
            .writes
            .get(key)
            .is_some_and(|e| e.op() == EntryOp::Delete)
    }

    pub(crate) fn entries_mut(&self) -> MutexGuard<'_, TxEntries> {
        self.entries.lock()
    }

    pub(crate) fn discard_pending(&self) {
        for entry in self.entries.lock().writes.values_mut() {
            entry.pending = None;
        }
    }

    /// Whether this transaction owns the lock on `key`.
    ///
    /// # Errors
    ///
    /// `GridTxError::EntryRemoved` if the key has no lock entry.
    pub fn owns_lock(&self, key: &str) -> Result<bool> {
        self.ctx.lock_table.owns_lock(key, self.xid)
    }

    /// Like [`Transaction::owns_lock`], treating a removed entry as not owned.
    pub fn owns_lock_unsafe(&self, key: &str) -> bool {
        self.ctx.lock_table.owns_lock_unsafe(key, self.xid)
    }

    /// Keys this transaction holds or waits for.
    pub fn locked_keys(&self) -> BTreeSet<CacheKey> {
        self.lock_keys.lock().clone()
    }

    /// Queues a lock candidate for `key` and waits until it owns the lock.
    pub(crate) fn lock_key(&self, key: &str) -> Result<()> {
        let owned = {
            let mut locks = self.lock_keys.lock();
            let state = self.state();
            if !matches!(state, TxState::Active | TxState::Preparing) {
                return Err(GridTxError::InvalidState {
                    xid: self.xid,
                    state,
                    op: "lock",
                });
            }
            locks.insert(key.to_string());
            let candidate = LockCandidate::new(key.to_string(), self.xid, self.ctx.clock.next());
            self.ctx.lock_table.enqueue(key.to_string(), candidate)
        };
        if owned {
            return Ok(());
        }
        debug!("Tx {} waits for lock on '{}'", self.xid, key);
        self.await_ownership(key)
    }

    fn await_ownership(&self, key: &str) -> Result<()> {
        loop {
            let event = match self.deadline {
                Some(deadline) => self.events_rx.recv_deadline(deadline).ok(),
                None => self.events_rx.recv().ok(),
            };
            match event {
                Some(LockEvent::OwnerChanged { key: granted, .. }) if granted == key => {
                    debug!("Tx {} acquired lock on '{}'", self.xid, key);
                    return Ok(());
                }
                Some(LockEvent::OwnerChanged { .. }) => continue,
                Some(LockEvent::Interrupted) | None => {
                    self.set_state(TxState::MarkedRollback);
                    if self.is_timed_out() {
                        return Err(GridTxError::Timeout { xid: self.xid });
                    }
                    return Err(GridTxError::InvalidState {
                        xid: self.xid,
                        state: self.state(),
                        op: "lock",
                    });
                }
            }
        }
    }

    /// Called by the lock table when this transaction's candidate on a key
    /// became owner. Returns `false` if the transaction no longer cares.
    pub(crate) fn on_owner_changed(&self, candidate: &LockCandidate) -> bool {
        let state = self.state();
        if state.is_terminal() || matches!(state, TxState::MarkedRollback | TxState::RollingBack) {
            return false;
        }
        self.events_tx
            .send(LockEvent::OwnerChanged {
                key: candidate.key().clone(),
                version: candidate.version(),
            })
            .is_ok()
    }

    /// Wakes the thread waiting for a lock, if any.
    pub(crate) fn interrupt(&self) {
        let _ = self.events_tx.send(LockEvent::Interrupted);
    }

    /// Releases every lock held or awaited. Returns the number of keys released.
    pub(crate) fn release_locks(&self) -> usize {
        let keys = std::mem::take(&mut *self.lock_keys.lock());
        for key in &keys {
            self.ctx.lock_table.release(key, self.xid);
        }
        keys.len()
    }

    pub fn finish_future(&self) -> FinishFuture {
        self.finish_rx.clone()
    }

    pub(crate) fn signal_finished(&self, outcome: TxOutcome) -> bool {
        match self.finish_tx.lock().take() {
            Some(sender) => sender.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Runs the prepare phase.
    ///
    /// # Errors
    ///
    /// Any prepare failure; the transaction is then marked for rollback.
    pub fn prepare(self: &Arc<Self>) -> Result<()> {
        let _guard = self.ctx.gateway.enter()?;
        PrepareCoordinator::new(Arc::clone(&self.ctx)).prepare(self)
    }

    /// Runs the prepare phase on a separate thread.
    pub fn prepare_async(self: &Arc<Self>) -> BoxFuture<'static, Result<()>> {
        let (sender, receiver) = oneshot::channel();
        let tx = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("gridtx-prepare-{}", self.xid.order()))
            .spawn(move || {
                let _ = sender.send(tx.prepare());
            });
        if let Err(e) = spawned {
            self.set_state(TxState::MarkedRollback);
            return futures::future::ready(Err(GridTxError::Other(format!(
                "failed to spawn prepare thread: {}",
                e
            ))))
            .boxed();
        }
        receiver
            .map(|res| {
                res.unwrap_or_else(|_| Err(GridTxError::Other("prepare thread vanished".to_string())))
            })
            .boxed()
    }

    /// Commits the transaction, preparing it first if needed.
    ///
    /// A failed prepare rolls the transaction back before the error is
    /// returned. [`TxOutcome::Unknown`] means remote participants did not
    /// confirm in time.
    pub fn commit(self: &Arc<Self>) -> Result<TxOutcome> {
        let _guard = self.ctx.gateway.enter()?;
        let finish = FinishTracker::new(Arc::clone(&self.ctx));

        match self.state() {
            TxState::Active if self.is_empty() => return finish.commit_empty(self),
            TxState::Active => {
                if let Err(e) = PrepareCoordinator::new(Arc::clone(&self.ctx)).prepare(self) {
                    if let Err(rollback_err) = finish.rollback(self) {
                        warn!("Rollback after failed prepare of tx {} failed: {}", self.xid, rollback_err);
                    }
                    return Err(e);
                }
            }
            TxState::Prepared => {}
            TxState::MarkedRollback => {
                let timed_out = self.is_timed_out();
                finish.rollback(self)?;
                return Err(if timed_out {
                    GridTxError::Timeout { xid: self.xid }
                } else {
                    GridTxError::InvalidState {
                        xid: self.xid,
                        state: TxState::MarkedRollback,
                        op: "commit",
                    }
                });
            }
            state => {
                return Err(GridTxError::InvalidState {
                    xid: self.xid,
                    state,
                    op: "commit",
                });
            }
        }
        finish.commit(self)
    }

    /// Rolls the transaction back. Calling it again after it finished returns
    /// the same outcome.
    pub fn rollback(self: &Arc<Self>) -> Result<TxOutcome> {
        FinishTracker::new(Arc::clone(&self.ctx)).rollback(self)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let state = self.state();
        if !state.is_terminal() {
            let released = self.release_locks();
            debug!(
                "Tx {} dropped in state {:?}, released {} locks",
                self.xid, state, released
            );
            let outcome = if state == TxState::Committing {
                TxOutcome::Unknown
            } else {
                TxOutcome::RolledBack
            };
            self.signal_finished(outcome);
        }
        self.ctx.registry.unregister(self.xid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridTxConfig;
    use crate::storage::NoopStorage;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};

    fn ctx() -> Arc<GridContext> {
        let ctx = Arc::new(GridContext::new(GridTxConfig::default(), Arc::new(NoopStorage)));
        ctx.gateway.start();
        ctx
    }

    fn batch(v: i32) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(vec![v]))]).unwrap()
    }

    fn begin(ctx: &Arc<GridContext>, concurrency: TxConcurrency) -> Arc<Transaction> {
        Transaction::new(
            Arc::clone(ctx),
            TxOptions::new(concurrency, TransactionIsolation::RepeatableRead, Duration::ZERO),
        )
    }

    #[test]
    fn versions_are_ordered() {
        let ctx = ctx();
        let tx = begin(&ctx, TxConcurrency::Optimistic);
        assert!(tx.start_version() < tx.xid());
        let cv = ctx.clock.next();
        assert!(tx.set_commit_version(cv));
        assert!(!tx.set_commit_version(ctx.clock.next()));
        assert_eq!(tx.commit_version(), Some(cv));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let ctx = ctx();
        let tx = begin(&ctx, TxConcurrency::Optimistic);
        assert!(!tx.set_state(TxState::Committed));
        assert!(tx.set_state(TxState::MarkedRollback));
        assert!(!tx.set_state(TxState::MarkedRollback));
        assert!(!tx.set_state(TxState::Preparing));
        assert_eq!(tx.state(), TxState::MarkedRollback);
    }

    #[test]
    fn own_writes_are_visible() {
        let ctx = ctx();
        let tx = begin(&ctx, TxConcurrency::Optimistic);
        assert!(tx.is_empty());
        tx.write("a", batch(1)).unwrap();
        assert_eq!(tx.read("a").unwrap(), Some(batch(1)));
        tx.remove("a").unwrap();
        assert!(tx.is_removed("a"));
        assert_eq!(tx.peek("a"), Some(None));
        assert_eq!(tx.read("a").unwrap(), None);
        assert!(!tx.is_empty());
    }

    #[test]
    fn pessimistic_write_locks_eagerly() {
        let ctx = ctx();
        let tx = begin(&ctx, TxConcurrency::Pessimistic);
        tx.write("a", batch(1)).unwrap();
        assert!(tx.owns_lock("a").unwrap());
        assert!(tx.entry("a").unwrap().explicit_lock());

        let opt = begin(&ctx, TxConcurrency::Optimistic);
        opt.write("b", batch(1)).unwrap();
        assert!(!ctx.lock_table.is_locked("b"));
    }

    #[test]
    #[should_panic(expected = "sealed")]
    fn adding_entries_after_seal_panics() {
        let ctx = ctx();
        let tx = begin(&ctx, TxConcurrency::Optimistic);
        tx.seal();
        let _ = tx.write("a", batch(1));
    }

    #[test]
    fn expired_deadline_marks_rollback() {
        let ctx = ctx();
        let tx = Transaction::new(
            Arc::clone(&ctx),
            TxOptions::new(
                TxConcurrency::Optimistic,
                TransactionIsolation::ReadCommitted,
                Duration::from_millis(1),
            ),
        );
        thread::sleep(Duration::from_millis(5));
        assert_eq!(tx.remaining_time(), Err(GridTxError::Timeout { xid: tx.xid() }));
        assert_eq!(tx.state(), TxState::MarkedRollback);
    }

    #[test]
    fn finished_transaction_is_not_interested_in_locks() {
        let ctx = ctx();
        let tx = begin(&ctx, TxConcurrency::Pessimistic);
        let candidate = LockCandidate::new("a".into(), tx.xid(), ctx.clock.next());
        assert!(tx.on_owner_changed(&candidate));
        tx.rollback().unwrap();
        assert!(!tx.on_owner_changed(&candidate));
    }

    #[test]
    fn reads_and_writes_are_refused_once_stopping() {
        let ctx = ctx();
        let tx = begin(&ctx, TxConcurrency::Pessimistic);
        tx.write("a", batch(1)).unwrap();
        assert!(ctx.gateway.begin_stop());

        assert_eq!(tx.write("x", batch(2)), Err(GridTxError::GatewayClosed));
        assert_eq!(tx.remove("a"), Err(GridTxError::GatewayClosed));
        assert_eq!(tx.read("y"), Err(GridTxError::GatewayClosed));
        assert!(!ctx.lock_table.is_locked("x"));
        assert!(!tx.has_write_key("x"));
        assert!(!tx.has_read_key("y"));
        assert_eq!(tx.state(), TxState::Active);
    }

    #[test]
    fn dropping_an_active_transaction_releases_its_locks() {
        let ctx = ctx();
        let tx = begin(&ctx, TxConcurrency::Pessimistic);
        tx.write("a", batch(1)).unwrap();
        let finished = tx.finish_future();
        drop(tx);
        assert!(!ctx.lock_table.is_locked("a"));
        assert!(ctx.registry.is_empty());
        assert_eq!(futures::executor::block_on(finished), TxOutcome::RolledBack);
    }
}
