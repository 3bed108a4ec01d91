use arrow::record_batch::RecordBatch;
use log::{debug, info};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GridTxConfig;
use crate::context::GridContext;
use crate::data_store::cache_store::CacheStore;
use crate::errors::Result;
use crate::gateway::{CacheGateway, EvictionListener, LifecycleObserver};
use crate::mvcc::lock_table::LockTable;
use crate::preload::PreloadSignal;
use crate::storage::Storage;
use crate::timeout::TimeoutProcessor;
use crate::topology::TopologySnapshot;
use crate::transaction::state::{TxConcurrency, TxFlags, TxOutcome};
use crate::transaction::{Transaction, TxOptions};
use crate::twopc::messages::Transport;
use crate::version::VersionClock;
use crate::{CacheKey, NodeId, TransactionIsolation};

/// Gridtx Prelude
pub mod prelude {
    pub use crate::config::*;
    pub use crate::conflict::completed::*;
    pub use crate::conflict::detection::*;
    pub use crate::data_store::cache_store::*;
    pub use crate::data_store::versioned_value::*;
    pub use crate::errors::*;
    pub use crate::gateway::*;
    pub use crate::gridtx::GridTx;
    pub use crate::mvcc::candidate::*;
    pub use crate::mvcc::lock_table::*;
    pub use crate::preload::*;
    pub use crate::storage::*;
    pub use crate::topology::*;
    pub use crate::transaction::entry::*;
    pub use crate::transaction::state::*;
    pub use crate::transaction::*;
    pub use crate::twopc::messages::*;
    pub use crate::twopc::*;
    pub use crate::version::*;
    pub use crate::{CacheKey, NodeId, TransactionIsolation};
}

/// The main entry point of the transactional core of one grid node.
pub struct GridTx {
    ctx: Arc<GridContext>,
    timeouts: TimeoutProcessor,
}

impl GridTx {
    /// Creates a node with the given configuration and write-through storage.
    ///
    /// # Errors
    ///
    /// Fails if the timeout worker cannot be started.
    pub fn new(config: GridTxConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        let ctx = Arc::new(GridContext::new(config, storage));
        let timeouts = TimeoutProcessor::start()?;
        ctx.gateway.start();
        info!(
            "Grid node {} started (order {}, {} partitions, {} backups)",
            ctx.config.node_id, ctx.config.node_order, ctx.config.partitions, ctx.config.backups
        );
        Ok(Self { ctx, timeouts })
    }

    /// Connects the node to remote participants.
    pub fn with_transport(self, transport: Arc<dyn Transport>) -> Self {
        self.ctx.set_transport(transport);
        self
    }

    pub fn context(&self) -> &Arc<GridContext> {
        &self.ctx
    }

    pub fn node_id(&self) -> NodeId {
        self.ctx.node_id()
    }

    pub fn gateway(&self) -> &CacheGateway {
        &self.ctx.gateway
    }

    /// Signal the rebalancer completes once it has started.
    pub fn preloader(&self) -> &Arc<PreloadSignal> {
        self.ctx.gateway.preload()
    }

    pub fn store(&self) -> &CacheStore {
        &self.ctx.store
    }

    pub fn lock_table(&self) -> &LockTable {
        &self.ctx.lock_table
    }

    pub fn clock(&self) -> &VersionClock {
        &self.ctx.clock
    }

    pub fn topology(&self) -> TopologySnapshot {
        self.ctx.topology()
    }

    /// Starts a transaction.
    ///
    /// A zero `timeout` means no deadline.
    ///
    /// # Errors
    ///
    /// `GatewayClosed` once the node is stopping.
    pub fn begin(
        &self,
        concurrency: TxConcurrency,
        isolation: TransactionIsolation,
        timeout: Duration,
    ) -> Result<Arc<Transaction>> {
        self.begin_with(TxOptions::new(concurrency, isolation, timeout))
    }

    /// Starts a transaction with the configured defaults.
    pub fn begin_default(&self) -> Result<Arc<Transaction>> {
        let config = &self.ctx.config;
        self.begin(
            config.default_concurrency,
            config.default_isolation,
            config.default_timeout,
        )
    }

    pub fn begin_with(&self, opts: TxOptions) -> Result<Arc<Transaction>> {
        let _guard = self.ctx.gateway.enter()?;
        let tx = Transaction::new(Arc::clone(&self.ctx), opts);
        self.timeouts.track(&tx);
        Ok(tx)
    }

    /// Reads the committed value of `key` outside any transaction.
    pub fn get(&self, key: &str) -> Result<Option<RecordBatch>> {
        let _guard = self.ctx.gateway.enter()?;
        Ok(self.ctx.store.get(key).map(|v| v.data().as_ref().clone()))
    }

    /// Writes `key` in an implicit single-key transaction.
    pub fn put(&self, key: impl Into<CacheKey>, value: RecordBatch) -> Result<TxOutcome> {
        let _guard = self.ctx.gateway.enter()?;
        let tx = self.implicit()?;
        tx.write(key, value)?;
        tx.commit()
    }

    /// Deletes `key` in an implicit single-key transaction.
    pub fn remove(&self, key: impl Into<CacheKey>) -> Result<TxOutcome> {
        let _guard = self.ctx.gateway.enter()?;
        let tx = self.implicit()?;
        tx.remove(key)?;
        tx.commit()
    }

    fn implicit(&self) -> Result<Arc<Transaction>> {
        let config = &self.ctx.config;
        let flags = TxFlags {
            implicit_single: true,
            ..TxFlags::local()
        };
        self.begin_with(
            TxOptions::new(
                TxConcurrency::Pessimistic,
                TransactionIsolation::RepeatableRead,
                config.default_timeout,
            )
            .with_flags(flags),
        )
    }

    /// Evicts `key` from memory unless a transaction holds its lock.
    ///
    /// The eviction listener is notified when the operation leaves the gateway.
    pub fn evict(&self, key: &str) -> Result<bool> {
        let _guard = self.ctx.gateway.enter()?;
        if self.ctx.lock_table.is_locked(key) {
            debug!("Key '{}' is locked, not evicting", key);
            return Ok(false);
        }
        let evicted = self.ctx.store.evict(key);
        if evicted {
            self.ctx.evictions.defer(key.to_string());
        }
        Ok(evicted)
    }

    pub fn set_eviction_listener(&self, listener: Arc<dyn EvictionListener>) {
        self.ctx.evictions.set_listener(listener);
    }

    pub fn add_lifecycle_observer(&self, observer: Arc<dyn LifecycleObserver>) {
        self.ctx.gateway.add_observer(observer);
    }

    /// Applies a new cluster membership.
    ///
    /// Bumps the topology version and records the partitions that changed
    /// owners as invalid in every transaction bound to an older topology.
    /// Returns the changed partitions.
    pub fn on_topology_change(&self, nodes: impl IntoIterator<Item = NodeId>) -> BTreeSet<u32> {
        let (version, changed) = {
            let mut topology = self.ctx.topology.write();
            let (next, changed) = topology.update(nodes);
            *topology = next;
            (topology.version(), changed)
        };
        self.ctx.clock.set_topology_version(version);
        info!(
            "Topology changed to version {}, {} partitions moved",
            version,
            changed.len()
        );

        if !changed.is_empty() {
            for tx in self.ctx.registry.active() {
                if tx.topology_version().is_some_and(|v| v < version) {
                    for p in &changed {
                        tx.add_invalid_partition(*p);
                    }
                }
            }
        }
        changed
    }

    /// Number of transactions that have not finished yet.
    pub fn active_transactions(&self) -> usize {
        self.ctx
            .registry
            .active()
            .iter()
            .filter(|tx| !tx.state().is_terminal())
            .count()
    }

    /// Stops the node: waits for admitted operations, closes the gateway,
    /// rolls back every unfinished transaction and stops the timeout worker.
    /// A second call has no effect.
    pub fn stop(&self) {
        if !self.ctx.gateway.begin_stop() {
            return;
        }
        for tx in self.ctx.registry.active() {
            if tx.state().is_terminal() {
                continue;
            }
            if let Err(e) = tx.rollback() {
                debug!("Could not roll back tx {} on stop: {}", tx.xid(), e);
            }
        }
        self.timeouts.stop();
        self.ctx.gateway.finish_stop();
    }
}

impl Drop for GridTx {
    fn drop(&mut self) {
        self.timeouts.stop();
    }
}
