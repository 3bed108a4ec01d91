use parking_lot::RwLock;
use std::sync::Arc;

use crate::config::GridTxConfig;
use crate::conflict::completed::CompletedVersionTracker;
use crate::data_store::cache_store::CacheStore;
use crate::gateway::{CacheGateway, DeferredEvictions};
use crate::mvcc::lock_table::LockTable;
use crate::preload::PreloadSignal;
use crate::registry::TxRegistry;
use crate::storage::Storage;
use crate::topology::TopologySnapshot;
use crate::twopc::messages::Transport;
use crate::util::log_throttle::LogThrottle;
use crate::version::VersionClock;
use crate::NodeId;

/// Node-wide state shared by every transaction of a [`GridTx`](crate::gridtx::GridTx).
pub struct GridContext {
    pub(crate) config: GridTxConfig,
    pub(crate) clock: VersionClock,
    pub(crate) registry: Arc<TxRegistry>,
    pub(crate) lock_table: LockTable,
    pub(crate) store: CacheStore,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) completed: CompletedVersionTracker,
    pub(crate) topology: RwLock<TopologySnapshot>,
    pub(crate) transport: RwLock<Option<Arc<dyn Transport>>>,
    pub(crate) gateway: CacheGateway,
    pub(crate) evictions: Arc<DeferredEvictions>,
    pub(crate) log_throttle: Arc<LogThrottle>,
}

impl GridContext {
    pub(crate) fn new(config: GridTxConfig, storage: Arc<dyn Storage>) -> Self {
        let registry = Arc::new(TxRegistry::new());
        let evictions = Arc::new(DeferredEvictions::new());
        let log_throttle = Arc::new(LogThrottle::new(config.log_throttle_timeout));
        let preload = Arc::new(if config.await_preload {
            PreloadSignal::pending()
        } else {
            PreloadSignal::completed()
        });

        let topology = TopologySnapshot::new(1, [config.node_id], config.partitions, config.backups);
        let clock = VersionClock::new(config.node_order);
        clock.set_topology_version(topology.version());

        Self {
            clock,
            lock_table: LockTable::new(config.lock_table_shards, Arc::clone(&registry)),
            registry,
            store: CacheStore::new(),
            storage,
            completed: CompletedVersionTracker::new(
                config.completed_versions_cleanup_threshold,
                config.completed_versions_max_age,
            ),
            topology: RwLock::new(topology),
            transport: RwLock::new(None),
            gateway: CacheGateway::new(
                preload,
                config.preload_wait_timeout,
                Arc::clone(&evictions),
                Arc::clone(&log_throttle),
            ),
            evictions,
            log_throttle,
            config,
        }
    }

    pub fn config(&self) -> &GridTxConfig {
        &self.config
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn clock(&self) -> &VersionClock {
        &self.clock
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn lock_table(&self) -> &LockTable {
        &self.lock_table
    }

    pub fn registry(&self) -> &TxRegistry {
        &self.registry
    }

    pub fn gateway(&self) -> &CacheGateway {
        &self.gateway
    }

    /// A copy of the current topology.
    pub fn topology(&self) -> TopologySnapshot {
        self.topology.read().clone()
    }

    pub fn topology_version(&self) -> u32 {
        self.topology.read().version()
    }

    pub fn partition(&self, key: &str) -> u32 {
        self.topology.read().partition(key)
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().clone()
    }

    pub(crate) fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.write() = Some(transport);
    }
}
