use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::transaction::state::TxConcurrency;
use crate::{NodeId, TransactionIsolation};

/// Node-level configuration of the transaction core.
///
/// Durations are (de)serialized as `{ secs, nanos }` through serde's standard
/// `Duration` representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridTxConfig {
    /// Identity of this node in the cluster.
    pub node_id: NodeId,
    /// Order of this node, embedded in every version it issues.
    pub node_order: u32,
    pub default_concurrency: TxConcurrency,
    pub default_isolation: TransactionIsolation,
    /// Default transaction timeout. Zero means no deadline.
    pub default_timeout: Duration,
    /// Wait for backup acknowledgment when committing.
    pub sync_commit: bool,
    /// Wait for backup acknowledgment when rolling back.
    pub sync_rollback: bool,
    /// How long a synchronous finish waits for remote participants before the
    /// outcome is declared unknown.
    pub finish_timeout: Duration,
    pub partitions: u32,
    /// Number of backup copies of each partition.
    pub backups: u32,
    pub lock_table_shards: usize,
    pub completed_versions_max_age: Duration,
    pub completed_versions_cleanup_threshold: u64,
    /// Window within which identical warnings are logged only once.
    pub log_throttle_timeout: Duration,
    /// How long `enter` waits for the preloader before failing.
    /// `None` waits indefinitely.
    pub preload_wait_timeout: Option<Duration>,
    /// When `false` the preload signal starts out completed.
    pub await_preload: bool,
}

impl Default for GridTxConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            node_order: 1,
            default_concurrency: TxConcurrency::Pessimistic,
            default_isolation: TransactionIsolation::RepeatableRead,
            default_timeout: Duration::ZERO,
            sync_commit: true,
            sync_rollback: false,
            finish_timeout: Duration::from_secs(10),
            partitions: 1024,
            backups: 0,
            lock_table_shards: 64,
            completed_versions_max_age: Duration::from_secs(60),
            completed_versions_cleanup_threshold: 1000,
            log_throttle_timeout: Duration::from_secs(5),
            preload_wait_timeout: None,
            await_preload: false,
        }
    }
}

impl GridTxConfig {
    pub fn with_node(mut self, node_id: NodeId, node_order: u32) -> Self {
        self.node_id = node_id;
        self.node_order = node_order;
        self
    }

    pub fn with_defaults(
        mut self,
        concurrency: TxConcurrency,
        isolation: TransactionIsolation,
        timeout: Duration,
    ) -> Self {
        self.default_concurrency = concurrency;
        self.default_isolation = isolation;
        self.default_timeout = timeout;
        self
    }

    pub fn with_sync_commit(mut self, sync_commit: bool) -> Self {
        self.sync_commit = sync_commit;
        self
    }

    pub fn with_sync_rollback(mut self, sync_rollback: bool) -> Self {
        self.sync_rollback = sync_rollback;
        self
    }

    pub fn with_finish_timeout(mut self, timeout: Duration) -> Self {
        self.finish_timeout = timeout;
        self
    }

    pub fn with_partitions(mut self, partitions: u32, backups: u32) -> Self {
        self.partitions = partitions.max(1);
        self.backups = backups;
        self
    }

    pub fn with_lock_table_shards(mut self, shards: usize) -> Self {
        self.lock_table_shards = shards.max(1);
        self
    }

    pub fn with_completed_versions_retention(mut self, max_age: Duration, cleanup_threshold: u64) -> Self {
        self.completed_versions_max_age = max_age;
        self.completed_versions_cleanup_threshold = cleanup_threshold;
        self
    }

    pub fn with_log_throttle_timeout(mut self, timeout: Duration) -> Self {
        self.log_throttle_timeout = timeout;
        self
    }

    /// Makes the gateway hold operations until [`PreloadSignal::complete`]
    /// (or `fail`) is called, waiting at most `timeout` per call.
    ///
    /// [`PreloadSignal::complete`]: crate::preload::PreloadSignal::complete
    pub fn with_preload_wait(mut self, timeout: Option<Duration>) -> Self {
        self.await_preload = true;
        self.preload_wait_timeout = timeout;
        self
    }
}
