use std::sync::Arc;
use std::time::Duration;

use gridtx::distributed::{BackupNode, LocalNetwork};
use gridtx::prelude::*;

use crate::common::MockStorage;

pub mod backup_tests;
pub mod network_tests;

/// A primary node with one backup on a shared in-process network.
pub struct Cluster {
    pub grid: Arc<GridTx>,
    pub storage: Arc<MockStorage>,
    pub backup: BackupNode,
    pub network: Arc<LocalNetwork>,
}

pub const PARTITIONS: u32 = 16;

/// Starts node 1 as a grid node and node 2 as its backup, then moves the
/// topology to include both so every partition is owned by both nodes.
pub fn setup_cluster(finish_timeout: Duration) -> Cluster {
    let network = Arc::new(LocalNetwork::new());
    let config = GridTxConfig::default()
        .with_node(1, 1)
        .with_partitions(PARTITIONS, 1)
        .with_finish_timeout(finish_timeout);
    let storage = Arc::new(MockStorage::new());
    let grid = GridTx::new(config, storage.clone())
        .unwrap()
        .with_transport(network.clone());
    let grid = Arc::new(grid);
    let backup = BackupNode::spawn(2, 2, PARTITIONS, network.clone()).unwrap();
    grid.on_topology_change([1, 2]);
    Cluster {
        grid,
        storage,
        backup,
        network,
    }
}

pub fn begin(grid: &GridTx, durability: TxDurability) -> Arc<Transaction> {
    grid.begin_with(
        TxOptions::new(
            TxConcurrency::Pessimistic,
            TransactionIsolation::RepeatableRead,
            Duration::from_secs(5),
        )
        .with_durability(durability),
    )
    .unwrap()
}
