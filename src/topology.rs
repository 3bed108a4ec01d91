use ahash::RandomState;
use std::collections::BTreeSet;

use crate::NodeId;

// Fixed seeds so that every node of an in-process cluster maps keys to the
// same partitions.
const PARTITION_SEEDS: (u64, u64, u64, u64) = (
    0x5851_f42d_4c95_7f2d,
    0x1405_7b7e_f767_814f,
    0x2545_f491_4f6c_dd1d,
    0x9e37_79b9_7f4a_7c15,
);

/// Maps a key to its partition.
pub fn partition_of(key: &str, partitions: u32) -> u32 {
    let hasher = RandomState::with_seeds(
        PARTITION_SEEDS.0,
        PARTITION_SEEDS.1,
        PARTITION_SEEDS.2,
        PARTITION_SEEDS.3,
    );
    (hasher.hash_one(key) % u64::from(partitions.max(1))) as u32
}

/// Partition ownership under one topology version.
///
/// Partition `p` is owned by `backups + 1` consecutive nodes of the sorted
/// node list, starting at index `p % nodes`; the first one is the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySnapshot {
    version: u32,
    nodes: Vec<NodeId>,
    partitions: u32,
    backups: u32,
}

impl TopologySnapshot {
    pub fn new(version: u32, nodes: impl IntoIterator<Item = NodeId>, partitions: u32, backups: u32) -> Self {
        let nodes: BTreeSet<NodeId> = nodes.into_iter().collect();
        Self {
            version,
            nodes: nodes.into_iter().collect(),
            partitions: partitions.max(1),
            backups,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    pub fn partition(&self, key: &str) -> u32 {
        partition_of(key, self.partitions)
    }

    /// Primary and backup owners of `partition`, primary first.
    pub fn owners(&self, partition: u32) -> Vec<NodeId> {
        if self.nodes.is_empty() {
            return Vec::new();
        }
        let copies = ((self.backups + 1) as usize).min(self.nodes.len());
        let start = partition as usize % self.nodes.len();
        (0..copies)
            .map(|i| self.nodes[(start + i) % self.nodes.len()])
            .collect()
    }

    pub fn primary(&self, partition: u32) -> Option<NodeId> {
        self.owners(partition).first().copied()
    }

    /// Builds the next topology for the given membership and returns it with
    /// the partitions whose owners changed.
    pub fn update(&self, nodes: impl IntoIterator<Item = NodeId>) -> (TopologySnapshot, BTreeSet<u32>) {
        let next = TopologySnapshot::new(self.version + 1, nodes, self.partitions, self.backups);
        let changed = (0..self.partitions)
            .filter(|p| self.owners(*p) != next.owners(*p))
            .collect();
        (next, changed)
    }
}
