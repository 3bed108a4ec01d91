use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel meaning "no topology version bound yet".
const UNBOUND: u64 = 0;

/// Binds a transaction to one topology version and collects the partitions
/// that moved away while it was running.
#[derive(Debug, Default)]
pub struct TopologyGuard {
    // Stored off by one so that topology version 0 can still be bound.
    bound: AtomicU64,
    invalid: Mutex<BTreeSet<u32>>,
}

impl TopologyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `top_ver` unless a version is already bound.
    ///
    /// The first caller wins; every caller, the first included, gets the
    /// bound version back.
    pub fn bind(&self, top_ver: u32) -> u32 {
        let encoded = u64::from(top_ver) + 1;
        match self
            .bound
            .compare_exchange(UNBOUND, encoded, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => top_ver,
            Err(current) => (current - 1) as u32,
        }
    }

    /// The bound topology version, if any.
    pub fn topology_version(&self) -> Option<u32> {
        match self.bound.load(Ordering::Acquire) {
            UNBOUND => None,
            v => Some((v - 1) as u32),
        }
    }

    /// Records a partition invalidated by a topology change. The set only grows.
    pub fn add_invalid_partition(&self, partition: u32) {
        self.invalid.lock().insert(partition);
    }

    pub fn invalid_partitions(&self) -> BTreeSet<u32> {
        self.invalid.lock().clone()
    }

    pub fn is_invalid(&self, partition: u32) -> bool {
        self.invalid.lock().contains(&partition)
    }
}
