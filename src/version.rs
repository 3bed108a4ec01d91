use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A version stamp used to order transactions and detect conflicts.
///
/// Versions are totally ordered first by their cluster `order`, then by the
/// issuing node's `node_order`, then by the topology version they were issued
/// under. The cluster order is merged between nodes on message receipt, so
/// versions issued anywhere in the cluster are comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Version {
    order: u64,
    node_order: u32,
    topology_version: u32,
}

impl Version {
    pub const ZERO: Version = Version {
        order: 0,
        node_order: 0,
        topology_version: 0,
    };

    pub const fn new(order: u64, node_order: u32, topology_version: u32) -> Self {
        Self {
            order,
            node_order,
            topology_version,
        }
    }

    pub fn order(&self) -> u64 {
        self.order
    }

    pub fn node_order(&self) -> u32 {
        self.node_order
    }

    pub fn topology_version(&self) -> u32 {
        self.topology_version
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ver[order={}, node={}, top={}]",
            self.order, self.node_order, self.topology_version
        )
    }
}

/// Issues strictly increasing versions for the local node.
///
/// The clock is a lock-free counter: concurrent callers never observe a lost
/// or duplicated value, and issued versions are never rolled back.
#[derive(Debug)]
pub struct VersionClock {
    node_order: u32,
    order: AtomicU64,
    topology_version: AtomicU32,
}

impl VersionClock {
    /// Creates a clock for the node with the given order.
    pub fn new(node_order: u32) -> Self {
        Self {
            node_order,
            order: AtomicU64::new(0),
            topology_version: AtomicU32::new(0),
        }
    }

    /// Issues the next version.
    ///
    /// The returned version is strictly greater than every version previously
    /// issued by this clock.
    pub fn next(&self) -> Version {
        let order = self.order.fetch_add(1, Ordering::SeqCst) + 1;
        Version::new(
            order,
            self.node_order,
            self.topology_version.load(Ordering::Acquire),
        )
    }

    /// Returns the last issued version without advancing the clock.
    pub fn last(&self) -> Version {
        Version::new(
            self.order.load(Ordering::SeqCst),
            self.node_order,
            self.topology_version.load(Ordering::Acquire),
        )
    }

    /// Merges a version received from another node, so that every version
    /// issued afterwards orders after it.
    pub fn on_remote(&self, remote: Version) {
        let prev = self.order.fetch_max(remote.order(), Ordering::SeqCst);
        if prev < remote.order() {
            debug!("Clock advanced from {} to {} by remote version {}", prev, remote.order(), remote);
        }
    }

    /// Stamps subsequently issued versions with a new topology version.
    pub fn set_topology_version(&self, topology_version: u32) {
        self.topology_version
            .fetch_max(topology_version, Ordering::AcqRel);
    }

    pub fn node_order(&self) -> u32 {
        self.node_order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn versions_are_strictly_increasing() {
        let clock = VersionClock::new(1);
        let a = clock.next();
        let b = clock.next();
        assert!(b > a);
        assert_eq!(clock.last(), b);
    }

    #[test]
    fn concurrent_issuance_has_no_duplicates() {
        let clock = Arc::new(VersionClock::new(3));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = Arc::clone(&clock);
                thread::spawn(move || (0..1000).map(|_| clock.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<Version> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("issuer panicked"))
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
    }

    #[test]
    fn remote_versions_are_merged() {
        let clock = VersionClock::new(1);
        clock.next();
        let remote = Version::new(100, 2, 0);
        clock.on_remote(remote);
        assert!(clock.next() > remote);
    }

    #[test]
    fn node_order_breaks_ties() {
        let a = Version::new(5, 1, 0);
        let b = Version::new(5, 2, 0);
        assert!(a < b);
    }
}
