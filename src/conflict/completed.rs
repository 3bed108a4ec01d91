use ahash::AHashSet as HashSet;
use log::debug;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::errors::{GridTxError, Result};
use crate::version::Version;
use crate::CacheKey;

/// Which transactions finished after a given base version.
///
/// A transaction that must see a serializable view of the cache takes a
/// snapshot at prepare time and validates its read set against the writes of
/// every transaction committed after its start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletedVersions {
    base: Version,
    committed: BTreeSet<Version>,
    rolled_back: BTreeSet<Version>,
}

impl CompletedVersions {
    pub fn new(base: Version, committed: BTreeSet<Version>, rolled_back: BTreeSet<Version>) -> Self {
        Self {
            base,
            committed,
            rolled_back,
        }
    }

    pub fn base(&self) -> Version {
        self.base
    }

    /// Commit versions of transactions committed after the base.
    pub fn committed(&self) -> &BTreeSet<Version> {
        &self.committed
    }

    /// Xids of transactions rolled back after the base.
    pub fn rolled_back(&self) -> &BTreeSet<Version> {
        &self.rolled_back
    }

    pub fn is_rolled_back(&self, xid: Version) -> bool {
        self.rolled_back.contains(&xid)
    }
}

#[derive(Debug, Clone)]
enum Completion {
    Committed {
        commit_version: Version,
        write_keys: HashSet<CacheKey>,
    },
    RolledBack,
}

#[derive(Debug, Clone)]
struct CompletedInfo {
    completion: Completion,
    finished_at: Instant,
}

/// Remembers recently finished transactions for serializable validation.
///
/// Entries are kept for `max_age` and swept every `cleanup_threshold`
/// recordings.
pub struct CompletedVersionTracker {
    // Keyed by xid.
    completed: RwLock<BTreeMap<Version, CompletedInfo>>,
    cleanup_counter: AtomicU64,
    cleanup_threshold: u64,
    max_age: Duration,
}

impl Default for CompletedVersionTracker {
    fn default() -> Self {
        Self::new(1000, Duration::from_secs(60))
    }
}

impl CompletedVersionTracker {
    pub fn new(cleanup_threshold: u64, max_age: Duration) -> Self {
        Self {
            completed: RwLock::new(BTreeMap::new()),
            cleanup_counter: AtomicU64::new(0),
            cleanup_threshold: cleanup_threshold.max(1),
            max_age,
        }
    }

    pub fn record_committed(
        &self,
        xid: Version,
        commit_version: Version,
        write_keys: HashSet<CacheKey>,
    ) {
        self.completed.write().insert(
            xid,
            CompletedInfo {
                completion: Completion::Committed {
                    commit_version,
                    write_keys,
                },
                finished_at: Instant::now(),
            },
        );
        debug!("Recorded tx {} as committed at {}", xid, commit_version);
        self.maybe_trigger_cleanup();
    }

    pub fn record_rolled_back(&self, xid: Version) {
        self.completed.write().insert(
            xid,
            CompletedInfo {
                completion: Completion::RolledBack,
                finished_at: Instant::now(),
            },
        );
        debug!("Recorded tx {} as rolled back", xid);
        self.maybe_trigger_cleanup();
    }

    /// Snapshot of everything that finished after `base`.
    pub fn snapshot(&self, base: Version) -> CompletedVersions {
        let completed = self.completed.read();
        let mut committed = BTreeSet::new();
        let mut rolled_back = BTreeSet::new();
        for (xid, info) in completed.iter() {
            match &info.completion {
                Completion::Committed { commit_version, .. } if *commit_version > base => {
                    committed.insert(*commit_version);
                }
                Completion::RolledBack if *xid > base => {
                    rolled_back.insert(*xid);
                }
                _ => {}
            }
        }
        CompletedVersions::new(base, committed, rolled_back)
    }

    /// Checks that no transaction in `snapshot.committed()` wrote a key of
    /// `reads` after the version at which it was observed.
    ///
    /// `reads` pairs every read key with the version observed; a key read as
    /// absent is checked against the snapshot base.
    ///
    /// # Errors
    ///
    /// Returns `GridTxError::SerializabilityViolation` naming the first
    /// invalidated key.
    pub fn validate_serializable(
        &self,
        xid: Version,
        reads: &[(CacheKey, Option<Version>)],
        snapshot: &CompletedVersions,
    ) -> Result<()> {
        if snapshot.committed().is_empty() || reads.is_empty() {
            return Ok(());
        }

        let completed = self.completed.read();
        for (other, info) in completed.iter().filter(|(other, _)| **other != xid) {
            let Completion::Committed {
                commit_version,
                write_keys,
            } = &info.completion
            else {
                continue;
            };
            if !snapshot.committed().contains(commit_version) {
                continue;
            }
            for (key, observed) in reads {
                let seen = observed.unwrap_or(snapshot.base());
                if *commit_version > seen && write_keys.contains(key) {
                    debug!(
                        "Tx {} read '{}' at {}, overwritten by tx {} committed at {}",
                        xid, key, seen, other, commit_version
                    );
                    return Err(GridTxError::SerializabilityViolation { key: key.clone() });
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.completed.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.read().is_empty()
    }

    fn maybe_trigger_cleanup(&self) {
        let count = self.cleanup_counter.fetch_add(1, Ordering::Relaxed);
        if count + 1 >= self.cleanup_threshold {
            self.cleanup_counter.store(0, Ordering::Relaxed);
            self.cleanup_old();
        }
    }

    fn cleanup_old(&self) {
        let now = Instant::now();
        let mut completed = self.completed.write();
        let initial = completed.len();
        completed.retain(|_, info| now.duration_since(info.finished_at) < self.max_age);
        let removed = initial - completed.len();
        if removed > 0 {
            debug!("Cleaned up {} completed transaction records", removed);
        }
    }
}
