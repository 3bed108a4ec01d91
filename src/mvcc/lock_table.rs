use ahash::{AHashMap as HashMap, RandomState};
use log::debug;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::errors::{GridTxError, Result};
use crate::mvcc::candidate::LockCandidate;
use crate::registry::TxRegistry;
use crate::transaction::Transaction;
use crate::version::Version;
use crate::CacheKey;

/// Candidates queued for one key.
///
/// Invariant: when the queue is non-empty its front candidate is the owner,
/// and it is the only owner.
type KeyQueue = VecDeque<LockCandidate>;

/// Per-key queues of lock candidates.
///
/// The table is the single source of truth for lock ownership. Ownership is
/// handed over on [`LockTable::release`] by pushing an owner-changed
/// notification to the next candidate's transaction; waiters never poll the
/// table.
pub struct LockTable {
    shards: Vec<Mutex<HashMap<CacheKey, KeyQueue>>>,
    hasher: RandomState,
    registry: Arc<TxRegistry>,
}

impl LockTable {
    /// Creates a lock table with `shards` independently locked partitions of
    /// the key space.
    pub fn new(shards: usize, registry: Arc<TxRegistry>) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
            registry,
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<CacheKey, KeyQueue>> {
        let idx = (self.hasher.hash_one(key) as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Queues `candidate` on `key` in version order.
    ///
    /// Returns `true` if the candidate owns the lock right away: either the
    /// queue was empty, or the same transaction already owns the key (in
    /// which case its reentry count is bumped instead of queueing twice).
    pub fn enqueue(&self, key: CacheKey, mut candidate: LockCandidate) -> bool {
        let mut shard = self.shard(&key).lock();
        let queue = shard.entry(key).or_default();

        if let Some(existing) = queue.iter_mut().find(|c| c.tx() == candidate.tx()) {
            existing.reenter();
            return existing.is_owner();
        }

        if queue.is_empty() {
            candidate.set_owner();
            debug!(
                "Tx {} acquired lock on '{}' immediately",
                candidate.tx(),
                candidate.key()
            );
            queue.push_back(candidate);
            return true;
        }

        // The owner stays at the front even if the newcomer orders before it.
        let pos = queue
            .iter()
            .skip(1)
            .position(|c| c.version() > candidate.version())
            .map(|p| p + 1)
            .unwrap_or(queue.len());
        debug!(
            "Tx {} queued on '{}' at position {} behind owner {}",
            candidate.tx(),
            candidate.key(),
            pos,
            queue[0].tx()
        );
        queue.insert(pos, candidate);
        false
    }

    /// Removes the candidate of transaction `tx` from `key`'s queue.
    ///
    /// If the removed candidate owned the lock, the next candidate is promoted
    /// and its transaction is notified. A transaction that is no longer
    /// interested (it already finished) has its candidate dropped and the
    /// promotion moves on, so the releasing thread never blocks.
    ///
    /// Returns `true` if a candidate was removed.
    pub fn release(&self, key: &str, tx: Version) -> bool {
        // Transactions upgraded during promotion are dropped after the shard
        // lock is released.
        let mut notified: Vec<Arc<Transaction>> = Vec::new();

        let removed = {
            let mut shard = self.shard(key).lock();
            let Some(queue) = shard.get_mut(key) else {
                return false;
            };
            let Some(pos) = queue.iter().position(|c| c.tx() == tx) else {
                return false;
            };

            let removed = queue.remove(pos);
            if removed.as_ref().is_some_and(|c| c.is_owner()) {
                self.promote(queue, &mut notified);
            }
            if queue.is_empty() {
                shard.remove(key);
            }
            removed.is_some()
        };

        drop(notified);
        removed
    }

    fn promote(&self, queue: &mut KeyQueue, notified: &mut Vec<Arc<Transaction>>) {
        while let Some(next) = queue.front_mut() {
            next.set_owner();
            let candidate = next.clone();

            let interested = match self.registry.get(candidate.tx()) {
                Some(tx) => {
                    let interested = tx.on_owner_changed(&candidate);
                    notified.push(tx);
                    interested
                }
                None => false,
            };

            if interested {
                debug!(
                    "Lock on '{}' handed over to tx {}",
                    candidate.key(),
                    candidate.tx()
                );
                return;
            }

            debug!(
                "Dropping stale candidate of finished tx {} on '{}'",
                candidate.tx(),
                candidate.key()
            );
            queue.pop_front();
        }
    }

    /// Checks whether transaction `tx` owns the lock on `key`.
    ///
    /// # Errors
    ///
    /// Returns `GridTxError::EntryRemoved` if `key` has no lock entry at all.
    pub fn owns_lock(&self, key: &str, tx: Version) -> Result<bool> {
        let shard = self.shard(key).lock();
        match shard.get(key) {
            Some(queue) => Ok(queue.front().is_some_and(|c| c.tx() == tx && c.is_owner())),
            None => Err(GridTxError::EntryRemoved(key.to_string())),
        }
    }

    /// Like [`LockTable::owns_lock`], but a missing entry simply means "not owned".
    ///
    /// Used on cleanup paths that may race with entry removal.
    pub fn owns_lock_unsafe(&self, key: &str, tx: Version) -> bool {
        self.owns_lock(key, tx).unwrap_or(false)
    }

    /// Returns the current owner of `key`, if any.
    pub fn owner(&self, key: &str) -> Option<LockCandidate> {
        let shard = self.shard(key).lock();
        shard
            .get(key)
            .and_then(|q| q.front())
            .filter(|c| c.is_owner())
            .cloned()
    }

    /// Returns a snapshot of `key`'s queue, owner first.
    pub fn candidates(&self, key: &str) -> Vec<LockCandidate> {
        let shard = self.shard(key).lock();
        shard
            .get(key)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.owner(key).is_some()
    }

    /// Number of keys with at least one queued candidate.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
