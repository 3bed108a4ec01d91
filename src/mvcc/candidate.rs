use crate::version::Version;
use crate::CacheKey;

/// A transaction's request for the lock on one key.
///
/// The candidate refers to its transaction only through the transaction's
/// xid, which is resolved in the [`TxRegistry`](crate::registry::TxRegistry)
/// when ownership is handed over. A finished transaction can therefore be
/// reclaimed while a stale candidate is still queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockCandidate {
    key: CacheKey,
    tx: Version,
    version: Version,
    owner: bool,
    reentry: u32,
}

impl LockCandidate {
    /// Creates a non-owning candidate for transaction `tx` on `key`.
    ///
    /// `version` is the lock request version and decides the candidate's
    /// position in the key's queue.
    pub fn new(key: CacheKey, tx: Version, version: Version) -> Self {
        Self {
            key,
            tx,
            version,
            owner: false,
            reentry: 0,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Xid of the transaction that requested the lock.
    pub fn tx(&self) -> Version {
        self.tx
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Number of times the owning transaction re-requested this lock.
    pub fn reentry_count(&self) -> u32 {
        self.reentry
    }

    pub(crate) fn set_owner(&mut self) {
        self.owner = true;
    }

    pub(crate) fn reenter(&mut self) {
        self.reentry += 1;
    }
}
