use log::debug;
use std::collections::BTreeMap;

use crate::data_store::cache_store::CacheStore;
use crate::transaction::entry::{EntryOp, TxEntry};
use crate::version::Version;
use crate::{CacheKey, TransactionIsolation};

/// Represents the type of conflict detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    /// The transaction read data that was modified by another transaction.
    ReadWrite,
    /// The transaction attempted to write to data that was modified by another transaction.
    WriteWrite,
    /// The transaction read data that was deleted by another transaction.
    ReadDelete,
    /// The transaction attempted to write to data that was deleted by another transaction.
    WriteDelete,
}

fn classify(current: Option<Version>, read: bool) -> ConflictType {
    match (current, read) {
        (None, true) => ConflictType::ReadDelete,
        (Some(_), true) => ConflictType::ReadWrite,
        (None, false) => ConflictType::WriteDelete,
        (Some(_), false) => ConflictType::WriteWrite,
    }
}

/// Compares each entry's snapshot version with the version currently in the store.
///
/// Must be called while the transaction owns the locks of its write keys, so
/// that written keys cannot change between validation and commit. Returns the
/// conflicting keys in key order; an empty vector means validation passed.
///
/// Under `ReadCommitted` nothing is validated: the last writer wins.
pub fn detect_conflicts(
    xid: Version,
    isolation: TransactionIsolation,
    reads: &BTreeMap<CacheKey, TxEntry>,
    writes: &BTreeMap<CacheKey, TxEntry>,
    store: &CacheStore,
) -> Vec<(CacheKey, ConflictType)> {
    let mut conflicts = Vec::new();
    if isolation == TransactionIsolation::ReadCommitted {
        return conflicts;
    }

    for (key, entry) in reads {
        let current = store.get(key).map(|v| v.version());
        if current != entry.snapshot_version() {
            debug!(
                "Tx {} read '{}' at {:?}, current version is {:?}",
                xid,
                key,
                entry.snapshot_version(),
                current
            );
            conflicts.push((key.clone(), classify(current, true)));
        }
    }

    for (key, entry) in writes {
        if reads.contains_key(key) {
            // Already validated through the read set.
            continue;
        }
        let current = store.get(key).map(|v| v.version());
        if current != entry.snapshot_version() {
            debug!(
                "Tx {} writes '{}' observed at {:?}, current version is {:?}",
                xid,
                key,
                entry.snapshot_version(),
                current
            );
            conflicts.push((key.clone(), classify(current, false)));
        }
    }

    conflicts.sort_by(|a, b| a.0.cmp(&b.0));
    conflicts
}

/// Evaluates conditional writes against the locked value.
///
/// Entries whose filter rejects the current value become [`EntryOp::NoOp`]
/// and drop their pending value. Returns the number of entries turned into
/// no-ops.
pub fn apply_filters(
    xid: Version,
    writes: &mut BTreeMap<CacheKey, TxEntry>,
    store: &CacheStore,
) -> usize {
    let mut skipped = 0;
    for (key, entry) in writes.iter_mut().filter(|(_, e)| e.has_filter()) {
        let current = store.get(key);
        if !entry.passes_filter(current.as_ref().map(|v| v.data().as_ref())) {
            debug!("Tx {} filter rejected '{}', entry becomes a no-op", xid, key);
            entry.op = EntryOp::NoOp;
            entry.pending = None;
            skipped += 1;
        }
    }
    skipped
}
