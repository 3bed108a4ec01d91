use arrow::record_batch::RecordBatch;
use std::fmt;
use std::sync::Arc;

use crate::version::Version;
use crate::CacheKey;

/// Predicate evaluated against the current value of a key.
///
/// `None` means the key has no value.
pub type EntryFilter = Arc<dyn Fn(Option<&RecordBatch>) -> bool + Send + Sync>;

/// What a transaction does to one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOp {
    Read,
    Create,
    Update,
    Delete,
    /// A conditional write whose filter rejected the locked value.
    NoOp,
}

impl EntryOp {
    pub fn is_write(self) -> bool {
        matches!(self, EntryOp::Create | EntryOp::Update | EntryOp::Delete)
    }
}

/// One read or write record of a transaction.
#[derive(Clone)]
pub struct TxEntry {
    pub(crate) key: CacheKey,
    pub(crate) op: EntryOp,
    /// Version of the value observed before the transaction touched the key,
    /// `None` if the key had no value.
    pub(crate) snapshot: Option<Version>,
    pub(crate) snapshot_value: Option<Arc<RecordBatch>>,
    /// Value to install on commit. `None` for reads and deletes.
    pub(crate) pending: Option<RecordBatch>,
    pub(crate) explicit_lock: bool,
    pub(crate) filter: Option<EntryFilter>,
    pub(crate) partition: u32,
}

impl TxEntry {
    pub(crate) fn new(key: CacheKey, op: EntryOp, partition: u32) -> Self {
        Self {
            key,
            op,
            snapshot: None,
            snapshot_value: None,
            pending: None,
            explicit_lock: false,
            filter: None,
            partition,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn op(&self) -> EntryOp {
        self.op
    }

    pub fn snapshot_version(&self) -> Option<Version> {
        self.snapshot
    }

    pub fn snapshot_value(&self) -> Option<&Arc<RecordBatch>> {
        self.snapshot_value.as_ref()
    }

    pub fn pending(&self) -> Option<&RecordBatch> {
        self.pending.as_ref()
    }

    /// `true` if the lock on this key was taken at access time.
    pub fn explicit_lock(&self) -> bool {
        self.explicit_lock
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    /// Evaluates the entry's filter; entries without a filter always pass.
    pub fn passes_filter(&self, current: Option<&RecordBatch>) -> bool {
        self.filter.as_ref().is_none_or(|f| f(current))
    }
}

impl fmt::Debug for TxEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxEntry")
            .field("key", &self.key)
            .field("op", &self.op)
            .field("snapshot", &self.snapshot)
            .field("has_pending", &self.pending.is_some())
            .field("explicit_lock", &self.explicit_lock)
            .field("has_filter", &self.filter.is_some())
            .field("partition", &self.partition)
            .finish()
    }
}
