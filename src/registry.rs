use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

use crate::transaction::Transaction;
use crate::version::Version;

/// Resolves transaction xids to live transactions.
///
/// Lock candidates and timeout entries refer to transactions through their
/// xid. The registry holds only weak references, so a finished transaction
/// is reclaimed as soon as its last user drops it, even when stale handles
/// are still around.
#[derive(Default)]
pub struct TxRegistry {
    txs: RwLock<HashMap<Version, Weak<Transaction>>>,
}

impl TxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tx: &Arc<Transaction>) {
        self.txs.write().insert(tx.xid(), Arc::downgrade(tx));
    }

    /// Looks up a live transaction by xid.
    pub fn get(&self, xid: Version) -> Option<Arc<Transaction>> {
        self.txs.read().get(&xid).and_then(Weak::upgrade)
    }

    pub fn unregister(&self, xid: Version) {
        self.txs.write().remove(&xid);
    }

    /// Returns every registered transaction that is still alive.
    pub fn active(&self) -> Vec<Arc<Transaction>> {
        self.txs.read().values().filter_map(Weak::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.txs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.read().is_empty()
    }
}
