pub mod arrow_utils;
pub mod config;
pub mod conflict;
pub mod context;
pub mod data_store;
#[cfg(feature = "distributed")]
pub mod distributed;
pub mod errors;
pub mod gateway;
pub mod gridtx;
pub mod mvcc;
pub mod preload;
pub mod registry;
pub mod storage;
pub mod timeout;
pub mod topology;
pub mod transaction;
pub mod twopc;
pub mod util;
pub mod version;

// Re-export key types and structs for easier access
pub use config::GridTxConfig;
pub use data_store::versioned_value::VersionedValue;
pub use errors::{GridTxError, Result};
pub use gateway::CacheGateway;
pub use gridtx::{prelude, GridTx};
pub use storage::Storage;
pub use transaction::state::{TxConcurrency, TxOutcome, TxState};
pub use transaction::Transaction;
pub use twopc::{ParticipantError, TransactionChanges, TwoPhaseCommitParticipant};
pub use version::{Version, VersionClock};

/// Key of a cache entry.
pub type CacheKey = String;

/// Identity of a cluster node.
pub type NodeId = u64;

// Define the TransactionIsolation enum here as it's a core part of the public API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
///
/// Transaction Isolation levels for transaction system
pub enum TransactionIsolation {
    ///
    /// [TransactionIsolation::ReadCommitted] isolation level means that always a committed value will be
    /// provided for read operations. Values are read from the cache every time a key is accessed, so
    /// the same key may return a different value each time within one transaction. Reads never lock
    /// and optimistic transactions are not validated: the last writer wins.
    ReadCommitted,
    ///
    /// [TransactionIsolation::RepeatableRead] isolation level means that if a value was read once within transaction,
    /// then all consecutive reads will provide the same in-transaction value. If concurrency is
    /// [TxConcurrency::Pessimistic], then a lock on the key will be acquired prior to accessing the
    /// value; in [TxConcurrency::Optimistic] mode the observed versions are validated at prepare time.
    #[default]
    RepeatableRead,
    ///
    /// [TransactionIsolation::Serializable] isolation level means that all transactions occur in a completely isolated fashion,
    /// as if all transactions in the system had executed serially, one after the other. Read access
    /// with this level happens the same way as with [TransactionIsolation::RepeatableRead] level.
    /// However, in [TxConcurrency::Optimistic] mode the read set is additionally checked against every
    /// transaction committed since this one started; if some transactions cannot be serially isolated
    /// from each other, then one winner will be picked and the other transactions in conflict will
    /// result with abort.
    Serializable,
}
