use crate::errors::Result;
use crate::CacheKey;
use arrow::record_batch::RecordBatch;

/// Represents a single committed mutation handed to the storage layer.
///
/// `StorageMutation` describes a change (insert, update, or delete) that a
/// committed transaction wants written through to the persistence or swap
/// collaborator behind the cache.
#[derive(Debug)]
pub enum StorageMutation {
    /// Insert or update a record with the given key and `RecordBatch`.
    /// If a record with the same key already exists, it should be updated.
    Insert(CacheKey, RecordBatch),
    /// Delete the record with the given key.
    /// If no record with the key exists, this mutation should be a no-op.
    Delete(CacheKey),
}

/// Trait for the write-through store behind the cache.
///
/// The transaction core calls [`Storage::apply_mutations`] once per committing
/// transaction, before the new values become visible in memory. If the call
/// fails, the transaction is rolled back and the error is returned to the
/// committer. Durability guarantees are entirely up to the implementation.
///
/// Implementations must be `Send` and `Sync` to be used concurrently by multiple
/// transactions.
pub trait Storage: Send + Sync {
    /// Atomically applies the given mutations to the storage layer.
    ///
    /// # Errors
    ///
    /// Returns a `GridTxError::StorageError` if the atomic application of mutations fails.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use gridtx::prelude::*;
    /// use ahash::AHashMap as HashMap;
    /// use arrow::record_batch::RecordBatch;
    /// use parking_lot::Mutex;
    ///
    /// #[derive(Default)]
    /// struct MockStorage {
    ///     data: Mutex<HashMap<String, RecordBatch>>,
    /// }
    ///
    /// impl Storage for MockStorage {
    ///     fn apply_mutations(&self, mutations: Vec<StorageMutation>) -> Result<()> {
    ///         let mut data = self.data.lock();
    ///         for mutation in mutations {
    ///             match mutation {
    ///                 StorageMutation::Insert(key, record_batch) => {
    ///                     data.insert(key, record_batch);
    ///                 }
    ///                 StorageMutation::Delete(key) => {
    ///                     data.remove(&key);
    ///                 }
    ///             }
    ///         }
    ///         Ok(())
    ///     }
    /// }
    /// ```
    fn apply_mutations(&self, mutations: Vec<StorageMutation>) -> Result<()>;
}

/// A storage sink that accepts and discards every mutation.
///
/// Used when the grid runs purely in memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStorage;

impl Storage for NoopStorage {
    fn apply_mutations(&self, _mutations: Vec<StorageMutation>) -> Result<()> {
        Ok(())
    }
}
