//! Common utilities for gridtx integration tests.
#![allow(dead_code)]

use ahash::AHashMap as HashMap;
use arrow::array::{Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use gridtx::{
    config::GridTxConfig,
    errors::{GridTxError, Result},
    storage::{Storage, StorageMutation},
    GridTx,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// --- MockStorage ---

/// A mock implementation of the `Storage` trait for testing purposes.
/// Stores records in an in-memory HashMap and can be told to fail.
#[derive(Debug, Default)]
pub struct MockStorage {
    data: Mutex<HashMap<String, RecordBatch>>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl MockStorage {
    /// Creates a new `MockStorage` instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Retrieves a record from the mock storage.
    pub fn get(&self, key: &str) -> Option<RecordBatch> {
        let data = self.data.lock().unwrap();
        data.get(key).cloned()
    }

    /// Makes every following write-through fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of `apply_mutations` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Storage for MockStorage {
    fn apply_mutations(&self, mutations: Vec<StorageMutation>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(GridTxError::StorageError("disk full".to_string()));
        }
        let mut data = self.data.lock().unwrap();
        for mutation in mutations {
            match mutation {
                StorageMutation::Insert(key, record_batch) => {
                    data.insert(key, record_batch);
                }
                StorageMutation::Delete(key) => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

// --- Helper Functions ---

/// Creates a grid node over a fresh `MockStorage`, returning both.
pub fn setup_grid(config: GridTxConfig) -> (Arc<GridTx>, Arc<MockStorage>) {
    let storage = Arc::new(MockStorage::new());
    let grid = GridTx::new(config, storage.clone()).unwrap();
    (Arc::new(grid), storage)
}

/// Helper function to create a simple schema.
pub fn create_test_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("value", DataType::Utf8, true),
    ]))
}

/// Helper function to create a RecordBatch.
pub fn create_record_batch(ids: Vec<i64>, values: Vec<Option<&str>>) -> RecordBatch {
    let schema = create_test_schema();
    RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(ids)),
            Arc::new(StringArray::from(values)),
        ],
    )
    .unwrap()
}

/// A single-row batch whose id column carries `n`.
pub fn counter_batch(n: i64) -> RecordBatch {
    create_record_batch(vec![n], vec![None])
}

/// Reads the id column of a batch made by `counter_batch`.
pub fn counter_value(batch: &RecordBatch) -> i64 {
    batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap()
        .value(0)
}

/// Helper function to wait for a condition with timeout
pub fn wait_for_condition<F>(condition: F, timeout_ms: u64) -> bool
where
    F: Fn() -> bool,
{
    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    false
}
