use arrow::record_batch::RecordBatch;
use std::sync::Arc;

use crate::version::Version;

/// Represents a cached value with the version of the transaction that wrote it.
///
/// Every entry in the [`CacheStore`](crate::data_store::cache_store::CacheStore)
/// is wrapped in a `VersionedValue`, so optimistic validation can tell whether
/// the value a transaction observed is still the current one.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue {
    /// The actual data.
    data: Arc<RecordBatch>,
    /// The commit version of the transaction that last wrote this value.
    version: Version,
}

impl VersionedValue {
    /// Creates a new `VersionedValue`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use gridtx::prelude::*;
    /// use std::sync::Arc;
    /// use arrow::record_batch::RecordBatch;
    /// use arrow::array::Int32Array;
    /// use arrow::datatypes::{Schema, Field, DataType};
    ///
    /// let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int32, false)]));
    /// let id_array = Int32Array::from(vec![1]);
    /// let record_batch = RecordBatch::try_new(schema, vec![Arc::new(id_array)]).unwrap();
    ///
    /// let versioned_value = VersionedValue::new(Arc::new(record_batch), Version::new(1, 0, 1));
    /// println!("Created VersionedValue with version: {}", versioned_value.version());
    /// ```
    pub fn new(data: Arc<RecordBatch>, version: Version) -> Self {
        Self { data, version }
    }

    /// Returns a reference to the data.
    pub fn data(&self) -> &Arc<RecordBatch> {
        &self.data
    }

    /// Returns the version of the value.
    pub fn version(&self) -> Version {
        self.version
    }
}
