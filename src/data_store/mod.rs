/// The authoritative in-memory key/value store.
pub mod cache_store;
/// Values tagged with the version of their writer.
pub mod versioned_value;
