//! Multi-version concurrency control: per-key queues of lock candidates.

/// A single transaction's request for a key lock.
pub mod candidate;
/// The sharded table of candidate queues.
pub mod lock_table;
