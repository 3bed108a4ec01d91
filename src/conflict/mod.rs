/// Bookkeeping of recently finished transactions for serializable validation.
pub mod completed;
/// This module contains logic for detecting transaction conflicts.
pub mod detection;
