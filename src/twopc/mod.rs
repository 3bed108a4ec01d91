use arrow::record_batch::RecordBatch;

use crate::errors::GridTxError;
use crate::CacheKey;

/// Finish phase: commit, rollback and the finish signal.
pub mod finish;
/// Prepare and finish requests exchanged with remote participants.
pub mod messages;
/// Prepare phase: locking, validation and backup propagation.
pub mod prepare;

/// Represents the changes made by a transaction that need to be
/// communicated during the two-phase commit process.
///
/// `Some(RecordBatch)` is an insert or update, `None` a delete.
pub type TransactionChanges = Vec<(CacheKey, Option<RecordBatch>)>;

/// Error type for Two-Phase Commit Participant operations.
#[derive(Debug, thiserror::Error)]
pub enum ParticipantError {
    /// An internal error occurred during a participant operation.
    #[error("Participant error: {0}")]
    Grid(#[from] GridTxError),
    /// A general-purpose error variant for other participant-specific issues.
    #[error("Other participant error: {0}")]
    Other(String),
}

/// Trait for a participant in a two-phase commit protocol.
///
/// Remote owners of a transaction's partitions implement this trait: they
/// stage the changes on prepare and apply or discard them on finish.
///
/// Implementations must be `Send` and `Sync` to be used concurrently.
pub trait TwoPhaseCommitParticipant: Send + Sync {
    /// The type used to identify a distributed transaction.
    type GlobalTransactionId: Send + Sync + Clone + std::fmt::Debug;

    /// Phase 1: stages `changes` for the transaction.
    ///
    /// Returns `Ok(true)` if prepared, `Ok(false)` if the participant cannot
    /// prepare (for example, it no longer owns a written partition), or an
    /// error if a fundamental issue occurred.
    fn prepare_transaction(
        &self,
        global_tx_id: Self::GlobalTransactionId,
        changes: TransactionChanges,
    ) -> std::result::Result<bool, ParticipantError>;

    /// Phase 2: applies the staged changes.
    fn commit_transaction(
        &self,
        global_tx_id: Self::GlobalTransactionId,
    ) -> std::result::Result<(), ParticipantError>;

    /// Phase 2: discards the staged changes.
    fn abort_transaction(
        &self,
        global_tx_id: Self::GlobalTransactionId,
    ) -> std::result::Result<(), ParticipantError>;
}
