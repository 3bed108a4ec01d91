use thiserror::Error;

use crate::transaction::state::TxState;
use crate::version::Version;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GridTxError {
    #[error("Transaction conflict detected on key '{key}'")]
    TransactionConflict { key: String },

    #[error("Serializability violation: key '{key}' was overwritten by a concurrent commit")]
    SerializabilityViolation { key: String },

    #[error("Topology changed during transaction, invalid partitions: {partitions:?}")]
    InvalidPartition { partitions: Vec<u32> },

    #[error("Transaction {xid} timed out")]
    Timeout { xid: Version },

    #[error("Cache gateway is closed, node is stopping")]
    GatewayClosed,

    #[error("Cache gateway is busy, admission lock not acquired in time")]
    GatewayBusy,

    #[error("Failed to wait for cache preloader start: {0}")]
    PreloadFailed(String),

    #[error("Invalid operation '{op}' for transaction {xid} in state {state:?}")]
    InvalidState {
        xid: Version,
        state: TxState,
        op: &'static str,
    },

    #[error("Lock entry for key '{0}' has been removed")]
    EntryRemoved(String),

    #[error("Backup node {node} rejected prepare: {reason}")]
    BackupRejected { node: u64, reason: String },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Arrow manipulation error: {0}")]
    ArrowError(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl GridTxError {
    /// Returns `true` when retrying the whole transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GridTxError::TransactionConflict { .. } | GridTxError::SerializabilityViolation { .. }
        )
    }
}

impl From<arrow::error::ArrowError> for GridTxError {
    fn from(e: arrow::error::ArrowError) -> Self {
        GridTxError::ArrowError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GridTxError>;
