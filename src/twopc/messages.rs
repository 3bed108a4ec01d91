use arrow::record_batch::RecordBatch;
use crossbeam_channel as channel;
use serde::{Deserialize, Serialize};

use crate::arrow_utils::{decode_batch, encode_optional};
use crate::errors::Result;
use crate::transaction::entry::TxEntry;
use crate::transaction::state::{TxConcurrency, TxDurability};
use crate::twopc::TransactionChanges;
use crate::version::Version;
use crate::{CacheKey, NodeId, TransactionIsolation};

/// One written key as carried between nodes.
///
/// The value travels as Arrow IPC bytes; `None` is a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEntry {
    pub key: CacheKey,
    pub value: Option<Vec<u8>>,
}

impl WireEntry {
    pub fn from_entry(entry: &TxEntry) -> Result<Self> {
        Ok(Self {
            key: entry.key().clone(),
            value: encode_optional(entry.pending())?,
        })
    }
}

/// Decodes wire entries back into the changes a participant applies.
pub fn decode_changes(entries: &[WireEntry]) -> Result<TransactionChanges> {
    entries
        .iter()
        .map(|e| {
            let value: Option<RecordBatch> = e.value.as_deref().map(decode_batch).transpose()?;
            Ok((e.key.clone(), value))
        })
        .collect()
}

/// Asks a remote owner to stage a transaction's writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub xid: Version,
    pub start_version: Version,
    pub commit_version: Version,
    pub topology_version: u32,
    pub origin: NodeId,
    pub master_node_ids: Vec<NodeId>,
    pub other_node_id: Option<NodeId>,
    pub concurrency: TxConcurrency,
    pub isolation: TransactionIsolation,
    pub durability: TxDurability,
    pub sync_commit: bool,
    pub invalid_partitions: Vec<u32>,
    pub writes: Vec<WireEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub xid: Version,
    pub from: NodeId,
    /// Last version issued by the responder, merged into the coordinator's clock.
    pub version: Version,
    /// Partitions the responder no longer owns.
    pub invalid_partitions: Vec<u32>,
    /// Set when the responder refused to prepare.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishDecision {
    Commit,
    Rollback,
}

/// Tells a participant how a transaction ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishRequest {
    pub xid: Version,
    pub commit_version: Option<Version>,
    pub decision: FinishDecision,
    pub origin: NodeId,
    pub invalid_partitions: Vec<u32>,
    /// The coordinator waits for the response.
    pub sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishResponse {
    pub xid: Version,
    pub from: NodeId,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxMessage {
    Prepare(PrepareRequest),
    Finish(FinishRequest),
}

impl TxMessage {
    pub fn xid(&self) -> Version {
        match self {
            TxMessage::Prepare(req) => req.xid,
            TxMessage::Finish(req) => req.xid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxResponse {
    Prepare(PrepareResponse),
    Finish(FinishResponse),
}

impl TxResponse {
    pub fn from(&self) -> NodeId {
        match self {
            TxResponse::Prepare(resp) => resp.from,
            TxResponse::Finish(resp) => resp.from,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            TxResponse::Prepare(resp) => resp.error.as_deref(),
            TxResponse::Finish(resp) => resp.error.as_deref(),
        }
    }
}

/// Delivers transaction messages to remote nodes.
///
/// Each send hands back a channel on which the single response arrives. A
/// message that is lost simply never produces a response; the caller decides
/// how long to wait.
pub trait Transport: Send + Sync {
    /// Sends `msg` to node `to`.
    ///
    /// # Errors
    ///
    /// Returns `GridTxError::Transport` if the message cannot be handed to the
    /// network at all (for example, the node is unknown).
    fn send(&self, to: NodeId, msg: TxMessage) -> Result<channel::Receiver<TxResponse>>;
}
