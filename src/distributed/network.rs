use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use crossbeam_channel as channel;
use log::{debug, trace};
use parking_lot::{Mutex, RwLock};

use crate::distributed::channel_ext::{Envelope, NodeSender, SenderExt};
use crate::errors::{GridTxError, Result};
use crate::twopc::messages::{Transport, TxMessage, TxResponse};
use crate::NodeId;

/// A [`Transport`] connecting nodes that live in the same process.
///
/// Isolating a node simulates a partition: messages to it are accepted but
/// never delivered, so the sender only notices through its own timeout.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<NodeId, NodeSender>>,
    isolated: RwLock<HashSet<NodeId>>,
    // Reply channels of swallowed messages, kept open so receivers time out
    // instead of seeing a disconnect.
    lost: Mutex<Vec<channel::Sender<TxResponse>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `node` and returns the channel its messages arrive on.
    pub fn register(&self, node: NodeId) -> channel::Receiver<Envelope> {
        let (sender, receiver) = channel::unbounded();
        self.nodes.write().insert(node, NodeSender::new(sender, node));
        debug!("Node {} joined the local network", node);
        receiver
    }

    /// Detaches `node`. Its receiver disconnects once in-flight envelopes drain.
    pub fn unregister(&self, node: NodeId) -> bool {
        let removed = self.nodes.write().remove(&node).is_some();
        if removed {
            debug!("Node {} left the local network", node);
        }
        removed
    }

    pub fn isolate(&self, node: NodeId) {
        debug!("Isolating node {}", node);
        self.isolated.write().insert(node);
    }

    pub fn heal(&self, node: NodeId) {
        debug!("Healing node {}", node);
        self.isolated.write().remove(&node);
    }

    pub fn is_isolated(&self, node: NodeId) -> bool {
        self.isolated.read().contains(&node)
    }

    /// Number of messages swallowed by isolation so far.
    pub fn lost_messages(&self) -> usize {
        self.lost.lock().len()
    }
}

impl Transport for LocalNetwork {
    fn send(&self, to: NodeId, msg: TxMessage) -> Result<channel::Receiver<TxResponse>> {
        let bytes = bincode::serialize(&msg).map_err(|e| GridTxError::Codec(e.to_string()))?;
        let sender = self
            .nodes
            .read()
            .get(&to)
            .cloned()
            .ok_or_else(|| GridTxError::Transport(format!("unknown node {}", to)))?;

        let (reply, receiver) = channel::bounded(1);
        if self.is_isolated(to) {
            trace!("Dropping message of tx {} to isolated node {}", msg.xid(), to);
            self.lost.lock().push(reply);
            return Ok(receiver);
        }

        trace!(
            "Delivering message of tx {} to node {} ({} bytes)",
            msg.xid(),
            sender.node_id(),
            bytes.len()
        );
        sender
            .send(Envelope { bytes, reply })
            .map_err(|_| GridTxError::Transport(format!("node {} is not receiving", to)))?;
        Ok(receiver)
    }
}
