use crossbeam_channel as channel;

use crate::twopc::messages::TxResponse;
use crate::NodeId;

/// An encoded message together with the channel its response goes to.
pub struct Envelope {
    /// Bincode-encoded `TxMessage`.
    pub bytes: Vec<u8>,
    pub reply: channel::Sender<TxResponse>,
}

/// Extension trait for senders that know which node they deliver to.
pub trait SenderExt {
    /// Returns the node ID associated with this sender.
    fn node_id(&self) -> NodeId;
}

/// A wrapper around `channel::Sender<Envelope>` that includes the node ID.
#[derive(Clone)]
pub struct NodeSender {
    /// The underlying sender.
    pub sender: channel::Sender<Envelope>,
    /// The node ID.
    pub node_id: NodeId,
}

impl NodeSender {
    /// Creates a new NodeSender.
    pub fn new(sender: channel::Sender<Envelope>, node_id: NodeId) -> Self {
        Self { sender, node_id }
    }

    /// Sends an envelope through the channel.
    pub fn send(&self, envelope: Envelope) -> Result<(), channel::SendError<Envelope>> {
        self.sender.send(envelope)
    }
}

impl SenderExt for NodeSender {
    fn node_id(&self) -> NodeId {
        self.node_id
    }
}
