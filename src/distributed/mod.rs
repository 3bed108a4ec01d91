//! In-process distribution of prepare and finish messages.
//!
//! Nodes of a test or embedded cluster share one [`network::LocalNetwork`].
//! Messages are bincode-encoded on send, so everything that crosses the
//! network is exactly what a real transport would carry.

pub mod backup;
pub mod channel_ext;
pub mod network;

pub use backup::{BackupNode, BackupParticipant};
pub use network::LocalNetwork;
