//! The node connecting the pinner to the content store and the pinning room.

use async_trait::async_trait;

use crate::types::IpfsHash;

mod ipfs;

pub use ipfs::IpfsNode;

/// Errors talking to the node.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("failed to reach the IPFS daemon")]
    Request(#[from] reqwest::Error),
    #[error("invalid IPFS daemon url")]
    Url(#[from] url::ParseError),
    #[error("the IPFS daemon responded with {status}: {message}")]
    Daemon { status: u16, message: String },
    #[error("invalid pubsub message: {0}")]
    InvalidMessage(String),
}

/// The transport layer of the pinner.
///
/// A started node emits messages from other peers in the pinning room, as well as peers joining
/// and leaving it, on the event bus it was created with.
#[async_trait]
pub trait Node: Send + Sync {
    /// The peer id of this node.
    async fn id(&self) -> Result<String, NodeError>;

    /// Pins the given content, so that it is retained by the content store.
    ///
    /// Pinning is idempotent.
    async fn pin(&self, hash: &IpfsHash) -> Result<(), NodeError>;

    /// Publishes a message to the pinning room.
    async fn publish(&self, message: Vec<u8>) -> Result<(), NodeError>;

    /// Joins the pinning room.
    async fn start(&self) -> Result<(), NodeError>;

    /// Leaves the pinning room.
    async fn stop(&self) -> Result<(), NodeError>;
}
