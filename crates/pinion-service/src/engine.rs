//! Interface to the replicated log engine.
//!
//! The engine owns the actual stores: it opens them, syncs their history with other peers and
//! reports replication progress. The pinner only decides which stores are open, and pins the
//! content they reference.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::caching::Interrupted;
use crate::types::StoreAddress;

/// Who may append to a store opened by the pinner.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AccessPolicy {
    /// Everybody may write. The pinner only replicates and never verifies writes itself.
    #[default]
    Permissive,
}

impl AccessPolicy {
    /// The identifier of the access controller in the store manifest.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permissive => "PERMISSIVE",
        }
    }

    pub fn can_append(&self, _writer: &str) -> bool {
        match self {
            Self::Permissive => true,
        }
    }
}

/// Replication events emitted by an open store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReplicationEvent {
    /// An entry with the given content hash was fetched from another peer.
    ///
    /// The hash is passed on as reported by the engine and still has to be validated.
    Progress {
        hash: String,
        progress: u64,
        total: u64,
    },
    /// The store caught up with a peer, and now has the given number of heads.
    Replicated { heads: usize },
}

/// A handle to the replication events of a store.
///
/// Events are queued without bound, so a slow consumer never misses any. Dropping the
/// subscription, or calling [`unsubscribe`](Self::unsubscribe), detaches it.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<ReplicationEvent>,
}

impl Subscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<ReplicationEvent>) -> Self {
        Self { receiver }
    }

    /// Creates a subscription along with the sender feeding it.
    pub fn channel() -> (mpsc::UnboundedSender<ReplicationEvent>, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (sender, Self::new(receiver))
    }

    /// Waits for the next event, or `None` once the store is closed.
    pub async fn next(&mut self) -> Option<ReplicationEvent> {
        self.receiver.recv().await
    }

    /// Detaches from the store's events.
    pub fn unsubscribe(self) {}
}

/// Errors of the log engine.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("invalid store address: {0}")]
    InvalidAddress(String),
    #[error("access to store {0} was denied")]
    AccessDenied(StoreAddress),
    #[error("network error: {0}")]
    Network(String),
    #[error("the store is closed")]
    Closed,
    #[error("the engine is not connected")]
    NotConnected,
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

/// An open store.
#[async_trait]
pub trait Store: fmt::Debug + Send + Sync {
    fn address(&self) -> &StoreAddress;

    /// The number of entries in the store's log.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribes to the replication events of the store.
    ///
    /// Every event emitted after this call has to be delivered to the subscription, none may be
    /// dropped.
    fn subscribe(&self) -> Subscription;

    /// Closes the store, ending all subscriptions.
    async fn close(&self) -> Result<(), StoreError>;
}

/// The engine that opens stores.
#[async_trait]
pub trait LogEngine: Send + Sync {
    async fn connect(&self) -> Result<(), StoreError>;

    async fn disconnect(&self) -> Result<(), StoreError>;

    /// Opens the store at `address`.
    ///
    /// This is expensive, as it involves syncing the store's history with other peers.
    async fn open(
        &self,
        address: &StoreAddress,
        policy: AccessPolicy,
    ) -> Result<Arc<dyn Store>, StoreError>;
}
