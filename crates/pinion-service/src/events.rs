//! The event bus connecting the node, the store manager and the protocol dispatcher.
//!
//! The bus is created by [`Pinion`](crate::service::Pinion) and handed to every component that
//! emits or consumes events. Events are delivered to every subscriber that exists at the time
//! they are emitted.

use std::fmt;

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::types::StoreAddress;

/// Number of events a slow subscriber may lag behind before it starts missing events.
const BUS_CAPACITY: usize = 1024;

/// A message received in the pinning room.
#[derive(Clone, PartialEq, Eq)]
pub struct PubsubMessage {
    /// Peer id of the sender.
    pub from: String,
    /// The raw message payload.
    pub data: Bytes,
}

impl fmt::Debug for PubsubMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubsubMessage")
            .field("from", &self.from)
            .field("data", &String::from_utf8_lossy(&self.data))
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A peer other than this node published a message in the pinning room.
    Message(PubsubMessage),
    /// A peer joined the pinning room.
    PeerJoined(String),
    /// A peer left the pinning room.
    PeerLeft(String),
    /// A store finished replicating with the given number of heads.
    StoreReplicated { address: StoreAddress, heads: usize },
}

/// A multi-producer, multi-consumer channel of [`Event`]s.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Emits an event to all current subscribers.
    ///
    /// Events emitted while nobody is subscribed are dropped.
    pub fn emit(&self, event: Event) {
        tracing::trace!(?event, "emitting event");
        self.sender.send(event).ok();
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receives the events of an [`EventBus`].
#[derive(Debug)]
pub struct EventStream {
    receiver: broadcast::Receiver<Event>,
}

impl EventStream {
    /// Waits for the next event, or `None` once the bus is gone.
    ///
    /// Events that were dropped because this stream lagged behind are skipped.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
