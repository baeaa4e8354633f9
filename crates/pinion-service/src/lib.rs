//! A pinning service for OrbitDB stores.
//!
//! The pinner joins a pubsub room on an IPFS node and waits for clients to ask it to keep their
//! stores and content around. Open stores are kept in an [`AsyncCache`](caching::AsyncCache),
//! and everything they replicate is pinned on the node.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod logging;
pub mod node;
pub mod protocol;
pub mod service;
pub mod stores;
pub mod types;
