//! Wires the node, the store manager and the protocol dispatcher together.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::dispatcher::ProtocolDispatcher;
use crate::engine::LogEngine;
use crate::events::EventBus;
use crate::node::{IpfsNode, Node};
use crate::stores::StoreManager;

/// A pinner for a single pinning room.
///
/// Clients request stores and hashes to be pinned by publishing actions in the room. See
/// [`protocol`](crate::protocol) for the messages involved.
pub struct Pinion {
    bus: EventBus,
    node: Arc<dyn Node>,
    stores: Arc<StoreManager>,
    dispatcher: Arc<ProtocolDispatcher>,
    /// Set from the moment `start` is called until `stop`.
    starting: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Pinion {
    /// Creates a pinner that talks to the IPFS daemon configured in `config`.
    pub fn new(config: &Config, engine: Arc<dyn LogEngine>) -> Result<Self> {
        let bus = EventBus::new();
        let node = IpfsNode::new(&config.ipfs, &config.room, bus.clone())
            .context("failed to create IPFS node")?;
        Self::with_node(config, bus, Arc::new(node), engine)
    }

    /// Creates a pinner on top of an existing node.
    ///
    /// The node must emit its events on `bus`.
    pub fn with_node(
        config: &Config,
        bus: EventBus,
        node: Arc<dyn Node>,
        engine: Arc<dyn LogEngine>,
    ) -> Result<Self> {
        config.validate()?;
        let stores = Arc::new(StoreManager::new(
            engine,
            Arc::clone(&node),
            bus.clone(),
            &config.stores,
        ));
        let dispatcher = Arc::new(ProtocolDispatcher::new(
            Arc::clone(&node),
            Arc::clone(&stores),
        ));

        Ok(Self {
            bus,
            node,
            stores,
            dispatcher,
            starting: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn stores(&self) -> &StoreManager {
        &self.stores
    }

    /// The peer id of the underlying node.
    pub async fn id(&self) -> Result<String> {
        self.node.id().await.context("failed to query the node id")
    }

    /// Joins the pinning room and starts handling client actions.
    pub async fn start(&self) -> Result<()> {
        if self.starting.swap(true, Ordering::SeqCst) {
            anyhow::bail!("pinner is already running");
        }

        let result = self.start_components().await;
        if result.is_err() {
            self.starting.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn start_components(&self) -> Result<()> {
        // Subscribe before the node starts, so that no early message is missed.
        let events = self.bus.subscribe();
        self.node.start().await.context("failed to start the node")?;
        self.stores
            .start()
            .await
            .context("failed to connect the log engine")?;

        let task = Arc::clone(&self.dispatcher).spawn(events);
        *self.task.lock() = Some(task);
        tracing::info!("pinner started");
        Ok(())
    }

    /// Leaves the pinning room and closes all stores.
    ///
    /// Stores are closed even if the node fails to stop.
    pub async fn stop(&self) -> Result<()> {
        let stopped = self.node.stop().await.context("failed to stop the node");

        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.starting.store(false, Ordering::SeqCst);

        self.stores
            .stop()
            .await
            .context("failed to disconnect the log engine")?;
        tracing::info!("pinner stopped");
        stopped
    }
}
