//! Keeps track of open stores.
//!
//! Opening a store is expensive, so stores are kept open in an [`AsyncCache`] and reused by
//! subsequent requests. When too many stores are open, the least recently used one is closed.
//!
//! While a store is open, the content of every entry it replicates is pinned. Once the store has
//! caught up with its peers, this is announced on the event bus.

use std::sync::Arc;

use futures::future::BoxFuture;
use sentry::{Hub, SentryFutureExt};

use crate::caching::{AsyncCache, CacheItemLoader};
use crate::config::StoresConfig;
use crate::engine::{AccessPolicy, LogEngine, ReplicationEvent, Store, StoreError, Subscription};
use crate::events::{Event, EventBus};
use crate::node::Node;
use crate::types::{IpfsHash, StoreAddress};

struct StoreLoader {
    engine: Arc<dyn LogEngine>,
    node: Arc<dyn Node>,
    bus: EventBus,
    follow_updates: bool,
}

impl CacheItemLoader for StoreLoader {
    type Key = StoreAddress;
    type Value = Arc<dyn Store>;
    type Error = StoreError;

    fn load(&self, address: StoreAddress) -> BoxFuture<'static, Result<Arc<dyn Store>, StoreError>> {
        let engine = Arc::clone(&self.engine);
        let listener = ReplicationListener {
            node: Arc::clone(&self.node),
            bus: self.bus.clone(),
            follow_updates: self.follow_updates,
        };

        Box::pin(async move {
            tracing::debug!(address = %address, "opening store");
            let store = engine.open(&address, AccessPolicy::Permissive).await?;
            metric!(counter("stores.opened") += 1);

            // Subscribe before handing out the store, so that no event is missed.
            listener.spawn(address, store.subscribe());
            Ok(store)
        })
    }

    fn remove(
        &self,
        address: StoreAddress,
        store: Arc<dyn Store>,
    ) -> BoxFuture<'static, Result<(), StoreError>> {
        Box::pin(async move {
            tracing::debug!(address = %address, "closing store");
            store.close().await?;
            metric!(counter("stores.closed") += 1);
            Ok(())
        })
    }
}

/// Pins replicated content of a single store.
struct ReplicationListener {
    node: Arc<dyn Node>,
    bus: EventBus,
    follow_updates: bool,
}

impl ReplicationListener {
    fn spawn(self, address: StoreAddress, subscription: Subscription) {
        tokio::spawn(
            self.listen(address, subscription)
                .bind_hub(Hub::new_from_top(Hub::current())),
        );
    }

    async fn listen(self, address: StoreAddress, mut subscription: Subscription) {
        while let Some(event) = subscription.next().await {
            match event {
                ReplicationEvent::Progress {
                    hash,
                    progress,
                    total,
                } => {
                    tracing::trace!(address = %address, progress, total, "replication progress");
                    // Pinning is idempotent, repeated hashes are pinned again.
                    self.pin(&address, &hash).await;
                }
                ReplicationEvent::Replicated { heads } => {
                    tracing::debug!(address = %address, heads, "store replicated");
                    self.bus.emit(Event::StoreReplicated {
                        address: address.clone(),
                        heads,
                    });

                    if !self.follow_updates {
                        subscription.unsubscribe();
                        return;
                    }
                }
            }
        }
    }

    async fn pin(&self, address: &StoreAddress, hash: &str) {
        let hash = match IpfsHash::parse(hash) {
            Ok(hash) => hash,
            Err(error) => {
                tracing::warn!(
                    address = %address,
                    hash,
                    error = &error as &dyn std::error::Error,
                    "not pinning invalid hash"
                );
                return;
            }
        };

        if let Err(error) = self.node.pin(&hash).await {
            metric!(counter("stores.pin.failed") += 1);
            tracing::error!(
                address = %address,
                hash = %hash,
                error = &error as &dyn std::error::Error,
                "could not pin hash"
            );
        }
    }
}

/// Opens, reuses and closes stores.
pub struct StoreManager {
    engine: Arc<dyn LogEngine>,
    cache: AsyncCache<StoreLoader>,
}

impl StoreManager {
    pub fn new(
        engine: Arc<dyn LogEngine>,
        node: Arc<dyn Node>,
        bus: EventBus,
        config: &StoresConfig,
    ) -> Self {
        let loader = StoreLoader {
            engine: Arc::clone(&engine),
            node,
            bus,
            follow_updates: config.follow_updates,
        };

        Self {
            engine,
            cache: AsyncCache::new("stores", config.max_open_stores, loader),
        }
    }

    /// Connects the log engine.
    pub async fn start(&self) -> Result<(), StoreError> {
        self.engine.connect().await
    }

    /// Closes all stores, then disconnects the log engine.
    ///
    /// Failures to close individual stores are logged and ignored.
    pub async fn stop(&self) -> Result<(), StoreError> {
        self.cache.reset().await;
        self.engine.disconnect().await
    }

    /// Opens the store at `address`, or reuses it if it is already open.
    pub async fn pin_store(&self, address: &StoreAddress) -> Result<Arc<dyn Store>, StoreError> {
        self.cache.load(address.clone()).await
    }

    /// Opens the store at `address` like [`pin_store`](Self::pin_store), and returns the length of
    /// its log.
    pub async fn load_store(&self, address: &StoreAddress) -> Result<usize, StoreError> {
        let store = self.pin_store(address).await?;
        Ok(store.len())
    }

    /// Closes the store at `address`, if it is open.
    pub async fn close_store(&self, address: &StoreAddress) {
        self.cache.remove(address).await
    }

    /// The number of stores that are open, including those that are being closed.
    pub fn open_stores(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::future;

    use super::*;
    use crate::test::{self, HASHES, MockEngine, RecordingNode};

    fn manager(
        engine: &Arc<MockEngine>,
        node: &Arc<RecordingNode>,
        bus: &EventBus,
        config: StoresConfig,
    ) -> StoreManager {
        StoreManager::new(engine.clone(), node.clone(), bus.clone(), &config)
    }

    async fn started(
        engine: &Arc<MockEngine>,
        node: &Arc<RecordingNode>,
        bus: &EventBus,
        config: StoresConfig,
    ) -> StoreManager {
        let manager = manager(engine, node, bus, config);
        manager.start().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_load_store_reuses_store() {
        pinion_test::setup();
        let engine = MockEngine::new();
        let node = RecordingNode::new();
        let stores = started(&engine, &node, &EventBus::new(), Default::default()).await;
        let address = test::address("reuse");

        assert_eq!(stores.load_store(&address).await.unwrap(), 0);
        assert_eq!(stores.open_stores(), 1);

        engine.store(&address).unwrap().replicate_progress(HASHES[0]);
        // the open store is reused, and reports its current length
        assert_eq!(stores.load_store(&address).await.unwrap(), 1);
        assert_eq!(engine.opens(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_loads_open_once() {
        pinion_test::setup();
        let engine = MockEngine::new();
        engine.set_open_delay(std::time::Duration::from_millis(20));
        let node = RecordingNode::new();
        let stores = started(&engine, &node, &EventBus::new(), Default::default()).await;
        let address = test::address("concurrent");

        let (first, second) =
            future::join(stores.pin_store(&address), stores.load_store(&address)).await;
        assert_eq!(first.unwrap().address(), &address);
        assert_eq!(second.unwrap(), 0);
        assert_eq!(engine.opens(), 1);
    }

    #[tokio::test]
    async fn test_pins_replicated_hashes() {
        pinion_test::setup();
        let engine = MockEngine::new();
        let node = RecordingNode::new();
        let stores = started(&engine, &node, &EventBus::new(), Default::default()).await;
        let address = test::address("pins");

        stores.pin_store(&address).await.unwrap();
        let store = engine.store(&address).unwrap();
        store.replicate_progress(HASHES[0]);
        store.replicate_progress("not-a-hash");
        store.replicate_progress(HASHES[0]);
        store.replicate_progress(HASHES[1]);

        test::wait_until(|| node.pinned().len() == 3).await;
        assert_eq!(node.pinned(), [HASHES[0], HASHES[0], HASHES[1]]);
    }

    #[tokio::test]
    async fn test_pins_every_hash_of_a_burst() {
        pinion_test::setup();
        let engine = MockEngine::new();
        let node = RecordingNode::new();
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let config = StoresConfig {
            follow_updates: true,
            ..Default::default()
        };
        let stores = started(&engine, &node, &bus, config).await;
        let address = test::address("burst");

        stores.pin_store(&address).await.unwrap();
        let store = engine.store(&address).unwrap();
        store.replicate_progress(HASHES[0]);
        for _ in 0..2000 {
            store.replicate_progress(HASHES[2]);
        }
        store.replicate_progress(HASHES[1]);
        store.replicated(3);

        assert!(matches!(
            events.next().await,
            Some(Event::StoreReplicated { heads: 3, .. })
        ));
        let pinned = node.pinned();
        assert_eq!(pinned.len(), 2002);
        assert_eq!(pinned.first().map(String::as_str), Some(HASHES[0]));
        assert_eq!(pinned.last().map(String::as_str), Some(HASHES[1]));
    }

    #[tokio::test]
    async fn test_pin_failure_keeps_listening() {
        pinion_test::setup();
        let engine = MockEngine::new();
        let node = RecordingNode::new();
        let stores = started(&engine, &node, &EventBus::new(), Default::default()).await;
        let address = test::address("failing-pins");

        stores.pin_store(&address).await.unwrap();
        let store = engine.store(&address).unwrap();

        node.fail_pins(true);
        store.replicate_progress(HASHES[0]);
        test::wait_until(|| store.len() == 1).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        node.fail_pins(false);
        store.replicate_progress(HASHES[1]);
        test::wait_until(|| !node.pinned().is_empty()).await;
        assert_eq!(node.pinned(), [HASHES[1]]);
    }

    #[tokio::test]
    async fn test_replicated_detaches_listener() {
        pinion_test::setup();
        let engine = MockEngine::new();
        let node = RecordingNode::new();
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let stores = started(&engine, &node, &bus, Default::default()).await;
        let address = test::address("replicated");

        stores.pin_store(&address).await.unwrap();
        let store = engine.store(&address).unwrap();
        assert_eq!(store.subscribers(), 1);

        store.replicate_progress(HASHES[0]);
        store.replicated(3);

        assert_eq!(
            events.next().await,
            Some(Event::StoreReplicated {
                address: address.clone(),
                heads: 3
            })
        );
        test::wait_until(|| store.subscribers() == 0).await;

        // nothing is pinned after the initial replication
        store.replicate_progress(HASHES[1]);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(node.pinned(), [HASHES[0]]);
    }

    #[tokio::test]
    async fn test_follow_updates() {
        pinion_test::setup();
        let engine = MockEngine::new();
        let node = RecordingNode::new();
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let config = StoresConfig {
            follow_updates: true,
            ..Default::default()
        };
        let stores = started(&engine, &node, &bus, config).await;
        let address = test::address("follow");

        stores.pin_store(&address).await.unwrap();
        let store = engine.store(&address).unwrap();
        store.replicated(1);
        assert!(matches!(
            events.next().await,
            Some(Event::StoreReplicated { heads: 1, .. })
        ));

        store.replicate_progress(HASHES[2]);
        store.replicated(2);
        assert!(matches!(
            events.next().await,
            Some(Event::StoreReplicated { heads: 2, .. })
        ));
        assert_eq!(node.pinned(), [HASHES[2]]);
        assert_eq!(store.subscribers(), 1);
    }

    #[tokio::test]
    async fn test_close_store() {
        pinion_test::setup();
        let engine = MockEngine::new();
        let node = RecordingNode::new();
        let stores = started(&engine, &node, &EventBus::new(), Default::default()).await;
        let address = test::address("close");

        stores.pin_store(&address).await.unwrap();
        stores.close_store(&address).await;
        stores.close_store(&address).await;

        assert_eq!(stores.open_stores(), 0);
        assert_eq!(engine.store(&address).unwrap().closes(), 1);
    }

    #[tokio::test]
    async fn test_open_failure_stays_cached() {
        pinion_test::setup();
        let engine = MockEngine::new();
        let node = RecordingNode::new();
        let stores = started(&engine, &node, &EventBus::new(), Default::default()).await;
        let address = test::address("denied");
        engine.reject(&address);

        let error = stores.load_store(&address).await.unwrap_err();
        assert_eq!(error, StoreError::AccessDenied(address.clone()));
        assert_eq!(stores.open_stores(), 1);

        // the failure is served from the cache until the store is closed
        assert!(stores.load_store(&address).await.is_err());
        assert_eq!(engine.opens(), 1);

        stores.close_store(&address).await;
        assert_eq!(stores.open_stores(), 0);
        assert_eq!(engine.closes(), 0);
    }

    #[tokio::test]
    async fn test_eviction_closes_least_recently_used() {
        pinion_test::setup();
        let engine = MockEngine::new();
        let node = RecordingNode::new();
        let config = StoresConfig {
            max_open_stores: 2,
            ..Default::default()
        };
        let stores = started(&engine, &node, &EventBus::new(), config).await;
        let (a, b, c) = (test::address("a"), test::address("b"), test::address("c"));

        stores.load_store(&a).await.unwrap();
        stores.load_store(&b).await.unwrap();
        stores.load_store(&a).await.unwrap();
        stores.load_store(&c).await.unwrap();

        test::wait_until(|| stores.open_stores() == 2).await;
        assert_eq!(engine.store(&b).unwrap().closes(), 1);
        assert_eq!(engine.store(&a).unwrap().closes(), 0);
        assert_eq!(engine.store(&c).unwrap().closes(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_loads_over_capacity() {
        pinion_test::setup();
        let engine = MockEngine::new();
        engine.set_open_delay(std::time::Duration::from_millis(20));
        let node = RecordingNode::new();
        let config = StoresConfig {
            max_open_stores: 1,
            ..Default::default()
        };
        let stores = started(&engine, &node, &EventBus::new(), config).await;
        let (a, b) = (test::address("a"), test::address("b"));

        // neither open has finished when the second one evicts the first
        let (first, second) = future::join(stores.pin_store(&a), stores.pin_store(&b)).await;
        assert_eq!(first.unwrap().address(), &a);
        assert_eq!(second.unwrap().address(), &b);

        test::wait_until(|| stores.open_stores() == 1).await;
        assert_eq!(engine.opens(), 2);
        assert_eq!(engine.store(&a).unwrap().closes(), 1);
        assert_eq!(engine.store(&b).unwrap().closes(), 0);
    }

    #[tokio::test]
    async fn test_stop_closes_all_stores() {
        pinion_test::setup();
        let engine = MockEngine::new();
        let node = RecordingNode::new();
        let stores = started(&engine, &node, &EventBus::new(), Default::default()).await;

        for name in ["one", "two", "three"] {
            stores.load_store(&test::address(name)).await.unwrap();
        }
        stores.stop().await.unwrap();

        assert_eq!(stores.open_stores(), 0);
        assert!(engine.stores().iter().all(|store| store.closes() == 1));
        assert_eq!(engine.closes(), 3);
        assert_eq!(engine.disconnects(), 1);
        assert!(!engine.is_connected());
    }
}
