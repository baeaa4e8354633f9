use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};

use super::{CacheItemLoader, Interrupted};

type LoadResult<L> = Result<<L as CacheItemLoader>::Value, <L as CacheItemLoader>::Error>;

/// The shared outcome of a load, cloned out to every caller.
type LoadChannel<L> = Shared<BoxFuture<'static, LoadResult<L>>>;

/// Resolves once an entry has been torn down and unlinked.
type RemovalChannel = Shared<BoxFuture<'static, ()>>;

/// The externally observable state of a cache entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryStatus {
    /// The loader is running.
    Loading,
    /// The loader has resolved, successfully or not.
    Loaded,
    /// The entry is being torn down.
    Removing,
    /// The entry is being torn down, and will be loaded again afterwards.
    RemovingThenReload,
}

enum EntryState<L: CacheItemLoader> {
    Loading,
    Loaded,
    Removing {
        removal: RemovalChannel,
    },
    RemovingThenReload {
        removal: RemovalChannel,
        /// Receives the load channel of the entry that replaces this one.
        reload: oneshot::Sender<LoadChannel<L>>,
        reloading: LoadChannel<L>,
    },
}

impl<L: CacheItemLoader> EntryState<L> {
    fn is_live(&self) -> bool {
        matches!(self, Self::Loading | Self::Loaded)
    }

    fn status(&self) -> EntryStatus {
        match self {
            Self::Loading => EntryStatus::Loading,
            Self::Loaded => EntryStatus::Loaded,
            Self::Removing { .. } => EntryStatus::Removing,
            Self::RemovingThenReload { .. } => EntryStatus::RemovingThenReload,
        }
    }
}

struct Entry<L: CacheItemLoader> {
    /// Distinguishes this entry from earlier and later entries of the same key.
    id: u64,
    /// Position in the recency list.
    tick: u64,
    loading: LoadChannel<L>,
    state: EntryState<L>,
}

/// A load that still needs to be started once the lock is released.
struct PendingLoad<L: CacheItemLoader> {
    key: L::Key,
    id: u64,
    sender: oneshot::Sender<LoadResult<L>>,
}

/// A removal that still needs to be started once the lock is released.
struct PendingRemoval<L: CacheItemLoader> {
    key: L::Key,
    id: u64,
    loading: LoadChannel<L>,
    sender: oneshot::Sender<()>,
}

/// The actions resulting from inserting a new entry.
struct Insertion<L: CacheItemLoader> {
    loading: LoadChannel<L>,
    load: PendingLoad<L>,
    eviction: Option<PendingRemoval<L>>,
}

struct Inner<L: CacheItemLoader> {
    next_id: u64,
    next_tick: u64,
    index: HashMap<L::Key, Entry<L>>,
    /// Keys ordered from least to most recently used.
    recency: BTreeMap<u64, L::Key>,
}

fn removal_channel() -> (oneshot::Sender<()>, RemovalChannel) {
    let (sender, receiver) = oneshot::channel();
    // A dropped sender still means that the removal is over.
    (sender, receiver.map(|_| ()).boxed().shared())
}

impl<L: CacheItemLoader> Inner<L> {
    fn new() -> Self {
        Self {
            next_id: 0,
            next_tick: 0,
            index: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    fn tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn live_entries(&self) -> usize {
        self.index.values().filter(|e| e.state.is_live()).count()
    }

    /// Inserts a new entry for a key that is not indexed, as most recently used.
    fn insert(&mut self, key: L::Key, capacity: usize) -> Insertion<L> {
        let id = self.next_id;
        self.next_id += 1;
        let tick = self.tick();

        let (sender, receiver) = oneshot::channel::<LoadResult<L>>();
        let loading = receiver
            .map(|result| result.unwrap_or_else(|_| Err(Interrupted.into())))
            .boxed()
            .shared();

        self.index.insert(
            key.clone(),
            Entry {
                id,
                tick,
                loading: loading.clone(),
                state: EntryState::Loading,
            },
        );
        self.recency.insert(tick, key.clone());

        Insertion {
            loading,
            load: PendingLoad { key, id, sender },
            eviction: self.evict(capacity),
        }
    }

    /// Schedules the least recently used live entry for removal if there are too many.
    fn evict(&mut self, capacity: usize) -> Option<PendingRemoval<L>> {
        if self.live_entries() <= capacity {
            return None;
        }

        let key = self
            .recency
            .values()
            .find(|key| self.index.get(*key).is_some_and(|e| e.state.is_live()))?
            .clone();

        tracing::trace!(key = %key, "evicting least recently used entry");
        self.start_removal(&key).and_then(|(_, pending)| pending)
    }

    /// Marks the entry of `key` as removing.
    ///
    /// Returns the channel signalling the end of the removal, and the removal to spawn if it was
    /// not yet in progress.
    fn start_removal(
        &mut self,
        key: &L::Key,
    ) -> Option<(RemovalChannel, Option<PendingRemoval<L>>)> {
        let entry = self.index.get_mut(key)?;
        match &entry.state {
            EntryState::Loading | EntryState::Loaded => {
                let (sender, removal) = removal_channel();
                entry.state = EntryState::Removing {
                    removal: removal.clone(),
                };
                let pending = PendingRemoval {
                    key: key.clone(),
                    id: entry.id,
                    loading: entry.loading.clone(),
                    sender,
                };
                Some((removal, Some(pending)))
            }
            // A pending reload is kept, it still happens once the removal is done.
            EntryState::Removing { removal } | EntryState::RemovingThenReload { removal, .. } => {
                Some((removal.clone(), None))
            }
        }
    }

    /// Removes the entry with the given `id` from the cache.
    ///
    /// If a reload was requested while the entry was being removed, a new entry is inserted right
    /// away and returned along with the channel the waiting loads are listening on.
    fn unlink(
        &mut self,
        key: &L::Key,
        id: u64,
        capacity: usize,
    ) -> Option<(oneshot::Sender<LoadChannel<L>>, Insertion<L>)> {
        // The entry may be gone already after a `reset`, possibly replaced by a newer one.
        if self.index.get(key).is_none_or(|entry| entry.id != id) {
            return None;
        }

        let entry = self.index.remove(key)?;
        self.recency.remove(&entry.tick);

        match entry.state {
            EntryState::RemovingThenReload { reload, .. } => {
                Some((reload, self.insert(key.clone(), capacity)))
            }
            _ => None,
        }
    }
}

/// A bounded cache of values that are loaded and torn down asynchronously.
///
/// See the [module level documentation](super) for the guarantees this provides.
pub struct AsyncCache<L: CacheItemLoader> {
    name: &'static str,
    capacity: usize,
    loader: Arc<L>,
    inner: Arc<Mutex<Inner<L>>>,
}

impl<L: CacheItemLoader> Clone for AsyncCache<L> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        Self {
            name: self.name,
            capacity: self.capacity,
            loader: Arc::clone(&self.loader),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: CacheItemLoader> fmt::Debug for AsyncCache<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCache")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl<L: CacheItemLoader> AsyncCache<L> {
    /// Creates a new cache holding up to `capacity` live entries.
    ///
    /// A capacity of `0` is treated as `1`. The `name` tags logs and metrics.
    pub fn new(name: &'static str, capacity: usize, loader: L) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            loader: Arc::new(loader),
            inner: Arc::new(Mutex::new(Inner::new())),
        }
    }

    /// The maximum number of live entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of indexed entries, including those that are being removed.
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is indexed, regardless of whether it is being removed.
    pub fn has(&self, key: &L::Key) -> bool {
        self.inner.lock().index.contains_key(key)
    }

    /// The state of the entry of `key`, if it is indexed.
    pub fn status(&self, key: &L::Key) -> Option<EntryStatus> {
        self.inner.lock().index.get(key).map(|e| e.state.status())
    }

    /// Loads the value of `key`, reusing an existing or in-flight load.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly start the load on
    /// the runtime, even if the result is never awaited.
    pub fn load(&self, key: L::Key) -> BoxFuture<'static, LoadResult<L>> {
        let insertion = {
            let mut guard = self.inner.lock();
            let tick = guard.tick();
            let inner = &mut *guard;

            match inner.index.get_mut(&key) {
                Some(entry) => match &entry.state {
                    EntryState::Loading | EntryState::Loaded => {
                        inner.recency.remove(&entry.tick);
                        entry.tick = tick;
                        inner.recency.insert(tick, key.clone());

                        metric!(counter("caches.load") += 1, "cache" => self.name, "status" => "hit");
                        return entry.loading.clone().boxed();
                    }
                    EntryState::Removing { removal } => {
                        let removal = removal.clone();
                        let (reload, receiver) = oneshot::channel::<LoadChannel<L>>();
                        let reloading = async move {
                            match receiver.await {
                                Ok(loading) => loading.await,
                                Err(_) => Err(Interrupted.into()),
                            }
                        }
                        .boxed()
                        .shared();

                        tracing::trace!(key = %key, "deferring load until removal completed");
                        entry.state = EntryState::RemovingThenReload {
                            removal,
                            reload,
                            reloading: reloading.clone(),
                        };

                        metric!(counter("caches.load") += 1, "cache" => self.name, "status" => "deferred");
                        return reloading.boxed();
                    }
                    EntryState::RemovingThenReload { reloading, .. } => {
                        metric!(counter("caches.load") += 1, "cache" => self.name, "status" => "deferred");
                        return reloading.clone().boxed();
                    }
                },
                None => {
                    metric!(counter("caches.load") += 1, "cache" => self.name, "status" => "miss");
                    inner.insert(key, self.capacity)
                }
            }
        };

        let loading = insertion.loading.clone();
        self.spawn_insertion(insertion);
        loading.boxed()
    }

    /// Removes `key` from the cache, tearing down its value.
    ///
    /// Resolves once the entry has been unlinked. Removing an absent key is a no-op, and removing
    /// a key that is already being removed joins the in-flight removal.
    pub fn remove(&self, key: &L::Key) -> BoxFuture<'static, ()> {
        let started = self.inner.lock().start_removal(key);

        match started {
            Some((removal, pending)) => {
                if let Some(pending) = pending {
                    self.spawn_removal(pending);
                }
                removal.boxed()
            }
            None => future::ready(()).boxed(),
        }
    }

    /// Removes all entries, tearing down every value.
    ///
    /// The cache is empty as soon as this is called and can be reused right away. The returned
    /// future resolves once all removals finished. Failures are logged and otherwise ignored.
    pub fn reset(&self) -> BoxFuture<'static, ()> {
        let mut removals = Vec::new();
        let mut pending = Vec::new();

        {
            let mut inner = self.inner.lock();
            inner.recency.clear();
            for (key, entry) in std::mem::take(&mut inner.index) {
                match entry.state {
                    EntryState::Loading | EntryState::Loaded => {
                        let (sender, removal) = removal_channel();
                        removals.push(removal);
                        pending.push(PendingRemoval {
                            key,
                            id: entry.id,
                            loading: entry.loading,
                            sender,
                        });
                    }
                    EntryState::Removing { removal }
                    | EntryState::RemovingThenReload { removal, .. } => removals.push(removal),
                }
            }
        }

        tracing::debug!(cache = self.name, entries = removals.len(), "resetting cache");
        metric!(gauge("caches.entries") = 0u64, "cache" => self.name);

        for pending in pending {
            self.spawn_removal(pending);
        }

        future::join_all(removals).map(|_| ()).boxed()
    }

    fn spawn_insertion(&self, insertion: Insertion<L>) {
        self.spawn_load(insertion.load);
        if let Some(eviction) = insertion.eviction {
            self.spawn_removal(eviction);
        }
        metric!(gauge("caches.entries") = self.len() as u64, "cache" => self.name);
    }

    fn spawn_load(&self, pending: PendingLoad<L>) {
        let PendingLoad { key, id, sender } = pending;
        let computation = self.loader.load(key.clone());
        let inner = Arc::clone(&self.inner);
        let name = self.name;

        let task = async move {
            let result = match AssertUnwindSafe(computation).catch_unwind().await {
                Ok(result) => result,
                Err(_) => {
                    tracing::error!(cache = name, key = %key, "cache loader panicked");
                    Err(Interrupted.into())
                }
            };

            if let Some(entry) = inner.lock().index.get_mut(&key) {
                if entry.id == id && matches!(entry.state, EntryState::Loading) {
                    entry.state = EntryState::Loaded;
                }
            }

            if let Err(error) = &result {
                tracing::debug!(
                    cache = name,
                    key = %key,
                    error = error as &dyn std::error::Error,
                    "failed to load cache entry"
                );
            }
            // Nobody may be listening anymore.
            sender.send(result).ok();
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        tokio::spawn(task);
    }

    fn spawn_removal(&self, pending: PendingRemoval<L>) {
        let PendingRemoval {
            key,
            id,
            loading,
            sender,
        } = pending;
        let cache = self.clone();

        let task = async move {
            match loading.await {
                Ok(value) => {
                    if let Err(error) = cache.loader.remove(key.clone(), value).await {
                        metric!(counter("caches.remove.failed") += 1, "cache" => cache.name);
                        tracing::error!(
                            cache = cache.name,
                            key = %key,
                            error = &error as &dyn std::error::Error,
                            "failed to remove cache entry"
                        );
                    }
                }
                // There is nothing to tear down.
                Err(error) => tracing::debug!(
                    cache = cache.name,
                    key = %key,
                    error = &error as &dyn std::error::Error,
                    "removing entry that failed to load"
                ),
            }

            let reload = cache.inner.lock().unlink(&key, id, cache.capacity);
            metric!(counter("caches.removed") += 1, "cache" => cache.name);

            match reload {
                Some((reload, insertion)) => {
                    tracing::trace!(cache = cache.name, key = %key, "reloading removed entry");
                    let loading = insertion.loading.clone();
                    cache.spawn_insertion(insertion);
                    reload.send(loading).ok();
                }
                None => {
                    metric!(gauge("caches.entries") = cache.len() as u64, "cache" => cache.name);
                }
            }

            sender.send(()).ok();
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        tokio::spawn(task);
    }
}
