//! # Bounded asynchronous caching
//!
//! Opening a store is expensive: it involves a network handshake with other peers and a sync of
//! the store's history. The pinner thus keeps a bounded number of stores open, and reuses them
//! for subsequent requests. This module contains the generic cache that does this bookkeeping.
//!
//! ## [`AsyncCache`]
//!
//! The cache maps keys to values that are produced by an asynchronous loader, and torn down by an
//! asynchronous remover, both provided by a [`CacheItemLoader`]. It guarantees the following,
//! regardless of how concurrent requests interleave:
//!
//! - There is at most one in-flight load per key. Concurrent loads of the same key share the
//!   same computation, and all callers observe the same outcome.
//! - The remover runs at most once per entry, and only after the entry's load has resolved.
//!   Concurrent removals of the same key share the same in-flight teardown.
//! - An entry stays indexed, and counts towards [`AsyncCache::len`], until its remover has
//!   completed or failed. A removed resource is thus never considered gone while it is still
//!   being closed.
//! - A load for a key that is being removed does not open the resource a second time in
//!   parallel. It is deferred until the removal completed, and then reloads the entry.
//!
//! All bookkeeping happens synchronously under a lock. Only the outcomes of loads and removals
//! are asynchronous. Loads and removals are spawned eagerly on the runtime, so they make progress
//! even if the returned futures are never awaited.
//!
//! ### Entry states
//!
//! Each entry is in one of these states, see [`EntryStatus`]:
//!
//! - `Loading`: the loader is running.
//! - `Loaded`: the loader resolved, either successfully or with an error. Failed loads stay
//!   cached until they are explicitly removed, every caller gets the same error.
//! - `Removing`: the remover is scheduled or running. The entry is never promoted in this state.
//! - `RemovingThenReload`: like `Removing`, but a load is waiting for the removal to finish, after
//!   which the entry is added again. All loads arriving in this state wait for the same reload.
//!   Removing the key again joins the in-flight removal and keeps the pending reload.
//!
//! ### Eviction
//!
//! The cache has a capacity which bounds the number of *live* entries, those that are loading or
//! loaded. When an insertion brings the number of live entries above capacity, the least recently
//! used live entry is scheduled for removal. The insertion does not wait for the eviction, so the
//! total number of indexed entries may exceed the capacity while evictions are in flight.
//!
//! ### Metrics
//!
//! Every metric is tagged with a `cache` field naming the cache:
//!
//! - `caches.load`: All loads, tagged with a `status` of `hit`, `miss` or `deferred`.
//! - `caches.removed`: Entries which were unlinked after their removal.
//! - `caches.remove.failed`: Removals where the remover failed.
//! - `caches.entries`: A gauge of the number of indexed entries.

use std::fmt;
use std::hash::Hash;

use futures::future::{self, BoxFuture};

mod async_cache;

pub use async_cache::{AsyncCache, EntryStatus};

/// The cache gave up on an operation before it could complete.
///
/// This happens when the cache is [`reset`](AsyncCache::reset) while a deferred load is waiting
/// for a removal, or when a loader panicked.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("the cache operation was interrupted")]
pub struct Interrupted;

/// Produces and tears down the values of an [`AsyncCache`].
///
/// Both methods return boxed `'static` futures, as they are spawned onto the runtime. Any state
/// they need has to be cloned into the future.
pub trait CacheItemLoader: Send + Sync + 'static {
    /// The key identifying a cached value.
    type Key: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static;

    /// The cached value. It is cloned out to every caller of [`AsyncCache::load`].
    type Value: Clone + Send + Sync + 'static;

    /// The error of a failed load or removal.
    type Error: std::error::Error + Clone + From<Interrupted> + Send + Sync + 'static;

    /// Loads the value for the given key.
    ///
    /// This is invoked at most once per entry, right when the entry is inserted.
    fn load(&self, key: Self::Key) -> BoxFuture<'static, Result<Self::Value, Self::Error>>;

    /// Tears down a value that was successfully loaded.
    ///
    /// Errors are logged, and the entry is removed from the cache regardless.
    fn remove(
        &self,
        key: Self::Key,
        value: Self::Value,
    ) -> BoxFuture<'static, Result<(), Self::Error>> {
        let _ = (key, value);
        Box::pin(future::ok(()))
    }
}
