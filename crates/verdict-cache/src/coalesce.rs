use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::clock::Clock;
use crate::config::{CacheConfig, FailurePolicy};
use crate::error::CacheError;
use crate::inflight::InFlightRegistry;
use crate::store::ResultStore;

/// A memoizing cache for async computations with request coalescing.
///
/// Each key is looked up in a [`ResultStore`] first. On a miss, concurrent callers for the same
/// key share a single run of the producer through an [`InFlightRegistry`]. A successful result
/// is written to the store before the computation is marked as finished, so once any caller has
/// seen it, every later caller gets it from the store.
///
/// Failures are not stored unless the [`FailurePolicy`] says so.
pub struct CoalescingCache<K, V, E> {
    name: Arc<str>,
    ttl: Option<Duration>,
    failures: FailurePolicy,
    store: ResultStore<K, Result<V, E>>,
    registry: InFlightRegistry<K, V, E>,
}

impl<K, V, E> Clone for CoalescingCache<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            ttl: self.ttl,
            failures: self.failures,
            store: self.store.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<K, V, E> fmt::Debug for CoalescingCache<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescingCache")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .field("failures", &self.failures)
            .field("store", &self.store)
            .field("registry", &self.registry)
            .finish()
    }
}

impl<K, V, E> CoalescingCache<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates an empty cache.
    pub fn new(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let name: Arc<str> = config.name.as_str().into();
        Self {
            store: ResultStore::new(Arc::clone(&name), clock),
            registry: InFlightRegistry::new(Arc::clone(&name)),
            name,
            ttl: config.ttl,
            failures: config.failure_policy(),
        }
    }

    /// The time-to-live configured for successful results.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Returns the result for `key`, computing it with `producer` if necessary.
    ///
    /// A fresh result is kept for `ttl`, or until it is invalidated when `ttl` is `None`.
    ///
    /// NOTE: This function itself is *not* `async`. The lookup happens, and a computation is
    /// spawned, right away, even if the returned future is never awaited.
    ///
    /// # Panics
    ///
    /// Panics when a computation has to be started outside of a tokio runtime.
    pub fn get_or_compute<F, Fut>(
        &self,
        key: K,
        producer: F,
        ttl: Option<Duration>,
    ) -> BoxFuture<'static, Result<V, CacheError<E>>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let name = &self.name;
        metric!(counter("caches.access") += 1, "cache" => name);

        let probe = |key: &K| {
            let cached = self.store.get(key);
            if cached.is_some() {
                metric!(counter("caches.memory.hit") += 1, "cache" => name);
            }
            cached
        };

        let store = self.store.clone();
        let failures = self.failures;
        let publish = move |key: &K, result: &Result<V, E>| match (result, failures) {
            (Ok(_), _) => {
                store.put(key.clone(), result.clone(), ttl);
            }
            (Err(_), FailurePolicy::CacheFor(failure_ttl)) => {
                store.put(key.clone(), result.clone(), Some(failure_ttl));
            }
            (Err(_), FailurePolicy::Propagate) => {}
        };

        self.registry
            .attach_or_start_with(key, probe, producer, publish)
    }

    /// Returns the stored outcome for `key` without computing anything.
    pub fn get(&self, key: &K) -> Option<Result<V, E>> {
        self.store.get(key)
    }

    /// Drops the stored outcome for `key`.
    ///
    /// A computation that is currently running for `key` is not affected, and will store its
    /// result when it finishes.
    pub fn invalidate(&self, key: &K) {
        self.store.remove(key);
    }

    pub fn store(&self) -> &ResultStore<K, Result<V, E>> {
        &self.store
    }

    pub fn registry(&self) -> &InFlightRegistry<K, V, E> {
        &self.registry
    }
}
