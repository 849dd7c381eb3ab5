use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};

use crate::error::CacheError;
use crate::utils::CallOnDrop;

type ComputationChannel<V, E> = Shared<oneshot::Receiver<Result<V, E>>>;

/// A running computation that late callers can attach to.
struct InFlightEntry<V, E> {
    /// Distinguishes this computation from a later one for the same key.
    id: u64,
    channel: ComputationChannel<V, E>,
}

struct Computations<K, V, E> {
    entries: HashMap<K, InFlightEntry<V, E>>,
    next_id: u64,
}

impl<K: Eq + Hash, V, E> Computations<K, V, E> {
    /// Removes the entry for `key` if it still belongs to computation `id`.
    fn finish(&mut self, key: &K, id: u64) -> bool {
        if self.entries.get(key).is_some_and(|entry| entry.id == id) {
            self.entries.remove(key);
            true
        } else {
            false
        }
    }
}

/// Deduplicates concurrent computations by key.
///
/// The first caller for a key starts the producer, every caller arriving while it runs attaches
/// to the same shared result instead. The producer is spawned as its own task: callers that give
/// up waiting do not cancel it, and its outcome is still delivered to everyone else.
///
/// Nothing is remembered once a computation settles, keeping results around is the job of a
/// [`ResultStore`](crate::ResultStore).
pub struct InFlightRegistry<K, V, E> {
    name: Arc<str>,
    computations: Arc<Mutex<Computations<K, V, E>>>,
}

impl<K, V, E> Clone for InFlightRegistry<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            computations: Arc::clone(&self.computations),
        }
    }
}

impl<K, V, E> fmt::Debug for InFlightRegistry<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let running = self
            .computations
            .try_lock()
            .map(|c| c.entries.len())
            .unwrap_or_default();
        f.debug_struct("InFlightRegistry")
            .field("name", &self.name)
            .field("running computations", &running)
            .finish()
    }
}

impl<K, V, E> InFlightRegistry<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates an empty registry.
    ///
    /// The `name` is used to tag metrics.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            computations: Arc::new(Mutex::new(Computations {
                entries: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    /// Attaches to the running computation for `key`, or starts `producer` if there is none.
    ///
    /// NOTE: This function itself is *not* `async`, because it eagerly spawns the computation
    /// on the current tokio runtime, even if the returned future is never awaited.
    ///
    /// # Panics
    ///
    /// Panics when starting a computation outside of a tokio runtime.
    pub fn attach_or_start<F, Fut>(
        &self,
        key: K,
        producer: F,
    ) -> BoxFuture<'static, Result<V, CacheError<E>>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.attach_or_start_with(key, |_| None, producer, |_, _| {})
    }

    /// Like [`attach_or_start`](Self::attach_or_start), with two hooks that run inside the
    /// registry's critical section.
    ///
    /// `probe` is consulted before looking for a running computation. If it returns an outcome,
    /// that outcome is returned and nothing is started.
    ///
    /// `publish` sees the outcome of a started computation right before its entry is removed.
    /// Anything it makes visible is therefore visible before a new computation for the same key
    /// can start, and before any waiter receives the outcome.
    pub(crate) fn attach_or_start_with<P, F, Fut, S>(
        &self,
        key: K,
        probe: P,
        producer: F,
        publish: S,
    ) -> BoxFuture<'static, Result<V, CacheError<E>>>
    where
        P: FnOnce(&K) -> Option<Result<V, E>>,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        S: FnOnce(&K, &Result<V, E>) + Send + 'static,
    {
        let name = &self.name;

        let channel = {
            let mut computations = self.computations.lock();

            if let Some(outcome) = probe(&key) {
                return Box::pin(future::ready(outcome.map_err(CacheError::Producer)));
            }

            if let Some(entry) = computations.entries.get(&key) {
                // A concurrent lookup was deduplicated.
                metric!(counter("caches.channel.hit") += 1, "cache" => name);
                entry.channel.clone()
            } else {
                metric!(counter("caches.channel.miss") += 1, "cache" => name);
                // Outside of a runtime this panics before anything is registered.
                let runtime = tokio::runtime::Handle::current();

                let id = computations.next_id;
                computations.next_id += 1;

                let (sender, receiver) = oneshot::channel();
                let channel = receiver.shared();
                // The entry has to exist before the producer is first polled, so that a producer
                // that settles immediately still finds (and removes) it.
                let evicted = computations.entries.insert(
                    key.clone(),
                    InFlightEntry {
                        id,
                        channel: channel.clone(),
                    },
                );
                debug_assert!(evicted.is_none());

                self.spawn_computation(&runtime, key, id, sender, producer, publish);
                channel
            }
        };

        let future = channel.map(|outcome| match outcome {
            Ok(result) => result.map_err(CacheError::Producer),
            Err(oneshot::Canceled) => Err(CacheError::Interrupted),
        });
        Box::pin(future)
    }

    fn spawn_computation<F, Fut, S>(
        &self,
        runtime: &tokio::runtime::Handle,
        key: K,
        id: u64,
        sender: oneshot::Sender<Result<V, E>>,
        producer: F,
        publish: S,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        S: FnOnce(&K, &Result<V, E>) + Send + 'static,
    {
        let name = Arc::clone(&self.name);
        let computations = Arc::clone(&self.computations);

        // Removes the entry in case the producer panics, which drops `sender` and lets every
        // waiter observe `Interrupted`.
        let remove_computation_token = {
            let computations = Arc::clone(&computations);
            let key = key.clone();
            CallOnDrop::new(move || {
                computations.lock().finish(&key, id);
            })
        };

        let task = async move {
            metric!(counter("caches.computation") += 1, "cache" => &name);
            let result = producer().await;
            if result.is_err() {
                metric!(counter("caches.computation.failed") += 1, "cache" => &name);
            }

            {
                let mut computations = computations.lock();
                publish(&key, &result);
                let removed = computations.finish(&key, id);
                debug_assert!(removed);
            }
            drop(remove_computation_token);

            tracing::trace!(cache = %name, id, ok = result.is_ok(), "Computation settled");
            sender.send(result).ok();
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        runtime.spawn(task);
    }

    /// Whether a computation for `key` is currently running.
    pub fn contains(&self, key: &K) -> bool {
        self.computations.lock().entries.contains_key(key)
    }

    /// The number of currently running computations.
    pub fn len(&self) -> usize {
        self.computations.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
