use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::clock::Clock;

/// A value held by a [`ResultStore`].
///
/// Entries are immutable. Writing the same key again creates a new entry with a higher
/// [`generation`](Self::generation).
#[derive(Debug)]
pub struct CacheEntry<K, V> {
    key: K,
    value: V,
    inserted_at: Instant,
    ttl: Option<Duration>,
    generation: u64,
}

impl<K, V> CacheEntry<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn inserted_at(&self) -> Instant {
        self.inserted_at
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// The store-wide sequence number assigned when this entry was written.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The instant at which this entry expires, if it expires at all.
    pub fn deadline(&self) -> Option<Instant> {
        self.ttl
            .and_then(|ttl| self.inserted_at.checked_add(ttl))
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| deadline <= now)
    }
}

/// A pending eviction, ordered by deadline.
struct Expiry<K> {
    deadline: Instant,
    generation: u64,
    key: K,
}

impl<K> PartialEq for Expiry<K> {
    fn eq(&self, other: &Self) -> bool {
        (self.deadline, self.generation) == (other.deadline, other.generation)
    }
}

impl<K> Eq for Expiry<K> {}

impl<K> PartialOrd for Expiry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Expiry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.generation).cmp(&(other.deadline, other.generation))
    }
}

struct StoreState<K, V> {
    entries: HashMap<K, Arc<CacheEntry<K, V>>>,
    /// Min-heap of all deadlines handed out, including ones whose entry has since been replaced.
    expirations: BinaryHeap<Reverse<Expiry<K>>>,
    /// Instants at which a sweep has been scheduled on the clock.
    armed: BTreeSet<Instant>,
    next_generation: u64,
}

struct StoreInner<K, V> {
    name: Arc<str>,
    clock: Arc<dyn Clock>,
    state: Mutex<StoreState<K, V>>,
}

/// A key-value store whose entries optionally expire after a time-to-live.
///
/// Expiration is driven by a single sweep: all deadlines live in one time-ordered heap and the
/// store only keeps a timer armed for the earliest one. When it fires, every due entry is evicted,
/// unless the key has been written again in the meantime. An eviction only ever removes the
/// exact generation it was scheduled for.
///
/// The store is a cheap handle, clones share the same entries.
pub struct ResultStore<K, V> {
    inner: Arc<StoreInner<K, V>>,
}

impl<K, V> Clone for ResultStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> fmt::Debug for ResultStore<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ResultStore")
            .field("name", &self.inner.name)
            .field("entries", &state.entries.len())
            .field("pending expirations", &state.expirations.len())
            .field("clock", &self.inner.clock)
            .finish()
    }
}

impl<K, V> ResultStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty store.
    ///
    /// The `name` is used to tag metrics.
    pub fn new(name: impl Into<Arc<str>>, clock: Arc<dyn Clock>) -> Self {
        let inner = StoreInner {
            name: name.into(),
            clock,
            state: Mutex::new(StoreState {
                entries: HashMap::new(),
                expirations: BinaryHeap::new(),
                armed: BTreeSet::new(),
                next_generation: 0,
            }),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Inserts `value` under `key`, replacing whatever was stored before.
    ///
    /// With a `ttl`, the entry is evicted once it has elapsed. Without one it stays until it is
    /// explicitly removed or overwritten.
    pub fn put(&self, key: K, value: V, ttl: Option<Duration>) -> Arc<CacheEntry<K, V>> {
        let inserted_at = self.inner.clock.now();

        let (entry, arm_at) = {
            let mut state = self.inner.state.lock();
            let generation = state.next_generation;
            state.next_generation += 1;

            let entry = Arc::new(CacheEntry {
                key: key.clone(),
                value,
                inserted_at,
                ttl,
                generation,
            });
            state.entries.insert(key.clone(), Arc::clone(&entry));

            let mut arm_at = None;
            if let Some(deadline) = entry.deadline() {
                state.expirations.push(Reverse(Expiry {
                    deadline,
                    generation,
                    key,
                }));
                if state.armed.first().is_none_or(|armed| *armed > deadline) {
                    state.armed.insert(deadline);
                    arm_at = Some(deadline);
                }
            }
            (entry, arm_at)
        };

        if let Some(deadline) = arm_at {
            StoreInner::arm(&self.inner, deadline);
        }
        entry
    }

    /// Returns the value currently stored under `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entry(key).map(|entry| entry.value.clone())
    }

    /// Returns the full entry currently stored under `key`.
    ///
    /// An entry whose deadline has passed is reported as absent even if the sweep did not get to
    /// it yet.
    pub fn entry(&self, key: &K) -> Option<Arc<CacheEntry<K, V>>> {
        let now = self.inner.clock.now();
        let state = self.inner.state.lock();
        state
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .cloned()
    }

    /// Removes the entry for `key`, if there is one.
    pub fn remove(&self, key: &K) {
        let removed = self.inner.state.lock().entries.remove(key);
        if let Some(entry) = removed {
            tracing::trace!(
                cache = %self.inner.name,
                generation = entry.generation,
                "Removed cache entry"
            );
        }
    }

    /// The number of entries currently held, including expired ones that were not swept yet.
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> StoreInner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Schedules a sweep at `deadline`.
    ///
    /// The scheduled action only holds a weak reference, dropping the store cancels it.
    fn arm(this: &Arc<Self>, deadline: Instant) {
        let weak: Weak<Self> = Arc::downgrade(this);
        this.clock.schedule(
            deadline,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    Self::sweep(&inner, deadline);
                }
            }),
        );
    }

    /// Evicts every entry that is due, then re-arms for the next pending deadline.
    fn sweep(this: &Arc<Self>, wake: Instant) {
        let now = this.clock.now();
        let mut evicted: i64 = 0;
        let mut stale: i64 = 0;

        let arm_at = {
            let mut state = this.state.lock();
            state.armed.remove(&wake);

            while state
                .expirations
                .peek()
                .is_some_and(|Reverse(expiry)| expiry.deadline <= now)
            {
                let Some(Reverse(expiry)) = state.expirations.pop() else {
                    break;
                };
                let is_current = state
                    .entries
                    .get(&expiry.key)
                    .is_some_and(|entry| entry.generation == expiry.generation);
                if is_current {
                    state.entries.remove(&expiry.key);
                    evicted += 1;
                } else {
                    // overwritten or removed since the deadline was recorded
                    stale += 1;
                }
            }

            let next = state
                .expirations
                .peek()
                .map(|Reverse(expiry)| expiry.deadline);
            match next {
                Some(next) if state.armed.first().is_none_or(|armed| *armed > next) => {
                    state.armed.insert(next);
                    Some(next)
                }
                _ => None,
            }
        };

        if evicted > 0 {
            metric!(counter("caches.eviction") += evicted, "cache" => &this.name);
        }
        if stale > 0 {
            metric!(counter("caches.eviction.stale") += stale, "cache" => &this.name);
        }
        tracing::trace!(cache = %this.name, evicted, stale, "Swept expired cache entries");

        if let Some(deadline) = arm_at {
            Self::arm(this, deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, TokioClock};

    fn store() -> (ManualClock, ResultStore<&'static str, u32>) {
        let clock = ManualClock::new();
        let store = ResultStore::new("test", Arc::new(clock.clone()));
        (clock, store)
    }

    #[test]
    fn test_put_get_remove() {
        let (_clock, store) = store();
        assert_eq!(store.get(&"a"), None);

        store.put("a", 1, None);
        assert_eq!(store.get(&"a"), Some(1));

        store.put("a", 2, None);
        assert_eq!(store.get(&"a"), Some(2));
        assert_eq!(store.len(), 1);

        store.remove(&"a");
        assert_eq!(store.get(&"a"), None);
        // removing again is fine
        store.remove(&"a");
        store.remove(&"never-inserted");
        assert!(store.is_empty());
    }

    #[test]
    fn test_generations_increase() {
        let (_clock, store) = store();

        let first = store.put("a", 1, None);
        let other = store.put("b", 1, None);
        store.remove(&"a");
        let second = store.put("a", 1, None);

        assert!(first.generation() < other.generation());
        assert!(other.generation() < second.generation());
        assert_eq!(store.entry(&"a").unwrap().generation(), second.generation());
    }

    #[test]
    fn test_ttl_expiry() {
        let (clock, store) = store();
        let entry = store.put("a", 1, Some(Duration::from_secs(30)));
        assert_eq!(entry.deadline(), Some(entry.inserted_at() + Duration::from_secs(30)));

        assert_eq!(store.get(&"a"), Some(1));

        clock.advance(Duration::from_secs(29));
        assert_eq!(store.get(&"a"), Some(1));
        assert_eq!(store.len(), 1);

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get(&"a"), None);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_no_ttl_never_expires() {
        let (clock, store) = store();
        store.put("a", 1, None);
        assert_eq!(clock.pending(), 0);

        clock.advance(Duration::from_secs(3600 * 24 * 365));
        assert_eq!(store.get(&"a"), Some(1));
    }

    #[test]
    fn test_stale_timer_does_not_evict_refreshed_entry() {
        let (clock, store) = store();
        store.put("a", 1, Some(Duration::from_secs(10)));

        clock.advance(Duration::from_secs(5));
        store.remove(&"a");
        store.put("a", 2, Some(Duration::from_secs(10)));

        // the first deadline passes
        clock.advance(Duration::from_secs(5));
        assert_eq!(store.get(&"a"), Some(2));
        assert_eq!(store.len(), 1);

        // the refreshed deadline passes
        clock.advance(Duration::from_secs(5));
        assert_eq!(store.get(&"a"), None);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_overwrite_without_ttl_survives_old_deadline() {
        let (clock, store) = store();
        store.put("a", 1, Some(Duration::from_secs(10)));
        store.put("a", 2, None);

        clock.advance(Duration::from_secs(60));
        assert_eq!(store.get(&"a"), Some(2));
    }

    #[test]
    fn test_single_armed_timer() {
        let (clock, store) = store();
        store.put("a", 1, Some(Duration::from_secs(10)));
        store.put("b", 1, Some(Duration::from_secs(20)));
        store.put("c", 1, Some(Duration::from_secs(30)));
        // later deadlines are picked up by the sweep, not by their own timers
        assert_eq!(clock.pending(), 1);

        store.put("d", 1, Some(Duration::from_secs(5)));
        assert_eq!(clock.pending(), 2);

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.get(&"a"), None);
        assert_eq!(store.get(&"d"), None);
        assert_eq!(store.get(&"b"), Some(1));
        assert_eq!(clock.pending(), 1);

        clock.advance(Duration::from_secs(20));
        assert!(store.is_empty());
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn test_zero_ttl() {
        let (clock, store) = store();
        store.put("a", 1, Some(Duration::ZERO));
        assert_eq!(store.get(&"a"), None);

        clock.advance(Duration::ZERO);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_dropped_store_ignores_timer() {
        let (clock, store) = store();
        store.put("a", 1, Some(Duration::from_secs(1)));
        drop(store);

        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.pending(), 0);
    }

    #[tokio::test]
    async fn test_ttl_expiry_tokio() {
        tokio::time::pause();
        let store = ResultStore::new("test", Arc::new(TokioClock::current()));

        store.put("a", 1, Some(Duration::from_secs(1800)));
        assert_eq!(store.get(&"a"), Some(1));

        tokio::time::sleep(Duration::from_secs(1799)).await;
        assert_eq!(store.get(&"a"), Some(1));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.get(&"a"), None);
        assert!(store.is_empty());
    }
}
