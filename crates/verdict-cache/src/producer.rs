use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, TryFutureExt};

use crate::clock::Clock;
use crate::coalesce::CoalescingCache;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::key::{CacheKey, KeyError};

/// An expensive async computation whose results can be cached.
///
/// The computation is expected to be idempotent: calling it twice with arguments that map to
/// the same [`CacheKey`] has to yield equivalent results, and must not have side effects
/// beyond computing them.
pub trait Producer: Send + Sync + 'static {
    /// The arguments of a single call.
    type Args: Send + 'static;
    /// The result of a successful call.
    type Output: Clone + Send + Sync + 'static;
    /// The result of a failed call.
    type Error: Clone + Send + Sync + 'static;

    /// Derives the key under which the result for `args` is cached.
    fn cache_key(&self, args: &Self::Args) -> Result<CacheKey, KeyError>;

    /// Runs the computation.
    fn produce(&self, args: Self::Args) -> BoxFuture<'static, Result<Self::Output, Self::Error>>;
}

/// A [`Producer`] combined with a [`CoalescingCache`].
///
/// Calling it has the same shape as calling the producer directly, but results are cached for
/// the configured time-to-live, and concurrent calls with equal arguments share one run.
pub struct Coalesced<P: Producer> {
    producer: Arc<P>,
    cache: CoalescingCache<CacheKey, P::Output, P::Error>,
    ttl: Option<Duration>,
}

impl<P: Producer> Clone for Coalesced<P> {
    fn clone(&self) -> Self {
        Self {
            producer: Arc::clone(&self.producer),
            cache: self.cache.clone(),
            ttl: self.ttl,
        }
    }
}

impl<P: Producer + fmt::Debug> fmt::Debug for Coalesced<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coalesced")
            .field("producer", &self.producer)
            .field("cache", &self.cache)
            .finish()
    }
}

impl<P: Producer> Coalesced<P> {
    /// Puts `cache` in front of `producer`, using the cache's time-to-live.
    pub fn new(producer: P, cache: CoalescingCache<CacheKey, P::Output, P::Error>) -> Self {
        let ttl = cache.ttl();
        Self {
            producer: Arc::new(producer),
            cache,
            ttl,
        }
    }

    /// Calls the producer, or returns the result of an earlier or concurrent call.
    ///
    /// If no key can be derived from `args`, the cache is bypassed.
    pub fn call(
        &self,
        args: P::Args,
    ) -> BoxFuture<'static, Result<P::Output, CacheError<P::Error>>> {
        let key = match self.producer.cache_key(&args) {
            Ok(key) => key,
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "Failed to derive cache key, calling producer uncached"
                );
                return Box::pin(self.producer.produce(args).map_err(CacheError::Producer));
            }
        };

        tracing::trace!(%key, "Looking up coalesced call");
        let producer = Arc::clone(&self.producer);
        self.cache
            .get_or_compute(key, move || producer.produce(args), self.ttl)
    }

    pub fn producer(&self) -> &P {
        &self.producer
    }

    pub fn cache(&self) -> &CoalescingCache<CacheKey, P::Output, P::Error> {
        &self.cache
    }
}

/// Returns a constructor that wraps a [`Producer`] in a fresh [`CoalescingCache`].
///
/// ```
/// # use std::sync::Arc;
/// # use futures::future::{BoxFuture, FutureExt};
/// # use verdict_cache::{CacheConfig, CacheKey, KeyError, ManualClock, Producer, with_coalescing_cache};
/// struct Double;
///
/// impl Producer for Double {
///     type Args = u32;
///     type Output = u32;
///     type Error = String;
///
///     fn cache_key(&self, args: &u32) -> Result<CacheKey, KeyError> {
///         Ok(CacheKey::builder().arg(args)?.build())
///     }
///
///     fn produce(&self, args: u32) -> BoxFuture<'static, Result<u32, String>> {
///         async move { Ok(args * 2) }.boxed()
///     }
/// }
///
/// let double = with_coalescing_cache(CacheConfig::default(), Arc::new(ManualClock::new()))(Double);
/// ```
pub fn with_coalescing_cache<P: Producer>(
    config: CacheConfig,
    clock: Arc<dyn Clock>,
) -> impl FnOnce(P) -> Coalesced<P> {
    move |producer| Coalesced::new(producer, CoalescingCache::new(&config, clock))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;

    use super::*;
    use crate::clock::TokioClock;

    /// A call shaped like `f(a=.., b=..)`, keyword arguments in call-site order.
    type Kwargs = Vec<(&'static str, i64)>;

    #[derive(Debug, Default)]
    struct SumKwargs {
        calls: Arc<AtomicUsize>,
    }

    impl Producer for SumKwargs {
        type Args = Kwargs;
        type Output = i64;
        type Error = String;

        fn cache_key(&self, args: &Kwargs) -> Result<CacheKey, KeyError> {
            let mut builder = CacheKey::builder();
            for (name, value) in args {
                builder = builder.kwarg(name, value)?;
            }
            Ok(builder.build())
        }

        fn produce(&self, args: Kwargs) -> BoxFuture<'static, Result<i64, String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(args.iter().map(|(_, v)| v).sum()) }.boxed()
        }
    }

    fn coalesced() -> Coalesced<SumKwargs> {
        with_coalescing_cache(CacheConfig::default(), Arc::new(TokioClock::current()))(
            SumKwargs::default(),
        )
    }

    #[tokio::test]
    async fn test_keyword_order_hits_same_entry() {
        let sum = coalesced();

        let first = sum.call(vec![("a", 1), ("b", 2)]).await;
        let second = sum.call(vec![("b", 2), ("a", 1)]).await;

        assert_eq!(first, Ok(3));
        assert_eq!(second, Ok(3));
        assert_eq!(sum.producer().calls.load(Ordering::SeqCst), 1);
        assert_eq!(sum.cache().store().len(), 1);
    }

    #[tokio::test]
    async fn test_different_arguments_are_computed_separately() {
        let sum = coalesced();

        assert_eq!(sum.call(vec![("a", 1)]).await, Ok(1));
        assert_eq!(sum.call(vec![("a", 2)]).await, Ok(2));
        assert_eq!(sum.producer().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_key_bypasses_cache() {
        let sum = coalesced();

        let duplicate = vec![("a", 1), ("a", 2)];
        assert_eq!(sum.call(duplicate.clone()).await, Ok(3));
        assert_eq!(sum.call(duplicate).await, Ok(3));

        assert_eq!(sum.producer().calls.load(Ordering::SeqCst), 2);
        assert!(sum.cache().store().is_empty());
    }

    #[tokio::test]
    async fn test_uses_configured_ttl() {
        tokio::time::pause();
        let config = CacheConfig {
            ttl: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let sum = with_coalescing_cache(config, Arc::new(TokioClock::current()))(
            SumKwargs::default(),
        );

        sum.call(vec![("a", 1)]).await.unwrap();
        tokio::time::sleep(Duration::from_secs(59)).await;
        sum.call(vec![("a", 1)]).await.unwrap();
        assert_eq!(sum.producer().calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        sum.call(vec![("a", 1)]).await.unwrap();
        assert_eq!(sum.producer().calls.load(Ordering::SeqCst), 2);
    }
}
