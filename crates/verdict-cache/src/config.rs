use std::time::Duration;

use serde::Deserialize;

/// What happens to a failed computation once it settles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Failures are handed to the waiting callers and then forgotten. The next caller computes
    /// again.
    #[default]
    Propagate,
    /// Failures are stored like successful results, with the given time-to-live.
    CacheFor(Duration),
}

/// Configuration of a single [`CoalescingCache`](crate::CoalescingCache).
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Name of the cache, used to tag metrics and logs.
    pub name: String,

    /// How long successful results are kept.
    ///
    /// `null` keeps results until they are explicitly invalidated.
    #[serde(with = "humantime_serde")]
    pub ttl: Option<Duration>,

    /// How long failed computations are kept.
    ///
    /// Defaults to not keeping them at all, so every call after a failure computes again.
    #[serde(with = "humantime_serde")]
    pub cache_failures_for: Option<Duration>,
}

impl CacheConfig {
    pub fn failure_policy(&self) -> FailurePolicy {
        match self.cache_failures_for {
            Some(ttl) => FailurePolicy::CacheFor(ttl),
            None => FailurePolicy::Propagate,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            ttl: Some(Duration::from_secs(30 * 60)),
            cache_failures_for: None,
        }
    }
}
