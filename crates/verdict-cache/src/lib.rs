//! An async memoizing cache with request coalescing and time-based expiry.
//!
//! The building blocks are:
//!
//! - A [`ResultStore`], which holds finished results and evicts them once their time-to-live has
//!   elapsed, driven by a [`Clock`].
//! - An [`InFlightRegistry`], which makes sure that concurrent callers asking for the same key
//!   share a single running computation.
//! - A [`CoalescingCache`], which puts both together: results are served from the store, and a
//!   miss starts (or joins) exactly one computation whose result is stored before anyone sees it.
//!
//! On top of that, [`Coalesced`] wraps any [`Producer`] so that calling it transparently goes
//! through a [`CoalescingCache`], keyed by a [`CacheKey`] derived from the call arguments.

#[macro_use]
pub mod metrics;

mod clock;
mod coalesce;
mod config;
mod error;
mod inflight;
mod key;
mod producer;
mod store;
mod utils;

pub use clock::{Action, Clock, ManualClock, TokioClock};
pub use coalesce::CoalescingCache;
pub use config::{CacheConfig, FailurePolicy};
pub use error::CacheError;
pub use inflight::InFlightRegistry;
pub use key::{CacheKey, CacheKeyBuilder, KeyError};
pub use producer::{Coalesced, Producer, with_coalescing_cache};
pub use store::{CacheEntry, ResultStore};
