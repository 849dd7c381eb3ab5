use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::Instant;

/// A deferred action handed to a [`Clock`].
pub type Action = Box<dyn FnOnce() + Send + 'static>;

/// Source of the current time, and a way to run an action once a deadline has been reached.
///
/// The cache never reads the system time directly. All timestamps and deferred evictions go
/// through this trait, which allows tests to substitute a simulated clock.
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    /// Returns the current time.
    fn now(&self) -> Instant;

    /// Runs `action` once `deadline` has been reached.
    ///
    /// The action must never run before `deadline`, but may run arbitrarily late.
    fn schedule(&self, deadline: Instant, action: Action);
}

/// A [`Clock`] backed by the tokio timer of a specific runtime.
///
/// Deferred actions are spawned as tasks onto the runtime the clock was created with, so
/// [`tokio::time::pause`] and [`tokio::time::advance`] apply to them as well.
#[derive(Clone, Debug)]
pub struct TokioClock {
    handle: Handle,
}

impl TokioClock {
    /// Creates a clock that spawns its timers onto the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Creates a clock bound to the runtime of the current context.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn schedule(&self, deadline: Instant, action: Action) {
        self.handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            action();
        });
    }
}

/// A simulated [`Clock`] that only moves forward when told to.
///
/// Scheduled actions are fired synchronously from within [`advance`](Self::advance), in deadline
/// order, with [`now`](Clock::now) reporting the deadline of the action that is being run.
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

struct ManualState {
    now: Instant,
    next_seq: u64,
    pending: BTreeMap<(Instant, u64), Action>,
}

impl ManualClock {
    /// Creates a new simulated clock, starting at the current real time.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState {
                now: Instant::now(),
                next_seq: 0,
                pending: BTreeMap::new(),
            })),
        }
    }

    /// Moves the clock forward by `by`, running every action that became due on the way.
    ///
    /// Actions may schedule further actions; those fire as well if they fall within the
    /// advanced window.
    pub fn advance(&self, by: Duration) {
        let target = self.inner.lock().now + by;

        loop {
            let action = {
                let mut state = self.inner.lock();
                let due = match state.pending.first_key_value() {
                    Some((&(deadline, seq), _)) if deadline <= target => (deadline, seq),
                    _ => break,
                };
                state.now = state.now.max(due.0);
                state.pending.remove(&due)
            };
            // the lock must not be held here, actions call back into the clock
            if let Some(action) = action {
                action();
            }
        }

        let mut state = self.inner.lock();
        state.now = state.now.max(target);
    }

    /// The number of actions that have not fired yet.
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ManualClock")
            .field("now", &state.now)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.inner.lock().now
    }

    fn schedule(&self, deadline: Instant, action: Action) {
        let mut state = self.inner.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.insert((deadline, seq), action);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_manual_clock_fires_in_order() {
        let clock = ManualClock::new();
        let start = clock.now();
        let fired = Arc::new(Mutex::new(vec![]));

        for (name, secs) in [("b", 2), ("a", 1), ("c", 3)] {
            let fired = Arc::clone(&fired);
            clock.schedule(
                start + Duration::from_secs(secs),
                Box::new(move || fired.lock().push(name)),
            );
        }

        clock.advance(Duration::from_millis(1500));
        assert_eq!(*fired.lock(), vec!["a"]);
        assert_eq!(clock.pending(), 2);

        clock.advance(Duration::from_secs(5));
        assert_eq!(*fired.lock(), vec!["a", "b", "c"]);
        assert_eq!(clock.now(), start + Duration::from_millis(6500));
    }

    #[test]
    fn test_manual_clock_never_fires_early() {
        let clock = ManualClock::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let deadline = clock.now() + Duration::from_secs(10);

        let calls_ = Arc::clone(&calls);
        clock.schedule(
            deadline,
            Box::new(move || {
                calls_.fetch_add(1, Ordering::SeqCst);
            }),
        );

        clock.advance(Duration::from_millis(9999));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_millis(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_manual_clock_reentrant_schedule() {
        let clock = ManualClock::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let start = clock.now();

        let inner_clock = clock.clone();
        let calls_ = Arc::clone(&calls);
        clock.schedule(
            start + Duration::from_secs(1),
            Box::new(move || {
                let deadline = inner_clock.now() + Duration::from_secs(1);
                inner_clock.schedule(
                    deadline,
                    Box::new(move || {
                        calls_.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }),
        );

        clock.advance(Duration::from_secs(3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(clock.pending(), 0);
    }

    #[tokio::test]
    async fn test_tokio_clock_paused() {
        tokio::time::pause();
        let clock = TokioClock::current();
        let (sender, receiver) = tokio::sync::oneshot::channel();

        let start = clock.now();
        clock.schedule(
            start + Duration::from_secs(60),
            Box::new(move || {
                sender.send(Instant::now()).ok();
            }),
        );

        let fired_at = receiver.await.unwrap();
        assert!(fired_at >= start + Duration::from_secs(60));
    }
}
