use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tracing::trace;

use crate::bucket::Shared;
#[cfg(feature = "tokio")]
use crate::clock::{Clock, TokioClock};

/// Source of delayed completions that drives a bucket's replenishment.
///
/// A running [`TokenBucket`](crate::TokenBucket) asks its timer for one
/// completion at a time via [`after`](Timer::after). The timer must eventually
/// call [`Tick::fire`] with the time that *actually* passed since the request,
/// which may exceed `delay`; the bucket carries the surplus into later ticks.
///
/// A single timer may serve many buckets, so implementations must support any
/// number of outstanding ticks.
pub trait Timer: Send + Sync + 'static {
    /// Requests that `tick` be fired once at least `delay` has elapsed.
    fn after(&self, delay: Duration, tick: Tick);
}

impl<T: Timer> Timer for Arc<T> {
    fn after(&self, delay: Duration, tick: Tick) {
        (**self).after(delay, tick)
    }
}

/// A pending replenishment tick handed to a [`Timer`].
///
/// Firing a tick that belongs to a stopped, restarted or dropped bucket is
/// harmless; the bucket recognises and ignores it.
pub struct Tick {
    pub(crate) bucket: Weak<Shared>,
    pub(crate) epoch: u64,
}

impl Tick {
    /// Completes the tick, reporting how long it actually waited.
    pub fn fire(self, elapsed: Duration) {
        match self.bucket.upgrade() {
            Some(shared) => shared.on_tick(self.epoch, elapsed),
            None => trace!(epoch = self.epoch, "tick fired for a dropped bucket"),
        }
    }
}

impl Debug for Tick {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tick(epoch={})", self.epoch)
    }
}

/// Timer for tests and simulations whose time only moves when told to.
///
/// Every request is buffered together with the time that has passed since it
/// was made. [`advance`](ManualTimer::advance) adds to each request's elapsed
/// time and fires those that have waited long enough, reporting the full
/// elapsed time, just like a late wake-up from a real timer.
///
/// Clones share the same pending requests.
///
/// # Examples
///
/// ```rust
/// use tokenwell::{ManualTimer, RateLimit, TokenBucket};
/// use std::num::NonZeroU32;
/// use std::time::Duration;
///
/// let limit = RateLimit::per_second(NonZeroU32::new(1).unwrap());
/// let timer = ManualTimer::new();
/// let bucket = TokenBucket::started(limit, timer.clone());
///
/// assert!(bucket.deduct(NonZeroU32::new(1).unwrap()).unwrap());
/// assert!(!bucket.deduct(NonZeroU32::new(1).unwrap()).unwrap());
///
/// timer.advance(Duration::from_secs(1));
/// assert!(bucket.deduct(NonZeroU32::new(1).unwrap()).unwrap());
/// ```
#[derive(Clone, Default)]
pub struct ManualTimer {
    pending: Arc<Mutex<Vec<Pending>>>,
}

struct Pending {
    delay: Duration,
    elapsed: Duration,
    tick: Tick,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves time forward by `by`, firing every request that has now waited
    /// at least its delay.
    ///
    /// Ticks are fired after the timer's own lock is released, so requests
    /// made while firing (the bucket re-arming itself) start counting from the
    /// next call to `advance`.
    pub fn advance(&self, by: Duration) {
        let due = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let mut due = Vec::new();
            let mut i = 0;
            while i < pending.len() {
                pending[i].elapsed = pending[i].elapsed.saturating_add(by);
                if pending[i].elapsed >= pending[i].delay {
                    due.push(pending.remove(i));
                } else {
                    i += 1;
                }
            }
            due
        };
        for Pending { elapsed, tick, .. } in due {
            tick.fire(elapsed);
        }
    }

    /// Like [`advance`](Self::advance) with the amount in seconds.
    pub fn advance_secs(&self, secs: f64) {
        self.advance(Duration::from_secs_f64(secs))
    }

    /// Number of requests that have not fired yet.
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Timer for ManualTimer {
    fn after(&self, delay: Duration, tick: Tick) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Pending {
                delay,
                elapsed: Duration::ZERO,
                tick,
            });
    }
}

impl Debug for ManualTimer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualTimer")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(feature = "tokio-hrtime")]
use tokio_hrtime::sleep;

#[cfg(all(feature = "tokio", not(feature = "tokio-hrtime")))]
use tokio::time::sleep;

/// Timer that sleeps on a tokio runtime.
///
/// Each request spawns a task that sleeps for the delay and then fires the
/// tick with the elapsed time measured by `C`. The default [`TokioClock`]
/// follows tokio's paused time, so tests can use `start_paused = true`.
///
/// Under the "tokio-hrtime" feature the sleep is performed by
/// `tokio_hrtime::sleep` for sub-millisecond precision.
///
/// # Examples
///
/// ```rust
/// use tokenwell::{RateLimit, TokenBucket, TokioTimer};
/// use std::num::NonZeroU32;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let limit = RateLimit::per_second_and_burst(
///     NonZeroU32::new(100).unwrap(),
///     NonZeroU32::new(1).unwrap(),
/// );
/// let bucket = TokenBucket::started(limit, TokioTimer::new());
///
/// bucket.will_deduct(NonZeroU32::new(1).unwrap()).unwrap().await.unwrap();
/// // the bucket is empty now, this one waits for about 10ms
/// bucket.will_deduct(NonZeroU32::new(1).unwrap()).unwrap().await.unwrap();
/// # }
/// ```
#[cfg(feature = "tokio")]
#[derive(Clone)]
pub struct TokioTimer<C = TokioClock> {
    handle: tokio::runtime::Handle,
    clock: C,
}

#[cfg(feature = "tokio")]
impl TokioTimer<TokioClock> {
    /// Creates a timer on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn new() -> Self {
        Self::with_clock(TokioClock::default())
    }
}

#[cfg(feature = "tokio")]
impl Default for TokioTimer<TokioClock> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "tokio")]
impl<C: Clock> TokioTimer<C> {
    /// Creates a timer on the current tokio runtime measuring elapsed time
    /// with `clock`.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn with_clock(clock: C) -> Self {
        Self::from_parts(tokio::runtime::Handle::current(), clock)
    }

    /// Creates a timer that spawns its sleeps onto `handle`.
    pub fn from_parts(handle: tokio::runtime::Handle, clock: C) -> Self {
        Self { handle, clock }
    }
}

#[cfg(feature = "tokio")]
impl<C> Timer for TokioTimer<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    fn after(&self, delay: Duration, tick: Tick) {
        let clock = self.clock.clone();
        let armed_at = clock.now();
        self.handle.spawn(async move {
            sleep(delay).await;
            let elapsed = (clock.now() - armed_at).max(0.0);
            tick.fire(Duration::from_secs_f64(elapsed));
        });
    }
}
