use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use likely_stable::unlikely;
use tracing::{debug, trace};

use crate::backlog::{Backlog, WaiterId};
use crate::error::ExceededCapacity;
use crate::futures::WillDeduct;
use crate::refill::Refill;
use crate::timer::{Tick, Timer};
use crate::RateLimit;

/// A token bucket that replenishes on timer ticks and lets callers wait for
/// tokens in strict arrival order.
///
/// The bucket starts full with [`maximum_size`](Self::maximum_size) tokens.
/// Withdrawals either happen immediately through [`deduct`](Self::deduct), or
/// are queued through [`will_deduct`](Self::will_deduct) and committed on the
/// caller's behalf once enough tokens have accrued. Tokens only accrue while
/// the bucket is running, i.e. between [`start`](Self::start) and
/// [`stop`](Self::stop).
///
/// `TokenBucket` is a handle: clones share the same state. All operations are
/// serialized behind one lock, and none of them block waiting for tokens.
///
/// # Examples
///
/// ```rust
/// use tokenwell::{ManualTimer, RateLimit, TokenBucket};
/// use nonzero_ext::nonzero;
/// use futures::FutureExt;
///
/// let timer = ManualTimer::new();
/// let bucket = TokenBucket::started(
///     RateLimit::per_second_and_burst(nonzero!(1u32), nonzero!(3u32)),
///     timer.clone(),
/// );
///
/// assert!(bucket.deduct(nonzero!(3u32)).unwrap());
/// let mut waiter = bucket.will_deduct(nonzero!(2u32)).unwrap();
/// assert!((&mut waiter).now_or_never().is_none());
/// assert_eq!(2, bucket.backlog_total());
///
/// timer.advance_secs(2.0);
/// assert!(waiter.now_or_never().is_some());
/// assert_eq!(0, bucket.backlog_total());
/// ```
#[derive(Clone)]
pub struct TokenBucket {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    limit: RateLimit,
    state: Mutex<State>,
}

struct State {
    available: u32,
    refill: Refill,
    backlog: Backlog,
    // Some while running
    timer: Option<Arc<dyn Timer>>,
    // bumped on every start and stop; ticks from older epochs are stale
    epoch: u64,
    tick_pending: bool,
}

/// A tick the bucket decided to request, issued once the state lock is released.
struct Arm {
    timer: Arc<dyn Timer>,
    delay: Duration,
    tick: Tick,
}

impl Arm {
    fn issue(self) {
        self.timer.after(self.delay, self.tick);
    }
}

impl TokenBucket {
    /// Creates a full, idle bucket.
    ///
    /// The bucket does not replenish until [`start`](Self::start) attaches a
    /// timer.
    pub fn new(limit: RateLimit) -> Self {
        Self {
            shared: Arc::new(Shared {
                limit,
                state: Mutex::new(State {
                    available: limit.burst().get(),
                    refill: Refill::new(limit.seconds_per_token()),
                    backlog: Backlog::default(),
                    timer: None,
                    epoch: 0,
                    tick_pending: false,
                }),
            }),
        }
    }

    /// Creates a full bucket that is already running on `timer`.
    pub fn started(limit: RateLimit, timer: impl Timer) -> Self {
        let bucket = Self::new(limit);
        bucket.start(timer);
        bucket
    }

    /// The bucket's capacity.
    pub fn maximum_size(&self) -> NonZeroU32 {
        self.shared.limit.burst()
    }

    /// The rate limit the bucket was created with.
    pub fn limit(&self) -> &RateLimit {
        &self.shared.limit
    }

    /// Tokens that can be withdrawn right now.
    pub fn available(&self) -> u32 {
        self.shared.lock().available
    }

    /// Sum of the tokens requested by all queued [`will_deduct`](Self::will_deduct) calls.
    pub fn backlog_total(&self) -> u64 {
        self.shared.lock().backlog.total()
    }

    /// Number of queued [`will_deduct`](Self::will_deduct) calls.
    pub fn backlog_len(&self) -> usize {
        self.shared.lock().backlog.len()
    }

    /// Whether a timer is attached.
    pub fn is_running(&self) -> bool {
        self.shared.lock().timer.is_some()
    }

    /// Withdraws `count` tokens if they are available right now.
    ///
    /// Never waits and never queues. Returns `Ok(false)` without changing
    /// anything when fewer than `count` tokens are available.
    ///
    /// # Errors
    ///
    /// [`ExceededCapacity`] if `count` is larger than the bucket could ever hold.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tokenwell::{RateLimit, TokenBucket};
    /// use nonzero_ext::nonzero;
    ///
    /// let bucket = TokenBucket::new(RateLimit::per_second(nonzero!(3u32)));
    /// assert_eq!(Ok(true), bucket.deduct(nonzero!(2u32)));
    /// assert_eq!(Ok(false), bucket.deduct(nonzero!(2u32)));
    /// assert!(bucket.deduct(nonzero!(4u32)).is_err());
    /// ```
    pub fn deduct(&self, count: impl Into<NonZeroU32>) -> Result<bool, ExceededCapacity> {
        let count = self.check(count.into())?;
        let arm = {
            let mut state = self.shared.lock();
            if count.get() > state.available {
                return Ok(false);
            }
            state.available -= count.get();
            self.shared.consider_scheduling(&mut state)
        };
        if let Some(arm) = arm {
            arm.issue();
        }
        Ok(true)
    }

    /// Queues a withdrawal of `count` tokens and returns a future that
    /// completes once the bucket has committed it.
    ///
    /// Requests are serviced strictly in call order: a request that does not
    /// fit yet holds back every request made after it. A request that fits
    /// and has nothing queued ahead of it is serviced immediately.
    ///
    /// Dropping the returned future before it completes withdraws the request.
    ///
    /// # Errors
    ///
    /// [`ExceededCapacity`] if `count` is larger than the bucket could ever
    /// hold, since such a request would block the queue forever.
    pub fn will_deduct(
        &self,
        count: impl Into<NonZeroU32>,
    ) -> Result<WillDeduct, ExceededCapacity> {
        let count = self.check(count.into())?;
        Ok(self.enqueue(count))
    }

    /// Queues a withdrawal whose count is already known to fit.
    pub(crate) fn enqueue(&self, count: NonZeroU32) -> WillDeduct {
        debug_assert!(count <= self.maximum_size());
        let (id, receiver, arm) = {
            let mut state = self.shared.lock();
            let (id, receiver) = state.backlog.push(count);
            trace!(count = count.get(), queued = state.backlog.len(), "queued withdrawal");
            let arm = self.shared.service_backlog(&mut state);
            (id, receiver, arm)
        };
        if let Some(arm) = arm {
            arm.issue();
        }
        WillDeduct::new(receiver, Arc::downgrade(&self.shared), id)
    }

    /// Attaches `timer` and starts replenishing.
    ///
    /// Starting an already running bucket swaps the timer; ticks requested
    /// from the previous one are ignored when they fire.
    pub fn start(&self, timer: impl Timer) {
        let arm = {
            let mut state = self.shared.lock();
            state.timer = Some(Arc::new(timer));
            state.epoch += 1;
            state.tick_pending = false;
            state.refill.reset();
            debug!(
                epoch = state.epoch,
                available = state.available,
                backlog = state.backlog.len(),
                "token bucket started"
            );
            self.shared.consider_scheduling(&mut state)
        };
        if let Some(arm) = arm {
            arm.issue();
        }
    }

    /// Detaches the timer and stops replenishing.
    ///
    /// Queued requests stay queued and are serviced again after the next
    /// [`start`](Self::start).
    pub fn stop(&self) {
        let mut state = self.shared.lock();
        if state.timer.take().is_some() {
            state.epoch += 1;
            state.tick_pending = false;
            debug!(
                epoch = state.epoch,
                backlog = state.backlog.len(),
                "token bucket stopped"
            );
        }
    }

    fn check(&self, count: NonZeroU32) -> Result<NonZeroU32, ExceededCapacity> {
        let maximum = self.maximum_size();
        if unlikely(count > maximum) {
            return Err(ExceededCapacity {
                requested: count,
                maximum,
            });
        }
        Ok(count)
    }

    #[cfg(test)]
    fn leftovers(&self) -> f64 {
        self.shared.lock().refill.leftovers()
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("TokenBucket")
            .field("limit", &self.shared.limit)
            .field("available", &state.available)
            .field("leftovers", &state.refill.leftovers())
            .field("backlog_total", &state.backlog.total())
            .field("running", &state.timer.is_some())
            .finish()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handles a tick armed in `epoch` that fired after `elapsed`.
    pub(crate) fn on_tick(self: &Arc<Self>, epoch: u64, elapsed: Duration) {
        let arm = {
            let mut state = self.lock();
            if epoch != state.epoch || state.timer.is_none() {
                debug!(epoch, current = state.epoch, "ignoring stale tick");
                return;
            }
            state.tick_pending = false;
            let tokens = state.refill.credit(elapsed.as_secs_f64());
            trace!(?elapsed, tokens, "tick fired");
            if tokens > 0 {
                self.replenish(&mut state, tokens)
            } else {
                self.consider_scheduling(&mut state)
            }
        };
        if let Some(arm) = arm {
            arm.issue();
        }
    }

    /// Withdraws a request whose future was dropped.
    pub(crate) fn cancel(self: &Arc<Self>, id: WaiterId) {
        let arm = {
            let mut state = self.lock();
            if !state.backlog.remove(id) {
                return;
            }
            debug!(backlog = state.backlog.len(), "withdrawal cancelled");
            // the cancelled request may have been holding up the queue
            self.service_backlog(&mut state)
        };
        if let Some(arm) = arm {
            arm.issue();
        }
    }

    /// Credits `count` tokens, clamped at the maximum size, and hands them to
    /// queued requests.
    fn replenish(self: &Arc<Self>, state: &mut State, count: u64) -> Option<Arm> {
        debug_assert!(count > 0);
        let maximum = self.limit.burst().get();
        let credited = u64::from(state.available).saturating_add(count);
        state.available = credited.min(u64::from(maximum)) as u32;
        self.service_backlog(state)
    }

    fn service_backlog(self: &Arc<Self>, state: &mut State) -> Option<Arm> {
        if !state.backlog.is_empty() {
            let handed_out = state.backlog.service(state.available);
            state.available -= handed_out;
        }
        self.consider_scheduling(state)
    }

    /// Decides whether another tick is needed: only while running, below
    /// capacity, and with no tick already outstanding.
    fn consider_scheduling(self: &Arc<Self>, state: &mut State) -> Option<Arm> {
        if state.tick_pending || state.available >= self.limit.burst().get() {
            return None;
        }
        let timer = state.timer.clone()?;
        state.tick_pending = true;
        let delay = self.limit.tick_interval();
        trace!(epoch = state.epoch, ?delay, "arming tick");
        Some(Arm {
            timer,
            delay,
            tick: Tick {
                bucket: Arc::downgrade(self),
                epoch: state.epoch,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;
    use nonzero_ext::nonzero;

    use crate::ManualTimer;

    use super::*;

    fn bucket(burst: NonZeroU32, rate: f64) -> (TokenBucket, ManualTimer) {
        let timer = ManualTimer::new();
        let limit = RateLimit::try_new(rate, burst).unwrap();
        (TokenBucket::started(limit, timer.clone()), timer)
    }

    fn is_resolved(waiter: &mut WillDeduct) -> bool {
        match waiter.now_or_never() {
            Some(result) => {
                result.unwrap();
                true
            }
            None => false,
        }
    }

    #[test]
    fn deduct_then_refill() {
        let (tb, timer) = bucket(nonzero!(3u32), 1.0);
        assert_eq!(nonzero!(3u32), tb.maximum_size());
        assert_eq!(Ok(true), tb.deduct(nonzero!(1u32)));
        assert_eq!(2, tb.available());
        assert_eq!(Ok(true), tb.deduct(nonzero!(2u32)));
        assert_eq!(0, tb.available());
        assert_eq!(Ok(false), tb.deduct(nonzero!(1u32)));
        assert_eq!(0, tb.available());

        timer.advance_secs(1.0);
        assert_eq!(1, tb.available());
        assert_eq!(Ok(true), tb.deduct(nonzero!(1u32)));
        assert_eq!(0, tb.available());
    }

    #[test]
    fn waiter_resolves_when_tokens_accrue() {
        let (tb, timer) = bucket(nonzero!(3u32), 1.0);
        assert_eq!(Ok(true), tb.deduct(nonzero!(1u32)));
        let mut waiter = tb.will_deduct(nonzero!(3u32)).unwrap();
        assert!(!is_resolved(&mut waiter));
        assert_eq!(3, tb.backlog_total());

        timer.advance_secs(1.0);
        assert!(is_resolved(&mut waiter));
        assert_eq!(0, tb.available());
        assert_eq!(0, tb.backlog_total());
    }

    #[test]
    fn dry_queue() {
        let (tb, timer) = bucket(nonzero!(3u32), 1.0);
        assert_eq!(Ok(true), tb.deduct(nonzero!(3u32)));

        for count in [nonzero!(1u32), nonzero!(2u32), nonzero!(3u32)] {
            let mut waiter = tb.will_deduct(count).unwrap();
            assert!(!is_resolved(&mut waiter));
            if count.get() > 1 {
                // one second short of the required amount
                timer.advance_secs(f64::from(count.get() - 1));
                assert!(!is_resolved(&mut waiter));
                timer.advance_secs(1.0);
            } else {
                timer.advance_secs(1.0);
            }
            assert!(is_resolved(&mut waiter));
            assert_eq!(0, tb.available());
        }
    }

    #[test]
    fn concurrent_waiters_resolve_in_order() {
        let (tb, timer) = bucket(nonzero!(3u32), 1.0);
        assert_eq!(Ok(true), tb.deduct(nonzero!(3u32)));

        let mut x = tb.will_deduct(nonzero!(3u32)).unwrap();
        let mut y = tb.will_deduct(nonzero!(3u32)).unwrap();
        let mut z = tb.will_deduct(nonzero!(3u32)).unwrap();
        assert_eq!(9, tb.backlog_total());

        timer.advance_secs(3.0);
        assert!(is_resolved(&mut x));
        assert!(!is_resolved(&mut y));
        assert!(!is_resolved(&mut z));

        timer.advance_secs(3.0);
        assert!(is_resolved(&mut y));
        assert!(!is_resolved(&mut z));

        timer.advance_secs(3.0);
        assert!(is_resolved(&mut z));
        assert_eq!(0, tb.backlog_total());
    }

    #[test]
    fn head_of_line_blocking() {
        let (tb, timer) = bucket(nonzero!(5u32), 1.0);
        assert_eq!(Ok(true), tb.deduct(nonzero!(5u32)));
        let mut a = tb.will_deduct(nonzero!(4u32)).unwrap();
        let mut b = tb.will_deduct(nonzero!(1u32)).unwrap();
        let mut c = tb.will_deduct(nonzero!(1u32)).unwrap();

        timer.advance_secs(2.0);
        // two tokens would satisfy b and c, but a is first
        assert_eq!(2, tb.available());
        assert!(!is_resolved(&mut a));
        assert!(!is_resolved(&mut b));
        assert!(!is_resolved(&mut c));

        timer.advance_secs(2.0);
        assert!(is_resolved(&mut a));
        assert!(!is_resolved(&mut b));

        timer.advance_secs(1.0);
        assert!(is_resolved(&mut b));
        assert!(!is_resolved(&mut c));
    }

    #[test]
    fn dropping_blocked_head_unblocks_queue() {
        let (tb, timer) = bucket(nonzero!(5u32), 1.0);
        assert_eq!(Ok(true), tb.deduct(nonzero!(5u32)));
        let a = tb.will_deduct(nonzero!(4u32)).unwrap();
        let mut b = tb.will_deduct(nonzero!(1u32)).unwrap();

        timer.advance_secs(2.0);
        assert!(!is_resolved(&mut b));
        assert_eq!(5, tb.backlog_total());

        drop(a);
        assert!(is_resolved(&mut b));
        assert_eq!(1, tb.available());
        assert_eq!(0, tb.backlog_total());
        assert_eq!(0, tb.backlog_len());
    }

    #[test]
    fn will_deduct_is_immediate_when_tokens_are_there() {
        let tb = TokenBucket::new(RateLimit::per_second(nonzero!(3u32)));
        let mut waiter = tb.will_deduct(nonzero!(2u32)).unwrap();
        assert!(is_resolved(&mut waiter));
        assert_eq!(1, tb.available());
        // queued behind nothing, but does not fit
        let mut waiter = tb.will_deduct(nonzero!(2u32)).unwrap();
        assert!(!is_resolved(&mut waiter));
        // a later small request does not jump the queue
        let mut small = tb.will_deduct(nonzero!(1u32)).unwrap();
        assert!(!is_resolved(&mut small));
        assert_eq!(1, tb.available());
    }

    #[test]
    fn rejects_counts_above_maximum() {
        let (tb, _timer) = bucket(nonzero!(3u32), 1.0);
        let err = tb.deduct(nonzero!(4u32)).unwrap_err();
        assert_eq!(nonzero!(4u32), err.requested);
        assert_eq!(nonzero!(3u32), err.maximum);
        assert!(tb.will_deduct(nonzero!(4u32)).is_err());
        assert_eq!(3, tb.available());
        assert_eq!(0, tb.backlog_total());
    }

    #[test]
    fn full_bucket_does_not_schedule() {
        let (tb, timer) = bucket(nonzero!(3u32), 1.0);
        assert_eq!(0, timer.pending());
        assert_eq!(Ok(true), tb.deduct(nonzero!(1u32)));
        assert_eq!(1, timer.pending());
        // a second deduction while a tick is outstanding doesn't arm another
        assert_eq!(Ok(true), tb.deduct(nonzero!(1u32)));
        assert_eq!(1, timer.pending());

        timer.advance_secs(1.0);
        assert_eq!(2, tb.available());
        assert_eq!(1, timer.pending());
        timer.advance_secs(1.0);
        assert_eq!(3, tb.available());
        assert_eq!(0, timer.pending());
    }

    #[test]
    fn never_overfills() {
        let (tb, timer) = bucket(nonzero!(3u32), 1.0);
        assert_eq!(Ok(true), tb.deduct(nonzero!(1u32)));
        // a badly delayed tick
        timer.advance_secs(100.0);
        assert_eq!(3, tb.available());
        assert_eq!(0, timer.pending());
    }

    #[test]
    fn exact_ticks_credit_exactly() {
        let (tb, timer) = bucket(nonzero!(100u32), 4.0);
        assert_eq!(Ok(true), tb.deduct(nonzero!(100u32)));
        for n in 1..=100 {
            timer.advance(Duration::from_millis(250));
            assert_eq!(n, tb.available());
            assert_eq!(0.0, tb.leftovers());
        }
        assert_eq!(0, timer.pending());
    }

    #[test]
    fn exact_ticks_at_inexact_intervals() {
        for rate in [3.0, 7.0] {
            let (tb, timer) = bucket(nonzero!(20u32), rate);
            assert_eq!(Ok(true), tb.deduct(nonzero!(20u32)));
            let interval = tb.limit().tick_interval();
            for n in 1..=20 {
                timer.advance(interval);
                assert_eq!(n, tb.available(), "rate {rate}");
            }
            assert_eq!(0, timer.pending());
        }
    }

    #[test]
    fn late_ticks_carry_leftovers() {
        let (tb, timer) = bucket(nonzero!(10u32), 1.0);
        assert_eq!(Ok(true), tb.deduct(nonzero!(10u32)));
        timer.advance_secs(1.5);
        assert_eq!(1, tb.available());
        assert_eq!(0.5, tb.leftovers());
        timer.advance_secs(1.5);
        assert_eq!(3, tb.available());
        assert_eq!(0.0, tb.leftovers());
    }

    #[test]
    fn stop_pauses_servicing() {
        let (tb, timer) = bucket(nonzero!(3u32), 1.0);
        assert_eq!(Ok(true), tb.deduct(nonzero!(3u32)));
        let mut waiter = tb.will_deduct(nonzero!(1u32)).unwrap();
        tb.stop();
        assert!(!tb.is_running());

        // the tick armed before stop fires but is ignored
        timer.advance_secs(5.0);
        assert_eq!(0, tb.available());
        assert!(!is_resolved(&mut waiter));
        assert_eq!(1, tb.backlog_total());
        assert_eq!(0, timer.pending());

        tb.start(timer.clone());
        assert!(tb.is_running());
        assert_eq!(1, timer.pending());
        timer.advance_secs(1.0);
        assert!(is_resolved(&mut waiter));
    }

    #[test]
    fn restart_does_not_double_arm() {
        let (tb, timer) = bucket(nonzero!(3u32), 1.0);
        assert_eq!(Ok(true), tb.deduct(nonzero!(3u32)));
        assert_eq!(1, timer.pending());
        tb.stop();
        tb.start(timer.clone());
        // the stale tick is still buffered next to the fresh one
        assert_eq!(2, timer.pending());

        timer.advance_secs(1.0);
        // only the fresh tick counts, and only it re-arms
        assert_eq!(1, tb.available());
        assert_eq!(1, timer.pending());
        timer.advance_secs(1.0);
        assert_eq!(2, tb.available());
        assert_eq!(1, timer.pending());
    }

    #[test]
    fn idle_bucket_does_not_replenish() {
        let timer = ManualTimer::new();
        let tb = TokenBucket::new(RateLimit::per_second(nonzero!(3u32)));
        assert!(!tb.is_running());
        assert_eq!(Ok(true), tb.deduct(nonzero!(3u32)));
        timer.advance_secs(10.0);
        assert_eq!(0, timer.pending());
        assert_eq!(0, tb.available());

        tb.start(timer.clone());
        assert_eq!(1, timer.pending());
        // 3 tokens/s: one tick every third of a second
        timer.advance_secs(1.0);
        assert_eq!(3, tb.available());
    }

    #[test]
    fn dropping_bucket_abandons_waiters() {
        let (tb, timer) = bucket(nonzero!(3u32), 1.0);
        assert_eq!(Ok(true), tb.deduct(nonzero!(3u32)));
        let waiter = tb.will_deduct(nonzero!(2u32)).unwrap();
        drop(tb);
        assert_eq!(
            Some(Err(crate::Abandoned)),
            waiter.now_or_never()
        );
        // the tick for the dropped bucket is a no-op
        timer.advance_secs(1.0);
        assert_eq!(0, timer.pending());
    }

    #[test]
    fn queries_do_not_mutate() {
        let (tb, timer) = bucket(nonzero!(3u32), 1.0);
        assert_eq!(Ok(true), tb.deduct(nonzero!(3u32)));
        let _waiter = tb.will_deduct(nonzero!(2u32)).unwrap();
        for _ in 0..3 {
            assert_eq!(nonzero!(3u32), tb.maximum_size());
            assert_eq!(2, tb.backlog_total());
            assert_eq!(1, tb.backlog_len());
            assert_eq!(0, tb.available());
        }
        assert_eq!(1, timer.pending());
    }

    #[test]
    fn invariant_holds_for_mixed_sequences() {
        let (tb, timer) = bucket(nonzero!(7u32), 2.0);
        let mut waiters = Vec::new();
        for i in 1..=200u32 {
            let count = NonZeroU32::new(i % 7 + 1).unwrap();
            match i % 4 {
                0 => waiters.push(tb.will_deduct(count).unwrap()),
                1 | 2 => {
                    let _ = tb.deduct(count).unwrap();
                }
                _ => timer.advance_secs(f64::from(i % 3) * 0.35),
            }
            assert!(tb.available() <= 7);
        }
        // backlog drains once time passes
        timer.advance_secs(1000.0);
        for _ in 0..200 {
            timer.advance_secs(4.0);
        }
        for mut waiter in waiters {
            assert!(is_resolved(&mut waiter));
        }
        assert_eq!(0, tb.backlog_total());
    }

    #[test]
    fn clones_share_state() {
        let (tb, _timer) = bucket(nonzero!(3u32), 1.0);
        let other = tb.clone();
        assert_eq!(Ok(true), other.deduct(nonzero!(2u32)));
        assert_eq!(1, tb.available());
    }
}
