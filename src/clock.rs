//! Time sources used by [`TokioTimer`](crate::TokioTimer) to measure how long a
//! replenishment tick actually slept.

/// Trait for monotonic clocks.
///
/// Implementations must never go backwards. Time is measured in seconds as
/// floating-point values since an arbitrary, per-clock origin.
pub trait Clock {
    /// Returns the current time in seconds since the clock's origin.
    fn now(&self) -> f64;
}

/// Clock backed by [`std::time::Instant`].
#[derive(Clone, Copy)]
pub struct StdClock {
    origin: std::time::Instant,
}

impl Default for StdClock {
    fn default() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Clock for StdClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Clock backed by [`tokio::time::Instant`].
///
/// Follows tokio's paused time in tests, which makes it the default for
/// [`TokioTimer`](crate::TokioTimer).
#[cfg(feature = "tokio")]
#[derive(Clone, Copy)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

#[cfg(feature = "tokio")]
impl Default for TokioClock {
    fn default() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

#[cfg(feature = "tokio")]
impl Clock for TokioClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// High-precision clock using the `quanta` crate. Requires the "quanta" feature.
///
/// ```rust
/// # #[cfg(feature = "quanta")]
/// # {
/// use tokenwell::{Clock, QuantaClock};
///
/// let clock = QuantaClock::default();
/// assert!(clock.now() >= 0.0);
/// # }
/// ```
#[cfg(feature = "quanta")]
#[derive(Clone)]
pub struct QuantaClock {
    origin: quanta::Instant,
}

#[cfg(feature = "quanta")]
impl Default for QuantaClock {
    fn default() -> Self {
        Self::new(quanta::Clock::new())
    }
}

#[cfg(feature = "quanta")]
impl QuantaClock {
    /// Creates a new `QuantaClock` whose origin is `clock.now()`.
    pub fn new(clock: quanta::Clock) -> Self {
        let origin = clock.now();
        Self { origin }
    }
}

#[cfg(feature = "quanta")]
impl Clock for QuantaClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> f64 {
        (**self).now()
    }
}
