use std::num::NonZeroU32;
use std::time::Duration;

use likely_stable::unlikely;

use crate::error::InvalidRateLimit;

const SECONDS_PER_MINUTE: f64 = 60.0;
const SECONDS_PER_HOUR: f64 = 3600.0;

/// Configuration for a token bucket: how fast it refills and how many tokens
/// it can hold.
///
/// The burst is the bucket's maximum size. A freshly constructed bucket
/// starts full, so the burst is also the amount that can be withdrawn
/// immediately.
///
/// # Examples
///
/// ```rust
/// use tokenwell::RateLimit;
/// use std::num::NonZeroU32;
///
/// // 100 tokens per second, up to 200 at once
/// let limit = RateLimit::per_second_and_burst(
///     NonZeroU32::new(100).unwrap(),
///     NonZeroU32::new(200).unwrap()
/// );
///
/// // half a token per second, burst of 3
/// let limit = RateLimit::try_new(0.5, NonZeroU32::new(3).unwrap()).unwrap();
/// assert_eq!(limit.seconds_per_token(), 2.0);
/// ```
#[derive(Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub(crate) rate: f64,
    pub(crate) burst: NonZeroU32,
}

impl std::fmt::Debug for RateLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RateLimit(rate_per_second={}, burst={})",
            self.rate_per_second(),
            self.burst()
        )
    }
}

impl RateLimit {
    /// Creates a rate limit from an arbitrary positive refill rate.
    ///
    /// # Arguments
    ///
    /// * `rate` - Tokens added per second; must be finite and greater than zero
    /// * `burst` - Maximum number of tokens the bucket can hold
    ///
    /// # Errors
    ///
    /// Returns [`InvalidRateLimit`] if `rate` is zero, negative, NaN or infinite.
    pub fn try_new(rate: f64, burst: NonZeroU32) -> Result<Self, InvalidRateLimit> {
        if unlikely(!rate.is_finite() || rate <= 0.0) {
            return Err(InvalidRateLimit { rate });
        }
        Ok(Self { rate, burst })
    }

    /// Creates a rate limit with the specified tokens per second.
    ///
    /// The burst is set equal to the rate, allowing for one second's worth of
    /// tokens to be withdrawn immediately.
    ///
    /// ```rust
    /// use tokenwell::RateLimit;
    /// use std::num::NonZeroU32;
    ///
    /// let limit = RateLimit::per_second(NonZeroU32::new(100).unwrap());
    /// assert_eq!(limit.rate_per_second(), 100.0);
    /// assert_eq!(limit.burst(), NonZeroU32::new(100).unwrap());
    /// ```
    pub const fn per_second(rate: NonZeroU32) -> Self {
        Self {
            rate: rate.get() as f64,
            burst: rate,
        }
    }

    /// Creates a rate limit with specified tokens per second and burst.
    pub const fn per_second_and_burst(rate: NonZeroU32, burst: NonZeroU32) -> Self {
        Self {
            rate: rate.get() as f64,
            burst,
        }
    }

    /// Creates a rate limit with the specified tokens per minute.
    ///
    /// The burst is set equal to the per-minute count, so a full bucket holds
    /// one minute's worth of tokens.
    ///
    /// ```rust
    /// use tokenwell::RateLimit;
    /// use std::num::NonZeroU32;
    ///
    /// let limit = RateLimit::per_minute(NonZeroU32::new(60).unwrap());
    /// assert_eq!(limit.rate_per_second(), 1.0);
    /// assert_eq!(limit.burst().get(), 60);
    /// ```
    pub const fn per_minute(rate: NonZeroU32) -> Self {
        Self {
            rate: rate.get() as f64 / SECONDS_PER_MINUTE,
            burst: rate,
        }
    }

    /// Creates a rate limit with the specified tokens per hour.
    ///
    /// The burst is set equal to the per-hour count.
    pub const fn per_hour(rate: NonZeroU32) -> Self {
        Self {
            rate: rate.get() as f64 / SECONDS_PER_HOUR,
            burst: rate,
        }
    }

    /// Sets a custom burst for this rate limit.
    ///
    /// ```rust
    /// use tokenwell::RateLimit;
    /// use std::num::NonZeroU32;
    ///
    /// let limit = RateLimit::per_second(NonZeroU32::new(10).unwrap())
    ///     .with_burst(NonZeroU32::new(3).unwrap());
    /// assert_eq!(limit.rate_per_second(), 10.0);
    /// assert_eq!(limit.burst().get(), 3);
    /// ```
    pub const fn with_burst(mut self, burst: NonZeroU32) -> Self {
        self.burst = burst;
        self
    }

    /// Returns the refill rate in tokens per second.
    pub const fn rate_per_second(&self) -> f64 {
        self.rate
    }

    /// Returns the refill rate in tokens per minute.
    pub const fn rate_per_minute(&self) -> f64 {
        self.rate * SECONDS_PER_MINUTE
    }

    /// Returns the refill rate in tokens per hour.
    pub const fn rate_per_hour(&self) -> f64 {
        self.rate * SECONDS_PER_HOUR
    }

    /// Returns the burst, i.e. the maximum number of tokens the bucket holds.
    pub const fn burst(&self) -> NonZeroU32 {
        self.burst
    }

    /// Seconds it takes to accrue a single token.
    pub const fn seconds_per_token(&self) -> f64 {
        1.0 / self.rate
    }

    /// The replenishment tick interval, i.e. [`seconds_per_token`](Self::seconds_per_token)
    /// as a [`Duration`], rounded up to the next whole nanosecond.
    ///
    /// A tick that fires exactly after this interval always earns a token.
    pub fn tick_interval(&self) -> Duration {
        let seconds = self.seconds_per_token();
        // rates so small that the interval overflows never tick in practice
        let Ok(interval) = Duration::try_from_secs_f64(seconds) else {
            return Duration::MAX;
        };
        if interval.as_secs_f64() < seconds {
            interval.saturating_add(Duration::from_nanos(1))
        } else {
            interval
        }
    }
}
