#![doc = include_str!("../README.md")]
//!
//! # Core Components
//!
//! - [`TokenBucket`] - The token bucket: immediate and queued withdrawals, timer-driven refills
//! - [`RateLimit`] - Configuration for refill rate and maximum size
//! - [`Timer`] trait, [`ManualTimer`] for tests and [`TokioTimer`] for tokio runtimes
//! - [`Clock`] trait and implementations used to measure elapsed time
//! - [`futures`] - The [`WillDeduct`](futures::WillDeduct) future and stream adapters
//!
//! # Quick Start
//!
//! ```rust
//! use std::num::NonZeroU32;
//!
//! use tokenwell::{ManualTimer, RateLimit, TokenBucket};
//!
//! // 10 tokens per second, at most 20 at once
//! let limit = RateLimit::per_second_and_burst(
//!     NonZeroU32::new(10).unwrap(),
//!     NonZeroU32::new(20).unwrap()
//! );
//!
//! let bucket = TokenBucket::started(limit, ManualTimer::new());
//!
//! // Withdraw without waiting
//! if bucket.deduct(NonZeroU32::new(5).unwrap()).unwrap() {
//!     println!("5 tokens withdrawn, {} left", bucket.available());
//! }
//! ```

mod backlog;
mod bucket;
mod clock;
mod error;
pub mod futures;
mod limit;
mod refill;
mod timer;

pub use bucket::TokenBucket;
#[cfg(feature = "quanta")]
pub use clock::QuantaClock;
#[cfg(feature = "tokio")]
pub use clock::TokioClock;
pub use clock::{Clock, StdClock};
pub use error::*;
pub use crate::futures::ThrottleStreamExt;
pub use limit::RateLimit;
#[cfg(feature = "tokio")]
pub use timer::TokioTimer;
pub use timer::{ManualTimer, Tick, Timer};
