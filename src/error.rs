use std::num::NonZeroU32;

/// The requested amount of tokens can never be withdrawn because it exceeds
/// the bucket's maximum size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("requesting {requested} tokens from a bucket that holds at most {maximum} is not permitted")]
pub struct ExceededCapacity {
    pub requested: NonZeroU32,
    pub maximum: NonZeroU32,
}

/// A refill rate that is not a finite, strictly positive number.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("refill rate must be finite and greater than zero, got {rate}")]
pub struct InvalidRateLimit {
    pub rate: f64,
}

/// The token bucket was dropped before a pending request could be serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("token bucket was dropped before the request was serviced")]
pub struct Abandoned;
