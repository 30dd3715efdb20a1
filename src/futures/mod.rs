mod deduct;
mod stream;

pub use deduct::WillDeduct;
pub use stream::WeightedStream;

use std::num::NonZeroU32;

use futures::Stream;

use crate::TokenBucket;

/// Stream throttled by one token per item.
pub type Throttled<S> = WeightedStream<S, fn(&<S as Stream>::Item) -> NonZeroU32>;

fn one<T>(_: &T) -> NonZeroU32 {
    NonZeroU32::MIN
}

/// Extension trait to throttle any [`Stream`] with a [`TokenBucket`].
pub trait ThrottleStreamExt: Stream + Sized {
    /// Withdraws one token before yielding each item.
    fn throttle(self, bucket: TokenBucket) -> Throttled<Self> {
        WeightedStream::new(self, bucket, one::<Self::Item> as fn(&Self::Item) -> NonZeroU32)
    }

    /// Withdraws `weight_fn(&item)` tokens before yielding each item.
    fn throttle_weighted<F>(self, bucket: TokenBucket, weight_fn: F) -> WeightedStream<Self, F>
    where
        F: FnMut(&Self::Item) -> NonZeroU32,
    {
        WeightedStream::new(self, bucket, weight_fn)
    }
}

impl<S: Stream> ThrottleStreamExt for S {}
