use std::future::Future;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures::Stream;
use pin_project_lite::pin_project;

use super::WillDeduct;
use crate::{RateLimit, TokenBucket};

pin_project! {
    /// A stream that is rate limited by a token bucket with weighted consumption.
    ///
    /// Before yielding an item the stream queues a withdrawal of
    /// `weight_fn(&item)` tokens and holds the item back until the bucket
    /// services it. Items keep their order, and they share the bucket's
    /// backlog with every other waiter in arrival order.
    ///
    /// Weights larger than the bucket's maximum size are clamped to it.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tokenwell::futures::ThrottleStreamExt;
    /// use tokenwell::{ManualTimer, RateLimit, TokenBucket};
    /// use futures::{FutureExt, StreamExt, stream};
    /// use nonzero_ext::nonzero;
    /// use std::num::NonZeroU32;
    ///
    /// let timer = ManualTimer::new();
    /// let limit = RateLimit::per_second_and_burst(nonzero!(1u32), nonzero!(4u32));
    /// let bucket = TokenBucket::started(limit, timer.clone());
    ///
    /// let mut texts = stream::iter(["ab", "cde"])
    ///     .throttle_weighted(bucket, |text| NonZeroU32::new(text.len() as u32).unwrap());
    ///
    /// assert_eq!(Some(Some("ab")), texts.next().now_or_never());
    /// // two tokens left, "cde" needs three
    /// assert_eq!(None, texts.next().now_or_never());
    /// timer.advance_secs(1.0);
    /// assert_eq!(Some(Some("cde")), texts.next().now_or_never());
    /// ```
    pub struct WeightedStream<S, F>
    where
        S: Stream,
    {
        #[pin]
        stream: S,
        bucket: TokenBucket,
        weight_fn: F,
        pending: Option<(S::Item, WillDeduct)>,
    }
}

impl<S, F> WeightedStream<S, F>
where
    S: Stream,
    F: FnMut(&S::Item) -> NonZeroU32,
{
    /// Creates a new weighted stream.
    ///
    /// # Arguments
    ///
    /// * `stream` - The underlying stream to rate limit
    /// * `bucket` - The token bucket to withdraw from
    /// * `weight_fn` - How many tokens each item costs
    pub fn new(stream: S, bucket: TokenBucket, weight_fn: F) -> Self {
        Self {
            stream,
            bucket,
            weight_fn,
            pending: None,
        }
    }

    /// Returns the rate limit of the underlying bucket.
    pub fn limit(&self) -> &RateLimit {
        self.bucket.limit()
    }

    /// Returns the underlying bucket.
    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }
}

impl<S, F> Stream for WeightedStream<S, F>
where
    S: Stream,
    F: FnMut(&S::Item) -> NonZeroU32,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some((_, deduct)) = this.pending.as_mut() {
                let serviced = ready!(Pin::new(deduct).poll(cx));
                let item = this.pending.take().map(|(item, _)| item);
                // the stream owns a bucket handle, so it is never abandoned
                return Poll::Ready(serviced.ok().and(item));
            }

            let Some(item) = ready!(this.stream.as_mut().poll_next(cx)) else {
                return Poll::Ready(None);
            };
            let weight = (this.weight_fn)(&item).min(this.bucket.maximum_size());
            *this.pending = Some((item, this.bucket.enqueue(weight)));
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let pending = usize::from(self.pending.is_some());
        let (lower, upper) = self.stream.size_hint();
        (
            lower.saturating_add(pending),
            upper.and_then(|upper| upper.checked_add(pending)),
        )
    }
}
