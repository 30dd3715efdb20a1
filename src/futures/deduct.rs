use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll, ready};

use futures::channel::oneshot;

use crate::backlog::WaiterId;
use crate::bucket::Shared;
use crate::error::Abandoned;

/// Future returned by [`TokenBucket::will_deduct`](crate::TokenBucket::will_deduct).
///
/// Completes with `Ok(())` once the bucket has withdrawn the requested tokens
/// on the caller's behalf. If the bucket is dropped first it completes with
/// [`Abandoned`].
///
/// Dropping the future before it completes removes the request from the
/// bucket's backlog, which may let the requests queued behind it proceed.
#[must_use = "futures do nothing unless polled, and dropping this one withdraws the request"]
#[derive(Debug)]
pub struct WillDeduct {
    receiver: oneshot::Receiver<()>,
    // cleared once the request completed
    waiter: Option<(Weak<Shared>, WaiterId)>,
}

impl WillDeduct {
    pub(crate) fn new(receiver: oneshot::Receiver<()>, bucket: Weak<Shared>, id: WaiterId) -> Self {
        Self {
            receiver,
            waiter: Some((bucket, id)),
        }
    }
}

impl Future for WillDeduct {
    type Output = Result<(), Abandoned>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = ready!(Pin::new(&mut self.receiver).poll(cx));
        self.waiter = None;
        Poll::Ready(result.map_err(|_| Abandoned))
    }
}

impl Drop for WillDeduct {
    fn drop(&mut self) {
        if let Some((bucket, id)) = self.waiter.take() {
            if let Some(shared) = bucket.upgrade() {
                shared.cancel(id);
            }
        }
    }
}
