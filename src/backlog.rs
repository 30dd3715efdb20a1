use std::collections::VecDeque;
use std::num::NonZeroU32;

use futures::channel::oneshot;
use tracing::trace;

/// Identifies a queued waiter so that it can be removed if its future is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WaiterId(u64);

#[derive(Debug)]
struct Waiter {
    id: WaiterId,
    count: NonZeroU32,
    sender: oneshot::Sender<()>,
}

/// FIFO queue of withdrawal requests that are waiting for tokens.
///
/// Requests are serviced strictly in arrival order. A request that cannot be
/// satisfied blocks everything queued behind it, even smaller requests that
/// would fit.
#[derive(Debug, Default)]
pub(crate) struct Backlog {
    waiters: VecDeque<Waiter>,
    next_id: u64,
    total: u64,
}

impl Backlog {
    /// Queues a request for `count` tokens at the tail.
    pub fn push(&mut self, count: NonZeroU32) -> (WaiterId, oneshot::Receiver<()>) {
        let (sender, receiver) = oneshot::channel();
        let id = WaiterId(self.next_id);
        self.next_id += 1;
        self.total += u64::from(count.get());
        self.waiters.push_back(Waiter { id, count, sender });
        (id, receiver)
    }

    /// Removes a request, returns `true` if it was still queued.
    pub fn remove(&mut self, id: WaiterId) -> bool {
        let Some(pos) = self.waiters.iter().position(|w| w.id == id) else {
            return false;
        };
        if let Some(waiter) = self.waiters.remove(pos) {
            self.total -= u64::from(waiter.count.get());
        }
        true
    }

    /// Services requests from the head while `available` covers them and
    /// returns the number of tokens handed out.
    ///
    /// Stops at the first request that does not fit.
    pub fn service(&mut self, available: u32) -> u32 {
        let mut remaining = available;
        while let Some(head) = self.waiters.front() {
            if head.sender.is_canceled() {
                // WillDeduct withdraws its own entry on drop, so this only
                // catches receivers dropped without going through it
                self.pop_front();
                continue;
            }
            let count = head.count.get();
            if count > remaining {
                break;
            }
            let Some(waiter) = self.pop_front() else {
                break;
            };
            if waiter.sender.send(()).is_ok() {
                trace!(waiter = waiter.id.0, count, "serviced waiter");
                remaining -= count;
            }
        }
        available - remaining
    }

    /// Sum of tokens requested by all queued waiters.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    fn pop_front(&mut self) -> Option<Waiter> {
        let waiter = self.waiters.pop_front()?;
        self.total -= u64::from(waiter.count.get());
        Some(waiter)
    }
}
