//! Bounded multi-producer/multi-consumer handoff queue with timed push and pop

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Bounded queue of available pool items
///
/// `filled` counts values ready to be popped, `vacant` counts free slots;
/// a value is only pushed after a vacant permit was taken and only popped
/// after a filled permit was taken.
pub(crate) struct ConcurrentBag<W> {
    queue: ArrayQueue<W>,
    filled: Semaphore,
    vacant: Semaphore,
    pending: AtomicUsize,
}

struct PendingGuard<'a>(&'a AtomicUsize);

impl<'a> PendingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl<W> ConcurrentBag<W> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            filled: Semaphore::new(0),
            vacant: Semaphore::new(capacity),
            pending: AtomicUsize::new(0),
        }
    }

    /// Push within `timeout`; `false` if no slot became free in time
    pub async fn push(&self, value: W, timeout: Duration) -> bool {
        let permit = match self.vacant.try_acquire() {
            Ok(permit) => permit,
            Err(_) => match tokio::time::timeout(timeout, self.vacant.acquire()).await {
                Ok(Ok(permit)) => permit,
                _ => return false,
            },
        };
        permit.forget();

        if self.queue.push(value).is_err() {
            self.vacant.add_permits(1);
            return false;
        }

        self.filled.add_permits(1);
        true
    }

    /// Pop within `timeout`; `None` if nothing arrived in time
    pub async fn pop(&self, timeout: Duration) -> Option<W> {
        let permit = match self.filled.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                let _pending = PendingGuard::new(&self.pending);
                match tokio::time::timeout(timeout, self.filled.acquire()).await {
                    Ok(Ok(permit)) => permit,
                    _ => return None,
                }
            }
        };
        permit.forget();

        let value = self.queue.pop();
        if value.is_some() {
            self.vacant.add_permits(1);
        }
        value
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    /// Consumers currently suspended in [`pop`](Self::pop)
    pub fn pending_consumers(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}
