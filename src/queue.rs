//! Bounded blocking queue with head inspection.
//!
//! Both the input pipeline and the invalidation worker need a queue
//! that supports conditional head removal (for coalescing) on top of
//! the usual bounded offer / blocking take, so `tokio::sync::mpsc`
//! does not fit. This is a `Mutex<VecDeque>` with a `Notify` for the
//! async waiter, shut down explicitly at teardown.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::VaporError;

/// FIFO with a hard capacity and cooperative shutdown.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
}

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    shutdown: bool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                shutdown: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Append an item, failing when full or shut down.
    pub fn offer(&self, item: T) -> Result<(), VaporError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutdown {
            return Err(VaporError::QueueShutdown);
        }
        if inner.items.len() >= self.capacity {
            return Err(VaporError::QueueBound);
        }
        inner.items.push_back(item);
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Remove the head without waiting.
    pub fn poll(&self) -> Option<T> {
        self.inner.lock().unwrap().items.pop_front()
    }

    /// Remove the head only if `pred` accepts it.
    pub fn poll_if(&self, pred: impl FnOnce(&T) -> bool) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        if pred(inner.items.front()?) {
            inner.items.pop_front()
        } else {
            None
        }
    }

    /// Wait for the head element. Returns `None` once the queue is
    /// shut down and drained.
    pub async fn take(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.shutdown {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Reject future offers and wake any waiter.
    pub fn shutdown(&self) {
        self.inner.lock().unwrap().shutdown = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn offer_and_poll_fifo() {
        let q = BoundedQueue::new(4);
        assert!(q.is_empty());
        q.offer(1).unwrap();
        q.offer(2).unwrap();
        assert_eq!(q.poll(), Some(1));
        assert_eq!(q.poll(), Some(2));
        assert_eq!(q.poll(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn bound_is_enforced() {
        let q = BoundedQueue::new(2);
        q.offer(1).unwrap();
        q.offer(2).unwrap();
        assert!(matches!(q.offer(3), Err(VaporError::QueueBound)));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn poll_if_checks_head_only() {
        let q = BoundedQueue::new(4);
        q.offer(10).unwrap();
        q.offer(20).unwrap();
        assert_eq!(q.poll_if(|&v| v == 20), None);
        assert_eq!(q.poll_if(|&v| v == 10), Some(10));
        assert_eq!(q.poll_if(|&v| v == 20), Some(20));
        assert_eq!(q.poll_if(|_| true), None);
    }

    #[tokio::test]
    async fn take_waits_for_offer() {
        let q = Arc::new(BoundedQueue::new(4));
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.take().await })
        };
        tokio::task::yield_now().await;
        q.offer(7).unwrap();
        assert_eq!(waiter.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn shutdown_releases_waiter() {
        let q = Arc::new(BoundedQueue::<u32>::new(4));
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.take().await })
        };
        tokio::task::yield_now().await;
        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
        assert!(matches!(q.offer(1), Err(VaporError::QueueShutdown)));
    }
}
