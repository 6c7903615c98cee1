//! Bounded in-process queues for the speech pipeline.
//!
//! `tokio::mpsc` receivers are single-owner, but barge-in needs to purge the
//! TTS and egress queues from outside their consumer tasks. This queue keeps
//! the backing buffer behind a mutex so any task can drain it while the
//! consumer is parked.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

/// A bounded MPMC queue with non-blocking drain.
///
/// `push` applies back-pressure (waits for space), `pop` waits for an item,
/// `drain` removes everything currently buffered without waiting. After
/// `close`, pushes fail and pops return `None` once the buffer empties.
pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    item_ready: Notify,
    space_ready: Notify,
    closed: AtomicBool,
}

/// Error returned by `push` after the queue is closed.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueClosed;

impl std::fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "queue closed")
    }
}

impl std::error::Error for QueueClosed {}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            item_ready: Notify::new(),
            space_ready: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Append an item, waiting for space if the queue is full.
    pub async fn push(&self, item: T) -> Result<(), QueueClosed> {
        let mut item = Some(item);
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(QueueClosed);
            }
            {
                let mut q = self.inner.lock().expect("queue lock poisoned");
                if q.len() < self.capacity {
                    q.push_back(item.take().expect("item consumed twice"));
                    drop(q);
                    self.item_ready.notify_one();
                    return Ok(());
                }
            }
            self.space_ready.notified().await;
        }
    }

    /// Remove the oldest item, waiting for one to arrive.
    /// Returns `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut q = self.inner.lock().expect("queue lock poisoned");
                if let Some(item) = q.pop_front() {
                    drop(q);
                    self.space_ready.notify_one();
                    return Some(item);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.item_ready.notified().await;
        }
    }

    /// Remove and return everything currently buffered. Never waits.
    pub fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = {
            let mut q = self.inner.lock().expect("queue lock poisoned");
            q.drain(..).collect()
        };
        if !drained.is_empty() {
            self.space_ready.notify_waiters();
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue. Idempotent. Waiting pushers fail, waiting poppers
    /// drain the remaining items then observe the end of the queue.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.item_ready.notify_waiters();
        self.space_ready.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let q = BoundedQueue::new(10);
        q.push(1).await.unwrap();
        q.push(2).await.unwrap();
        q.push(3).await.unwrap();
        assert_eq!(q.pop().await, Some(1));
        assert_eq!(q.pop().await, Some(2));
        assert_eq!(q.pop().await, Some(3));
    }

    #[tokio::test]
    async fn test_push_blocks_when_full() {
        let q = Arc::new(BoundedQueue::new(1));
        q.push(1).await.unwrap();

        let q2 = q.clone();
        let pusher = tokio::spawn(async move { q2.push(2).await });

        // The second push cannot complete until we pop
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pusher.is_finished());

        assert_eq!(q.pop().await, Some(1));
        pusher.await.unwrap().unwrap();
        assert_eq!(q.pop().await, Some(2));
    }

    #[tokio::test]
    async fn test_drain_unblocks_pusher() {
        let q = Arc::new(BoundedQueue::new(1));
        q.push("a").await.unwrap();

        let q2 = q.clone();
        let pusher = tokio::spawn(async move { q2.push("b").await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let drained = q.drain();
        assert_eq!(drained, vec!["a"]);
        pusher.await.unwrap().unwrap();
        assert_eq!(q.pop().await, Some("b"));
    }

    #[tokio::test]
    async fn test_close_wakes_popper() {
        let q = Arc::new(BoundedQueue::<u8>::new(4));
        let q2 = q.clone();
        let popper = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close();
        assert_eq!(popper.await.unwrap(), None);
        assert_eq!(q.push(1).await, Err(QueueClosed));
    }

    #[tokio::test]
    async fn test_close_drains_remaining_items() {
        let q = BoundedQueue::new(4);
        q.push(7).await.unwrap();
        q.close();
        assert_eq!(q.pop().await, Some(7));
        assert_eq!(q.pop().await, None);
    }
}
