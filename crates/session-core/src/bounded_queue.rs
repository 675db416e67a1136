//! FIFO with a fixed capacity, an oldest-droppable eviction policy, and
//! cumulative metrics (spec §4.1). Used for every per-connection outbound
//! queue in the protocol layer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

/// Items that can be dropped under queue pressure implement this. Only
/// domain partials are droppable; finals, acks, errors, heartbeats, welcome,
/// and snapshot are never droppable (§4.1).
pub trait Droppable {
    fn is_droppable(&self) -> bool;
}

impl Droppable for loquilex_envelope::Envelope {
    fn is_droppable(&self) -> bool {
        self.t.is_droppable()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Accepted,
    /// `dropped_count` oldest droppable items were evicted to admit this one.
    AcceptedWithDrop { dropped_count: u64 },
    /// The incoming droppable item itself was discarded because the queue
    /// was full of non-droppable items with nothing eligible to evict. Not
    /// spelled out verbatim by the contract, but required to honor "finals
    /// are never dropped" without ever failing a droppable offer.
    DroppedIncoming,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
    #[error("queue overflow: capacity exhausted with no droppable item to evict")]
    Overflow,
}

/// Cumulative, monotonically increasing counters (§4.1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueMetricsSnapshot {
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped_oldest: u64,
    pub overflow_failures: u64,
}

#[derive(Debug, Default)]
struct QueueMetrics {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dropped_oldest: AtomicU64,
    overflow_failures: AtomicU64,
}

#[derive(Debug)]
pub struct BoundedQueue<T> {
    capacity: usize,
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
    closed: std::sync::atomic::AtomicBool,
    metrics: QueueMetrics,
}

impl<T: Droppable> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "BoundedQueue capacity must be positive");
        Self {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
            metrics: QueueMetrics::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Never blocks: drops or fails instead (§5 suspension points).
    pub fn offer(&self, item: T) -> Result<OfferOutcome, QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let mut q = self.inner.lock().unwrap();
        if q.len() < self.capacity {
            q.push_back(item);
            drop(q);
            self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
            self.notify.notify_one();
            return Ok(OfferOutcome::Accepted);
        }

        let mut dropped = 0u64;
        while q.len() >= self.capacity {
            let victim = q.iter().position(Droppable::is_droppable);
            match victim {
                Some(idx) => {
                    q.remove(idx);
                    dropped += 1;
                }
                None => break,
            }
        }

        if q.len() < self.capacity {
            q.push_back(item);
            drop(q);
            self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .dropped_oldest
                .fetch_add(dropped, Ordering::Relaxed);
            self.notify.notify_one();
            Ok(OfferOutcome::AcceptedWithDrop {
                dropped_count: dropped,
            })
        } else if item.is_droppable() {
            drop(q);
            self.metrics
                .dropped_oldest
                .fetch_add(dropped + 1, Ordering::Relaxed);
            Ok(OfferOutcome::DroppedIncoming)
        } else {
            drop(q);
            self.metrics
                .overflow_failures
                .fetch_add(1, Ordering::Relaxed);
            Err(QueueError::Overflow)
        }
    }

    /// Blocks cooperatively until an item is available or `close()` is called.
    pub async fn poll(&self) -> Option<T> {
        loop {
            {
                let mut q = self.inner.lock().unwrap();
                if let Some(item) = q.pop_front() {
                    drop(q);
                    self.metrics.dequeued.fetch_add(1, Ordering::Relaxed);
                    return Some(item);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Wakes all waiters; subsequent `offer` fails, `poll` drains then returns `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            enqueued: self.metrics.enqueued.load(Ordering::Relaxed),
            dequeued: self.metrics.dequeued.load(Ordering::Relaxed),
            dropped_oldest: self.metrics.dropped_oldest.load(Ordering::Relaxed),
            overflow_failures: self.metrics.overflow_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Item {
        id: u64,
        droppable: bool,
    }

    impl Droppable for Item {
        fn is_droppable(&self) -> bool {
            self.droppable
        }
    }

    fn partial(id: u64) -> Item {
        Item {
            id,
            droppable: true,
        }
    }

    fn final_(id: u64) -> Item {
        Item {
            id,
            droppable: false,
        }
    }

    #[test]
    fn full_queue_of_droppables_drops_oldest_on_offer() {
        let q: BoundedQueue<Item> = BoundedQueue::new(2);
        assert_eq!(q.offer(partial(1)).unwrap(), OfferOutcome::Accepted);
        assert_eq!(q.offer(partial(2)).unwrap(), OfferOutcome::Accepted);
        assert_eq!(
            q.offer(partial(3)).unwrap(),
            OfferOutcome::AcceptedWithDrop { dropped_count: 1 }
        );
        let mut remaining = vec![];
        while let Some(item) = q.inner.lock().unwrap().pop_front() {
            remaining.push(item.id);
        }
        assert_eq!(remaining, vec![2, 3]);
        assert_eq!(q.metrics().dropped_oldest, 1);
    }

    #[test]
    fn full_queue_of_finals_overflows_and_never_drops() {
        let q: BoundedQueue<Item> = BoundedQueue::new(2);
        q.offer(final_(1)).unwrap();
        q.offer(final_(2)).unwrap();
        let err = q.offer(final_(3)).unwrap_err();
        assert_eq!(err, QueueError::Overflow);
        assert_eq!(q.metrics().overflow_failures, 1);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn finals_evict_droppable_items_to_make_room() {
        let q: BoundedQueue<Item> = BoundedQueue::new(2);
        q.offer(partial(1)).unwrap();
        q.offer(partial(2)).unwrap();
        let outcome = q.offer(final_(3)).unwrap();
        assert_eq!(outcome, OfferOutcome::AcceptedWithDrop { dropped_count: 1 });
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn incoming_droppable_is_discarded_when_no_victim_exists() {
        let q: BoundedQueue<Item> = BoundedQueue::new(1);
        q.offer(final_(1)).unwrap();
        let outcome = q.offer(partial(2)).unwrap();
        assert_eq!(outcome, OfferOutcome::DroppedIncoming);
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn poll_blocks_until_offer_then_returns_item() {
        let q: std::sync::Arc<BoundedQueue<Item>> = std::sync::Arc::new(BoundedQueue::new(4));
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.poll().await });
        tokio::task::yield_now().await;
        q.offer(final_(42)).unwrap();
        let item = handle.await.unwrap();
        assert_eq!(item.unwrap().id, 42);
    }

    #[tokio::test]
    async fn close_wakes_waiters_and_poll_then_returns_none() {
        let q: std::sync::Arc<BoundedQueue<Item>> = std::sync::Arc::new(BoundedQueue::new(4));
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.poll().await });
        tokio::task::yield_now().await;
        q.close();
        assert_eq!(handle.await.unwrap(), None);
        assert_eq!(q.offer(final_(1)).unwrap_err(), QueueError::Closed);
    }
}
