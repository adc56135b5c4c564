//! Fan-out of committed mutations to watch subscribers.
//!
//! One hub per node. The FSM publishes an event after every applied command;
//! each subscriber owns a bounded queue. Publishing never blocks apply: when
//! a queue is full the oldest event is dropped and the gap is reported to
//! that subscriber as a `Lagging` marker ahead of its next delivery.
//! Subscribers that see `Lagging` must resync from a full snapshot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::value::Value;

/// Bound on each subscriber's queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A mutation observed on the committed log, in commit order.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Set {
        path: String,
        value: Value,
        revision: u64,
    },
    Delete {
        path: String,
        revision: u64,
    },
    /// `missed` events were dropped ahead of whatever follows.
    Lagging {
        missed: u64,
    },
}

impl WatchEvent {
    pub fn revision(&self) -> Option<u64> {
        match self {
            WatchEvent::Set { revision, .. } | WatchEvent::Delete { revision, .. } => {
                Some(*revision)
            }
            WatchEvent::Lagging { .. } => None,
        }
    }
}

struct QueueInner {
    events: VecDeque<WatchEvent>,
    missed: u64,
    closed: bool,
}

struct SubscriberQueue {
    id: u64,
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl SubscriberQueue {
    fn enqueue(&self, event: WatchEvent) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            if inner.events.len() >= self.capacity {
                inner.events.pop_front();
                inner.missed += 1;
            }
            inner.events.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_one();
    }

    fn depth(&self) -> usize {
        self.inner.lock().unwrap().events.len()
    }
}

/// Per-node fan-out hub.
pub struct WatchHub {
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    capacity: usize,
}

impl WatchHub {
    pub fn new() -> Arc<WatchHub> {
        WatchHub::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<WatchHub> {
        Arc::new(WatchHub {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            capacity,
        })
    }

    /// Registers a new subscriber. Dropping the returned subscription (or
    /// calling `cancel`) detaches it; no event is delivered afterwards.
    pub fn subscribe(self: &Arc<WatchHub>) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            capacity: self.capacity,
            inner: Mutex::new(QueueInner {
                events: VecDeque::new(),
                missed: 0,
                closed: self.closed.load(Ordering::Acquire),
            }),
            notify: Notify::new(),
        });
        if !self.closed.load(Ordering::Acquire) {
            self.subscribers.lock().unwrap().push(queue.clone());
        }
        Subscription {
            queue,
            hub: self.clone(),
        }
    }

    /// Enqueues `event` to every active subscriber. Never blocks: full
    /// queues drop their oldest entry.
    pub fn publish(&self, event: WatchEvent) {
        let subscribers = self.subscribers.lock().unwrap();
        for sub in subscribers.iter() {
            sub.enqueue(event.clone());
        }
    }

    /// Closes every subscription. Subscribers drain what is queued and then
    /// observe end of stream.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let subscribers = std::mem::take(&mut *self.subscribers.lock().unwrap());
        for sub in subscribers {
            sub.close();
        }
    }

    fn remove(&self, id: u64) {
        self.subscribers.lock().unwrap().retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Deepest queue across subscribers, for operator visibility.
    pub fn max_queue_depth(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.depth())
            .max()
            .unwrap_or(0)
    }
}

/// One subscriber's receive handle.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
    hub: Arc<WatchHub>,
}

impl Subscription {
    /// Next event in commit order, a `Lagging` marker ahead of a gap, or
    /// `None` once the subscription is closed and drained.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        loop {
            {
                let mut inner = self.queue.inner.lock().unwrap();
                if inner.missed > 0 {
                    let missed = std::mem::take(&mut inner.missed);
                    return Some(WatchEvent::Lagging { missed });
                }
                if let Some(event) = inner.events.pop_front() {
                    return Some(event);
                }
                if inner.closed {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn cancel(&self) {
        self.queue.close();
        self.hub.remove(self.queue.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_event(path: &str, revision: u64) -> WatchEvent {
        WatchEvent::Set {
            path: path.to_string(),
            value: Value::Int(revision as i64),
            revision,
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let hub = WatchHub::new();
        let mut sub = hub.subscribe();

        hub.publish(set_event("/a", 1));
        hub.publish(WatchEvent::Delete {
            path: "/a".to_string(),
            revision: 2,
        });
        hub.publish(set_event("/b", 3));

        assert_eq!(sub.recv().await.unwrap().revision(), Some(1));
        assert_eq!(sub.recv().await.unwrap().revision(), Some(2));
        assert_eq!(sub.recv().await.unwrap().revision(), Some(3));
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_and_reports_lagging() {
        let hub = WatchHub::with_capacity(2);
        let mut sub = hub.subscribe();

        for rev in 1..=5 {
            hub.publish(set_event("/k", rev));
        }

        // Revisions 1-3 were dropped; the marker precedes the survivors.
        assert_eq!(sub.recv().await.unwrap(), WatchEvent::Lagging { missed: 3 });
        assert_eq!(sub.recv().await.unwrap().revision(), Some(4));
        assert_eq!(sub.recv().await.unwrap().revision(), Some(5));
    }

    #[tokio::test]
    async fn lagging_counter_resets_after_delivery() {
        let hub = WatchHub::with_capacity(1);
        let mut sub = hub.subscribe();

        hub.publish(set_event("/k", 1));
        hub.publish(set_event("/k", 2));
        assert_eq!(sub.recv().await.unwrap(), WatchEvent::Lagging { missed: 1 });
        assert_eq!(sub.recv().await.unwrap().revision(), Some(2));

        hub.publish(set_event("/k", 3));
        assert_eq!(sub.recv().await.unwrap().revision(), Some(3));
    }

    #[tokio::test]
    async fn subscribers_are_independent() {
        let hub = WatchHub::new();
        let mut sub1 = hub.subscribe();
        let mut sub2 = hub.subscribe();

        hub.publish(set_event("/a", 1));
        assert_eq!(sub1.recv().await.unwrap().revision(), Some(1));
        assert_eq!(sub2.recv().await.unwrap().revision(), Some(1));
    }

    #[tokio::test]
    async fn cancelled_subscription_receives_nothing_more() {
        let hub = WatchHub::new();
        let mut sub = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);

        sub.cancel();
        assert_eq!(hub.subscriber_count(), 0);

        hub.publish(set_event("/a", 1));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let hub = WatchHub::new();
        {
            let _sub = hub.subscribe();
            assert_eq!(hub.subscriber_count(), 1);
        }
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_drains_then_ends_stream() {
        let hub = WatchHub::new();
        let mut sub = hub.subscribe();

        hub.publish(set_event("/a", 1));
        hub.close();

        assert_eq!(sub.recv().await.unwrap().revision(), Some(1));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn subscribe_after_close_ends_immediately() {
        let hub = WatchHub::new();
        hub.close();
        let mut sub = hub.subscribe();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn queue_depth_is_observable() {
        let hub = WatchHub::new();
        let _sub = hub.subscribe();
        assert_eq!(hub.max_queue_depth(), 0);

        hub.publish(set_event("/a", 1));
        hub.publish(set_event("/b", 2));
        assert_eq!(hub.max_queue_depth(), 2);
    }

    #[tokio::test]
    async fn recv_waits_for_later_publish() {
        let hub = WatchHub::new();
        let mut sub = hub.subscribe();

        let publisher = {
            let hub = hub.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                hub.publish(set_event("/late", 7));
            })
        };

        assert_eq!(sub.recv().await.unwrap().revision(), Some(7));
        publisher.await.unwrap();
    }
}
