use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::trace;

/// Buffered events each subscriber can fall behind by before it starts
/// missing deliveries (replay covers the gap on reconnect).
pub const SUBSCRIBER_BUFFER: usize = 64;

/// One published change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Monotonically increasing, assigned by the broker, never reused.
    pub id: u64,
    pub kind: String,
    pub data: String,
}

#[derive(Debug)]
struct Inner {
    next_id: u64,
    ring: VecDeque<Arc<Event>>,
    subscribers: HashMap<u64, mpsc::Sender<Arc<Event>>>,
    next_subscriber_id: u64,
}

/// In-process publish/subscribe hub with a bounded replay history.
///
/// Publishing appends to a fixed-capacity ring (oldest evicted first) and
/// best-effort delivers to every live subscriber: a subscriber with a full
/// buffer is skipped for that event and is expected to catch up via
/// [`Broker::events_after`] after reconnecting.
#[derive(Debug)]
pub struct Broker {
    capacity: usize,
    inner: Arc<Mutex<Inner>>,
}

impl Broker {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Arc::new(Mutex::new(Inner {
                next_id: 1,
                ring: VecDeque::with_capacity(capacity),
                subscribers: HashMap::new(),
                next_subscriber_id: 0,
            })),
        }
    }

    /// Assign the next id, record the event, and fan it out. Delivery to
    /// subscriber channels happens after the lock is released so a slow
    /// consumer cannot stall the publisher. Returns the assigned id.
    pub fn publish(&self, kind: &str, data: impl Into<String>) -> u64 {
        let (event, senders) = {
            let mut inner = self.inner.lock().expect("broker lock poisoned");
            let event = Arc::new(Event {
                id: inner.next_id,
                kind: kind.to_string(),
                data: data.into(),
            });
            inner.next_id += 1;

            if inner.ring.len() >= self.capacity {
                inner.ring.pop_front();
            }
            inner.ring.push_back(Arc::clone(&event));

            let senders: Vec<mpsc::Sender<Arc<Event>>> =
                inner.subscribers.values().cloned().collect();
            (event, senders)
        };

        for sender in senders {
            if sender.try_send(Arc::clone(&event)).is_err() {
                trace!(event_id = event.id, "subscriber buffer full, skipping");
            }
        }
        event.id
    }

    /// Register a live subscriber. The subscription unsubscribes itself when
    /// dropped.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = {
            let mut inner = self.inner.lock().expect("broker lock poisoned");
            let id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            inner.subscribers.insert(id, sender);
            id
        };
        Subscription {
            guard: SubscriptionGuard {
                inner: Arc::clone(&self.inner),
                id,
            },
            receiver,
        }
    }

    /// Buffered events with id greater than `last_id`, in ascending order.
    ///
    /// Returns `(_, true)` with no events when the ring is empty. Returns
    /// `(_, false)` when `last_id` precedes `oldest − 1`: the caller is too
    /// far behind for replay and must resync. Replaying from exactly
    /// `oldest − 1` yields the full buffer; reconnect logic depends on this
    /// exact boundary.
    #[must_use]
    pub fn events_after(&self, last_id: u64) -> (Vec<Arc<Event>>, bool) {
        let inner = self.inner.lock().expect("broker lock poisoned");

        let Some(oldest) = inner.ring.front() else {
            return (Vec::new(), true);
        };
        // Written as last_id + 1 < oldest to avoid underflow when oldest is 1.
        if last_id + 1 < oldest.id {
            return (Vec::new(), false);
        }

        let events = inner
            .ring
            .iter()
            .filter(|e| e.id > last_id)
            .cloned()
            .collect();
        (events, true)
    }

    /// Id of the most recently published event (0 before the first publish).
    #[must_use]
    pub fn last_event_id(&self) -> u64 {
        self.inner.lock().expect("broker lock poisoned").next_id - 1
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .expect("broker lock poisoned")
            .subscribers
            .len()
    }
}

/// A live subscriber handle: a buffered receiver plus a drop guard that
/// removes the channel from the broker.
#[derive(Debug)]
pub struct Subscription {
    guard: SubscriptionGuard,
    receiver: mpsc::Receiver<Arc<Event>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.receiver.recv().await
    }

    /// Split into the guard and the raw receiver; the caller must keep the
    /// guard alive for as long as the receiver is consumed.
    #[must_use]
    pub fn into_parts(self) -> (SubscriptionGuard, mpsc::Receiver<Arc<Event>>) {
        (self.guard, self.receiver)
    }
}

#[derive(Debug)]
pub struct SubscriptionGuard {
    inner: Arc<Mutex<Inner>>,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.inner
            .lock()
            .expect("broker lock poisoned")
            .subscribers
            .remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_from_one() {
        let broker = Broker::new(10);
        assert_eq!(broker.publish("a", "{}"), 1);
        assert_eq!(broker.publish("b", "{}"), 2);
        assert_eq!(broker.publish("c", "{}"), 3);
        assert_eq!(broker.last_event_id(), 3);
    }

    #[test]
    fn empty_ring_replays_nothing_successfully() {
        let broker = Broker::new(10);
        let (events, ok) = broker.events_after(0);
        assert!(ok);
        assert!(events.is_empty());
    }

    #[test]
    fn ring_evicts_oldest_and_enforces_replay_boundary() {
        let broker = Broker::new(3);
        for kind in ["a", "b", "c", "d"] {
            broker.publish(kind, "{}");
        }
        // Ring now holds ids {2, 3, 4}; oldest is 2.

        // last_id = 1 equals oldest − 1: the full buffer replays.
        let (events, ok) = broker.events_after(1);
        assert!(ok);
        assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), [2, 3, 4]);

        // last_id = 0 precedes oldest − 1: replay refused.
        let (events, ok) = broker.events_after(0);
        assert!(!ok);
        assert!(events.is_empty());

        // Within range: only the newer subset, ascending.
        let (events, ok) = broker.events_after(3);
        assert!(ok);
        assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), [4]);

        // Fully caught up: nothing to replay, still ok.
        let (events, ok) = broker.events_after(4);
        assert!(ok);
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn subscribers_receive_published_events_in_order() {
        let broker = Arc::new(Broker::new(10));
        let mut subscription = broker.subscribe();

        broker.publish("stories_updated", "{\"n\":1}");
        broker.publish("stories_updated", "{\"n\":2}");

        let first = subscription.recv().await.expect("first event");
        let second = subscription.recv().await.expect("second event");
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(first.kind, "stories_updated");
    }

    #[tokio::test]
    async fn dropping_a_subscription_unsubscribes() {
        let broker = Arc::new(Broker::new(10));
        let subscription = broker.subscribe();
        assert_eq!(broker.subscriber_count(), 1);

        drop(subscription);
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_is_skipped_not_blocked() {
        let broker = Arc::new(Broker::new(2000));
        let mut subscription = broker.subscribe();

        // Publish past the subscriber buffer without draining it; the
        // publisher must not block and the overflow is simply dropped.
        for _ in 0..(SUBSCRIBER_BUFFER + 10) {
            broker.publish("tick", "{}");
        }

        let mut received = 0;
        while let Ok(event) = subscription.receiver.try_recv() {
            received += 1;
            assert!(event.id <= SUBSCRIBER_BUFFER as u64);
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
    }
}
