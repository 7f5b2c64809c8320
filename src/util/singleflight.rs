use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

/// The shared result of a coalesced call. Errors are `Arc`-wrapped so one
/// failure can be handed to every waiter.
pub type Outcome = Result<(), Arc<anyhow::Error>>;

/// Per-key in-flight call coalescing.
///
/// The first caller for a key becomes the leader and runs the work; callers
/// arriving while it is in flight wait on a broadcast channel and receive the
/// leader's outcome. The entry is removed before the outcome is broadcast, so
/// a caller arriving afterwards starts a fresh flight. If a leader is dropped
/// mid-flight (cancellation), its entry is cleaned up and waiters get an
/// error rather than hanging.
#[derive(Debug)]
pub struct Group<K> {
    inflight: Mutex<HashMap<K, broadcast::Sender<Outcome>>>,
}

impl<K> Default for Group<K> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> Group<K>
where
    K: Eq + Hash + Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key`, coalescing with any flight already under way.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> Outcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let waiter = {
            let mut inflight = self.inflight.lock().expect("singleflight lock poisoned");
            match inflight.get(&key) {
                Some(sender) => Some(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    inflight.insert(key.clone(), sender);
                    None
                }
            }
        };

        if let Some(mut receiver) = waiter {
            return match receiver.recv().await {
                Ok(outcome) => outcome,
                // The leader was dropped before completing; surface that as
                // a failure instead of silently retrying.
                Err(_) => Err(Arc::new(anyhow::anyhow!("coalesced call abandoned"))),
            };
        }

        let mut guard = FlightGuard {
            group: self,
            key: Some(key),
        };
        let outcome = work().await.map_err(Arc::new);

        let key = guard.key.take().expect("flight key already consumed");
        let sender = self
            .inflight
            .lock()
            .expect("singleflight lock poisoned")
            .remove(&key);
        if let Some(sender) = sender {
            // No receivers is fine: nobody coalesced with this flight.
            let _ = sender.send(outcome.clone());
        }
        outcome
    }
}

/// Removes an abandoned leader's entry so waiters observe a closed channel.
struct FlightGuard<'g, K>
where
    K: Eq + Hash + Clone,
{
    group: &'g Group<K>,
    key: Option<K>,
}

impl<K> Drop for FlightGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.group
                .inflight
                .lock()
                .expect("singleflight lock poisoned")
                .remove(&key);
        }
    }
}
