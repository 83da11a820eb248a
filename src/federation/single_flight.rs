//! At most one concurrent computation per key.
//!
//! Callers that arrive while a computation for the same key is running wait
//! for it and receive a clone of its result. If the running computation is
//! cancelled, one of the waiters takes over.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;

pub struct SingleFlight<K, V> {
    inflight: Mutex<HashMap<K, broadcast::Sender<V>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

/// Removes the leader's entry when dropped, waking waiters either with the
/// result or, on cancellation, with a closed channel.
struct LeaderGuard<'a, K: Eq + Hash, V> {
    inflight: &'a Mutex<HashMap<K, broadcast::Sender<V>>>,
    key: Option<K>,
}

impl<K: Eq + Hash, V> LeaderGuard<'_, K, V> {
    fn finish(mut self, value: V) {
        if let Some(key) = self.key.take() {
            let sender = self
                .inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
            if let Some(sender) = sender {
                let _ = sender.send(value);
            }
        }
    }
}

impl<K: Eq + Hash, V> Drop for LeaderGuard<'_, K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key` unless it is already running, in which case
    /// wait for that run's result.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        loop {
            let waiting = {
                let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
                match inflight.get(&key) {
                    Some(sender) => Some(sender.subscribe()),
                    None => {
                        let (sender, _) = broadcast::channel(1);
                        inflight.insert(key.clone(), sender);
                        None
                    }
                }
            };

            match waiting {
                Some(mut receiver) => match receiver.recv().await {
                    Ok(value) => return value,
                    // Leader went away without a result; race to replace it.
                    Err(_) => continue,
                },
                None => break,
            }
        }

        let guard = LeaderGuard {
            inflight: &self.inflight,
            key: Some(key),
        };
        let value = work().await;
        guard.finish(value.clone());
        value
    }

    /// Number of keys with a computation running.
    pub fn in_flight(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
