//! Index-keyed one-shot notification fan-out.
//!
//! RPC handlers subscribe on the log index their command was assigned and
//! park until the applier publishes the result for that index. Mailboxes
//! hold at most one value and are single-consumer; delivery among the
//! subscribers of one index is unordered, and no ordering is promised
//! across indices.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

struct IndexEntry<T> {
    subscribers: Vec<mpsc::Sender<T>>,
    /// Subscribers which have not yet released. The map entry is dropped
    /// only when this reaches zero, whether or not a notify ever arrived.
    active: usize,
}

/// A store of single-value mailboxes keyed by log index.
pub struct SubscriptionStore<T> {
    inner: Mutex<HashMap<u64, IndexEntry<T>>>,
}

impl<T> Default for SubscriptionStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SubscriptionStore<T> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new mailbox at `index`.
    ///
    /// Every call must be paired with exactly one [`release`](Self::release)
    /// for the same index, regardless of whether a notification arrived.
    pub fn subscribe(&self, index: u64) -> mpsc::Receiver<T> {
        let mut inner = self.inner.lock().expect("subscription store mutex poisoned");
        let entry = inner.entry(index).or_insert_with(|| IndexEntry {
            subscribers: Vec::new(),
            active: 0,
        });

        // At most one result is ever published per index.
        let (tx, rx) = mpsc::channel(1);
        entry.subscribers.push(tx);
        entry.active += 1;
        rx
    }

    /// Drop one subscription at `index`, reclaiming the whole entry once the
    /// last subscriber is gone.
    pub fn release(&self, index: u64) {
        let mut inner = self.inner.lock().expect("subscription store mutex poisoned");
        let entry = match inner.get_mut(&index) {
            Some(entry) => entry,
            None => panic!("release({}) without a matching subscribe", index),
        };
        assert!(entry.active > 0, "release({}) without a matching subscribe", index);

        entry.active -= 1;
        if entry.active == 0 {
            inner.remove(&index);
        }
    }

    /// The number of indices currently holding subscribers.
    pub fn num_entries(&self) -> usize {
        self.inner.lock().expect("subscription store mutex poisoned").len()
    }
}

impl<T: Clone> SubscriptionStore<T> {
    /// Deliver `value` to every current subscriber at `index` without blocking.
    ///
    /// Mailboxes are bounded to one slot, so `try_send` only fails for a
    /// subscriber which already received a value or walked away; both are
    /// ignored.
    pub fn notify_all(&self, index: u64, value: T) {
        let inner = self.inner.lock().expect("subscription store mutex poisoned");
        if let Some(entry) = inner.get(&index) {
            for sub in entry.subscribers.iter() {
                let _ = sub.try_send(value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_notify_release() {
        let store = SubscriptionStore::new();

        let mut rx = store.subscribe(3);
        store.notify_all(3, "hello");
        assert_eq!(rx.recv().await, Some("hello"));

        store.release(3);
        assert_eq!(store.num_entries(), 0);
    }

    #[tokio::test]
    async fn test_notify_reaches_every_subscriber_of_the_index() {
        let store = SubscriptionStore::new();

        let mut a = store.subscribe(7);
        let mut b = store.subscribe(7);
        let mut other = store.subscribe(8);

        store.notify_all(7, 42u64);
        assert_eq!(a.recv().await, Some(42));
        assert_eq!(b.recv().await, Some(42));
        assert!(other.try_recv().is_err());

        store.release(7);
        store.release(7);
        store.release(8);
        assert_eq!(store.num_entries(), 0);
    }

    #[tokio::test]
    async fn test_notify_without_subscribers_is_a_noop() {
        let store: SubscriptionStore<u64> = SubscriptionStore::new();
        store.notify_all(1, 9);
        assert_eq!(store.num_entries(), 0);
    }

    #[tokio::test]
    async fn test_entry_survives_until_last_release() {
        let store: SubscriptionStore<u64> = SubscriptionStore::new();

        let _a = store.subscribe(5);
        let _b = store.subscribe(5);
        store.release(5);
        assert_eq!(store.num_entries(), 1);
        store.release(5);
        assert_eq!(store.num_entries(), 0);
    }

    #[tokio::test]
    async fn test_second_notify_does_not_block() {
        let store = SubscriptionStore::new();

        let _rx = store.subscribe(2);
        store.notify_all(2, 1u64);
        // Mailbox is full; delivery must be dropped, not block.
        store.notify_all(2, 2u64);
        store.release(2);
    }
}
