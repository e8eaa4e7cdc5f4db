//! Correlation table for in-flight waits.
//!
//! Both the protocol client (RPC requests awaiting their correlated
//! response) and the human executor (approval waits awaiting an external
//! decision) need the same structure: a map from correlation key to a
//! completion handle, where the waiter may also give up (deadline) and the
//! whole table may be drained when the underlying channel dies. This module
//! factors that structure once.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use tokio::sync::oneshot;

/// A table of pending waits keyed by correlation key.
///
/// `register` hands back the receiving half of a oneshot channel; `resolve`
/// completes it. Entries are removed on resolve, on explicit `remove`
/// (the waiter's deadline path), and on `drain_with` (connection teardown).
pub struct PendingMap<K, T> {
    entries: Mutex<HashMap<K, oneshot::Sender<T>>>,
}

impl<K: Eq + Hash + Clone, T> PendingMap<K, T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a waiter under `key`, replacing any previous waiter for the
    /// same key (the replaced sender is dropped, waking its receiver with a
    /// channel-closed error).
    pub fn register(&self, key: K) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.entries.lock().unwrap().insert(key, tx);
        rx
    }

    /// Complete the waiter for `key` with `value`.
    ///
    /// Returns `false` when no waiter is registered (already resolved,
    /// timed out, or never existed) or the receiver was dropped.
    pub fn resolve(&self, key: &K, value: T) -> bool {
        match self.entries.lock().unwrap().remove(key) {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Remove a waiter without completing it. Returns `true` if an entry
    /// was present.
    pub fn remove(&self, key: &K) -> bool {
        self.entries.lock().unwrap().remove(key).is_some()
    }

    /// Complete every outstanding waiter with a value produced per key.
    pub fn drain_with(&self, mut make: impl FnMut(&K) -> T) {
        let drained: Vec<(K, oneshot::Sender<T>)> =
            self.entries.lock().unwrap().drain().collect();
        for (key, tx) in drained {
            let _ = tx.send(make(&key));
        }
    }

    /// Snapshot of the currently pending keys.
    pub fn keys(&self) -> Vec<K> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }

    /// Number of outstanding waits.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether no waits are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone, T> Default for PendingMap<K, T> {
    fn default() -> Self {
        Self::new()
    }
}
