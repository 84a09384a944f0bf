//! Cancellable timers.
//!
//! Each key holds at most one pending deadline. Registering a key again
//! replaces its deadline; cancelling removes it. The owner polls
//! [`Timers::due`] with the current time.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Instant;

#[derive(Debug)]
pub struct Timers<K> {
    pending: HashMap<K, Instant>,
}

impl<K: Eq + Hash + Clone> Timers<K> {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Arm `key` to fire at `deadline`. Returns the replaced deadline.
    pub fn register(&mut self, key: K, deadline: Instant) -> Option<Instant> {
        self.pending.insert(key, deadline)
    }

    /// Disarm `key`. Returns true if it was pending.
    pub fn cancel(&mut self, key: &K) -> bool {
        self.pending.remove(key).is_some()
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.pending.get(key).copied()
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Remove and return every key whose deadline is at or before `now`,
    /// earliest first.
    pub fn due(&mut self, now: Instant) -> Vec<K> {
        let mut fired: Vec<(Instant, K)> = self
            .pending
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, at)| (*at, k.clone()))
            .collect();
        fired.sort_by_key(|(at, _)| *at);
        for (_, k) in &fired {
            self.pending.remove(k);
        }
        fired.into_iter().map(|(_, k)| k).collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for Timers<K> {
    fn default() -> Self {
        Self::new()
    }
}
