//! Pending self-echoes: correlation ids of sends we made ourselves.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct PendingEchoes {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl PendingEchoes {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, correlation_id: &str) {
        self.register_at(correlation_id, Instant::now());
    }

    fn register_at(&self, correlation_id: &str, now: Instant) {
        let mut entries = self.entries();
        entries.retain(|_, expires| *expires > now);
        entries.insert(correlation_id.to_string(), now + self.ttl);
    }

    /// Returns true exactly once for a registered, unexpired id.
    pub fn try_consume(&self, correlation_id: &str) -> bool {
        self.try_consume_at(correlation_id, Instant::now())
    }

    fn try_consume_at(&self, correlation_id: &str, now: Instant) -> bool {
        match self.entries().remove(correlation_id) {
            Some(expires) => expires > now,
            None => false,
        }
    }

    /// Drop an entry whose send failed.
    pub fn withdraw(&self, correlation_id: &str) {
        self.entries().remove(correlation_id);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
