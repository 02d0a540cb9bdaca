use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

/// Tracks cancel requests still awaiting confirmation and operations whose
/// cancellation was recently confirmed by the engine.
#[derive(Debug)]
pub struct CancellationGuard {
    pending: HashSet<String>,
    recently_cancelled: HashMap<String, Instant>,
    suppression_ttl: Duration,
}

impl CancellationGuard {
    pub fn new(suppression_ttl: Duration) -> Self {
        Self {
            pending: HashSet::new(),
            recently_cancelled: HashMap::new(),
            suppression_ttl,
        }
    }

    /// Returns `false` when a cancel for `operation_id` is already in flight.
    pub fn mark_pending(&mut self, operation_id: &str) -> bool {
        self.pending.insert(operation_id.to_string())
    }

    pub fn clear_pending(&mut self, operation_id: &str) -> bool {
        self.pending.remove(operation_id)
    }

    pub fn is_pending(&self, operation_id: &str) -> bool {
        self.pending.contains(operation_id)
    }

    pub fn pending(&self) -> &HashSet<String> {
        &self.pending
    }

    /// Records a confirmed cancellation, refreshing its expiry.
    pub fn record_cancelled(&mut self, operation_id: &str, now: Instant) {
        self.pending.remove(operation_id);
        self.recently_cancelled
            .insert(operation_id.to_string(), now + self.suppression_ttl);
    }

    pub fn is_recently_cancelled(&self, operation_id: &str, now: Instant) -> bool {
        self.recently_cancelled
            .get(operation_id)
            .map(|expires_at| *expires_at > now)
            .unwrap_or(false)
    }

    pub fn prune_expired(&mut self, now: Instant) -> usize {
        let before = self.recently_cancelled.len();
        self.recently_cancelled
            .retain(|_, expires_at| *expires_at > now);
        before - self.recently_cancelled.len()
    }

    pub fn recently_cancelled_len(&self) -> usize {
        self.recently_cancelled.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.recently_cancelled.clear();
    }
}
