use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::models::ProgressStatus;

/// Delivered back to the owner when a scheduled removal comes due.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReapNotice {
    pub id: String,
    pub generation: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReapDelays {
    pub settled: Duration,
    pub failed: Duration,
}

impl ReapDelays {
    pub fn for_status(&self, status: &ProgressStatus) -> Duration {
        match status {
            ProgressStatus::Failed => self.failed,
            _ => self.settled,
        }
    }
}

impl Default for ReapDelays {
    fn default() -> Self {
        Self {
            settled: Duration::from_secs(3),
            failed: Duration::from_secs(10),
        }
    }
}

struct ScheduledReap {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Registry of one-shot removal timers, keyed by item id.
///
/// Timers post a [`ReapNotice`] into the owner's mailbox instead of touching
/// the table themselves; the owner confirms with [`TerminalReaper::take_due`]
/// so a superseded timer can never remove a record.
pub struct TerminalReaper<M> {
    delays: ReapDelays,
    mailbox: mpsc::WeakSender<M>,
    wrap: fn(ReapNotice) -> M,
    scheduled: HashMap<String, ScheduledReap>,
    next_generation: u64,
}

impl<M: Send + 'static> TerminalReaper<M> {
    pub fn new(delays: ReapDelays, mailbox: mpsc::WeakSender<M>, wrap: fn(ReapNotice) -> M) -> Self {
        Self {
            delays,
            mailbox,
            wrap,
            scheduled: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Arms (or re-arms) the removal timer for `id`. A later schedule for
    /// the same id replaces the earlier one.
    pub fn schedule(&mut self, id: &str, status: &ProgressStatus) -> Duration {
        let delay = self.delays.for_status(status);
        self.next_generation += 1;
        let generation = self.next_generation;

        let mailbox = self.mailbox.clone();
        let wrap = self.wrap;
        let notice = ReapNotice {
            id: id.to_string(),
            generation,
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(sender) = mailbox.upgrade() {
                let _ = sender.send(wrap(notice)).await;
            }
        });

        if let Some(previous) = self.scheduled.insert(
            id.to_string(),
            ScheduledReap { generation, handle },
        ) {
            previous.handle.abort();
        }
        tracing::trace!("reap scheduled id={} delay_ms={}", id, delay.as_millis());
        delay
    }

    pub fn cancel(&mut self, id: &str) -> bool {
        match self.scheduled.remove(id) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Accepts a notice only if it belongs to the current schedule for its id.
    pub fn take_due(&mut self, notice: &ReapNotice) -> bool {
        let current = self
            .scheduled
            .get(&notice.id)
            .map(|entry| entry.generation == notice.generation)
            .unwrap_or(false);
        if current {
            self.scheduled.remove(&notice.id);
        }
        current
    }

    pub fn is_scheduled(&self, id: &str) -> bool {
        self.scheduled.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.scheduled.len();
        for (_, entry) in self.scheduled.drain() {
            entry.handle.abort();
        }
        cancelled
    }
}

impl<M> Drop for TerminalReaper<M> {
    fn drop(&mut self) {
        for (_, entry) in self.scheduled.drain() {
            entry.handle.abort();
        }
    }
}
