use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::models::{non_blank, ProgressEvent, ProgressItem, ProgressStatus};
use crate::services::source_classifier::SourceClassifier;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeKind {
    Inserted,
    Replaced,
}

/// Identity-keyed store of the latest known state of every tracked item.
#[derive(Debug, Default)]
pub struct ProgressTable {
    items: HashMap<String, ProgressItem>,
    next_seq: u64,
}

impl ProgressTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&ProgressItem> {
        self.items.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Applies `event` to the record with the same id, inserting it when
    /// absent. Every field is replaced except `source`, which is sticky: an
    /// event without provenance keeps the stored one, and new records get
    /// one inferred from `classifier` when the event carries none.
    pub fn merge(
        &mut self,
        event: ProgressEvent,
        classifier: &SourceClassifier,
    ) -> (MergeKind, &ProgressItem) {
        let id = event.id.trim().to_string();
        let incoming_source = non_blank(event.source.as_deref()).map(str::to_string);
        let speed = sanitize_speed(event.speed);
        let now = chrono::Utc::now().timestamp();

        let kind = if self.items.contains_key(&id) {
            MergeKind::Replaced
        } else {
            MergeKind::Inserted
        };

        let (first_seen, source) = match self.items.get(&id) {
            Some(existing) => (
                existing.first_seen,
                incoming_source.or_else(|| existing.source.clone()),
            ),
            None => {
                self.next_seq += 1;
                let source =
                    incoming_source.or_else(|| classifier.classify(&event.name, &id));
                (self.next_seq, source)
            }
        };

        let item = ProgressItem {
            id: id.clone(),
            operation_id: non_blank(event.operation_id.as_deref()).map(str::to_string),
            owner_id: non_blank(event.owner_id.as_deref()).map(str::to_string),
            name: event.name,
            source,
            downloaded: event.downloaded,
            total: event.total,
            speed,
            status: event.status,
            updated_at: now,
            first_seen,
        };

        let stored = match self.items.entry(id) {
            Entry::Occupied(mut entry) => {
                entry.insert(item);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(item),
        };
        (kind, stored)
    }

    /// Forces a tracked item into the cancelled state; returns `false` if the
    /// item is unknown or already terminal.
    pub fn mark_cancelled(&mut self, id: &str) -> bool {
        match self.items.get_mut(id) {
            Some(item) if !item.status.is_terminal() => {
                item.status = ProgressStatus::Cancelled;
                item.speed = 0.0;
                item.updated_at = chrono::Utc::now().timestamp();
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<ProgressItem> {
        self.items.remove(id)
    }

    pub fn ids_for_operation(&self, operation_id: &str) -> Vec<String> {
        self.items
            .values()
            .filter(|item| item.operation_id.as_deref() == Some(operation_id))
            .map(|item| item.id.clone())
            .collect()
    }

    pub fn terminal_items(&self) -> Vec<(String, ProgressStatus)> {
        self.items
            .values()
            .filter(|item| item.is_terminal())
            .map(|item| (item.id.clone(), item.status.clone()))
            .collect()
    }

    /// Records in first-seen order.
    pub fn ordered(&self) -> Vec<ProgressItem> {
        let mut items: Vec<ProgressItem> = self.items.values().cloned().collect();
        items.sort_by_key(|item| item.first_seen);
        items
    }
}

fn sanitize_speed(speed: f64) -> f64 {
    if speed.is_finite() && speed > 0.0 {
        speed
    } else {
        0.0
    }
}
