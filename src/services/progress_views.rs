use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::models::ProgressItem;

/// Counters describing what the tracker has done with its input.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerDiagnostics {
    pub upserts_applied: u64,
    pub late_events_dropped: u64,
    pub malformed_events_dropped: u64,
    pub notices_applied: u64,
    pub items_reaped: u64,
    pub pending_reaps: usize,
}

impl TrackerDiagnostics {
    /// Engine events consumed so far, whether applied or dropped.
    pub fn events_processed(&self) -> u64 {
        self.upserts_applied
            + self.late_events_dropped
            + self.malformed_events_dropped
            + self.notices_applied
    }
}

/// Immutable post-merge view of the tracker, published after every change.
#[derive(Clone, Debug, Default)]
pub struct ProgressSnapshot {
    items: Vec<ProgressItem>,
    pending_cancels: HashSet<String>,
    diagnostics: TrackerDiagnostics,
}

/// Records partitioned by owner; unowned records are kept apart.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerGroups {
    pub by_owner: BTreeMap<String, Vec<ProgressItem>>,
    pub unowned: Vec<ProgressItem>,
}

impl OwnerGroups {
    pub fn owner(&self, owner_id: &str) -> &[ProgressItem] {
        self.by_owner
            .get(owner_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl ProgressSnapshot {
    pub(crate) fn new(
        items: Vec<ProgressItem>,
        pending_cancels: HashSet<String>,
        diagnostics: TrackerDiagnostics,
    ) -> Self {
        Self {
            items,
            pending_cancels,
            diagnostics,
        }
    }

    /// Every tracked record, terminal ones included, in first-seen order.
    pub fn all_items(&self) -> &[ProgressItem] {
        &self.items
    }

    pub fn item(&self, id: &str) -> Option<&ProgressItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn items_for_operation(&self, operation_id: &str) -> Vec<ProgressItem> {
        self.items
            .iter()
            .filter(|item| item.operation_key() == operation_id)
            .cloned()
            .collect()
    }

    pub fn active_items(&self) -> Vec<ProgressItem> {
        self.active().cloned().collect()
    }

    pub fn grouped_by_owner(&self) -> OwnerGroups {
        let mut groups = OwnerGroups::default();
        for item in &self.items {
            match item.owner_id.as_deref() {
                Some(owner) => groups
                    .by_owner
                    .entry(owner.to_string())
                    .or_default()
                    .push(item.clone()),
                None => groups.unowned.push(item.clone()),
            }
        }
        groups
    }

    pub fn total_throughput(&self) -> f64 {
        self.active().map(|item| item.speed).sum()
    }

    /// Byte-weighted completion over active items; 100 when nothing is active.
    pub fn overall_completion_percent(&self) -> u8 {
        let mut downloaded: u128 = 0;
        let mut total: u128 = 0;
        let mut any_active = false;
        for item in self.active() {
            any_active = true;
            downloaded += u128::from(item.downloaded);
            total += u128::from(item.total);
        }
        if !any_active {
            return 100;
        }
        if total == 0 {
            return 0;
        }
        let percent = (downloaded as f64 / total as f64 * 100.0).round();
        percent.clamp(0.0, 100.0) as u8
    }

    /// Bytes still to fetch across active items with a known size.
    pub fn remaining_bytes(&self) -> u64 {
        self.active()
            .filter(|item| item.total > 0)
            .map(ProgressItem::remaining_bytes)
            .fold(0u64, u64::saturating_add)
    }

    pub fn estimated_seconds_remaining(&self) -> Option<u64> {
        let throughput = self.total_throughput();
        if throughput <= 0.0 {
            return None;
        }
        Some((self.remaining_bytes() as f64 / throughput).ceil() as u64)
    }

    pub fn is_cancelling(&self, operation_id: &str) -> bool {
        self.pending_cancels.contains(operation_id)
    }

    pub fn pending_cancels(&self) -> &HashSet<String> {
        &self.pending_cancels
    }

    pub fn diagnostics(&self) -> &TrackerDiagnostics {
        &self.diagnostics
    }

    fn active(&self) -> impl Iterator<Item = &ProgressItem> {
        self.items.iter().filter(|item| !item.is_terminal())
    }
}
