use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle label reported by the engine for a single item.
///
/// The engine owns the label set; reconciliation only distinguishes the
/// terminal subset from everything else, so unknown labels are carried
/// through verbatim as [`ProgressStatus::Other`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProgressStatus {
    #[default]
    Pending,
    Queued,
    Active,
    Downloading,
    Paused,
    Verifying,
    Completed,
    Cancelled,
    Failed,
    Stalled,
    Other(String),
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Failed | Self::Stalled
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Stalled => "stalled",
            Self::Other(label) => label.as_str(),
        }
    }
}

impl From<&str> for ProgressStatus {
    fn from(value: &str) -> Self {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "" | "pending" => Self::Pending,
            "queued" => Self::Queued,
            "active" | "running" => Self::Active,
            "downloading" => Self::Downloading,
            "paused" => Self::Paused,
            "verifying" => Self::Verifying,
            "completed" | "complete" | "done" => Self::Completed,
            "cancelled" | "canceled" => Self::Cancelled,
            "failed" | "error" => Self::Failed,
            "stalled" => Self::Stalled,
            _ => Self::Other(normalized),
        }
    }
}

impl From<String> for ProgressStatus {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<ProgressStatus> for String {
    fn from(value: ProgressStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress update as delivered by the engine.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default, alias = "operation_id")]
    pub operation_id: Option<String>,
    #[serde(default, alias = "owner_id")]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "downloaded_bytes")]
    pub downloaded: u64,
    #[serde(default, alias = "total_bytes")]
    pub total: u64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub status: ProgressStatus,
    #[serde(default)]
    pub source: Option<String>,
}

impl ProgressEvent {
    pub fn new(id: impl Into<String>, status: ProgressStatus) -> Self {
        Self {
            id: id.into(),
            status,
            ..Self::default()
        }
    }

    pub fn with_operation(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_bytes(mut self, downloaded: u64, total: u64) -> Self {
        self.downloaded = downloaded;
        self.total = total;
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// `true` when the event lacks a usable identity.
    pub fn is_malformed(&self) -> bool {
        self.id.trim().is_empty()
    }
}

/// The reconciled record for one item, as held in the progress table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressItem {
    pub id: String,
    pub operation_id: Option<String>,
    pub owner_id: Option<String>,
    pub name: String,
    pub source: Option<String>,
    pub downloaded: u64,
    pub total: u64,
    pub speed: f64,
    pub status: ProgressStatus,
    pub updated_at: i64,
    #[serde(skip)]
    pub(crate) first_seen: u64,
}

impl ProgressItem {
    /// Cancellable unit this item belongs to; single-item operations are
    /// keyed by the item id.
    pub fn operation_key(&self) -> &str {
        non_blank(self.operation_id.as_deref()).unwrap_or(self.id.as_str())
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.total.saturating_sub(self.downloaded)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Inbound traffic from the external engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Progress(ProgressEvent),
    #[serde(rename = "cancelled", alias = "cancellation_notice")]
    CancellationNotice { id: String },
}

pub(crate) fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
