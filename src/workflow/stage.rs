use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::item::{Actor, ItemId, Visibility};

/// Canonical lifecycle stage of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    Unprocessed,
    Processing,
    PendingReview,
    Quarantined,
    Published,
    Archived,
}

impl WorkflowStage {
    pub const ALL: [WorkflowStage; 6] = [
        Self::Unprocessed,
        Self::Processing,
        Self::PendingReview,
        Self::Quarantined,
        Self::Published,
        Self::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::Processing => "processing",
            Self::PendingReview => "pending_review",
            Self::Quarantined => "quarantined",
            Self::Published => "published",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.as_str() == s)
    }

    /// Read a stored stage value. Missing or unknown data is `Unprocessed`.
    pub fn from_value(value: Option<&serde_json::Value>) -> Self {
        value
            .and_then(|v| v.as_str())
            .and_then(Self::parse)
            .unwrap_or(Self::Unprocessed)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::Value::String(self.as_str().to_string())
    }

    /// Coarse visibility written alongside the stage.
    pub fn visibility(&self) -> Visibility {
        match self {
            Self::Published => Visibility::Publish,
            Self::Archived => Visibility::Trash,
            _ => Visibility::Pending,
        }
    }

    /// Stages whose every entry is timestamped. `Unprocessed` is stamped
    /// only on first entry.
    pub fn stamps_every_entry(&self) -> bool {
        matches!(
            self,
            Self::PendingReview | Self::Published | Self::Archived
        )
    }

    /// Precedence when arbitrating deferred automated requests.
    pub fn automation_precedence(&self) -> u8 {
        match self {
            Self::Quarantined => 4,
            Self::Published => 3,
            Self::PendingReview => 2,
            Self::Unprocessed => 1,
            Self::Processing | Self::Archived => 0,
        }
    }

    /// Map a value from the old moderation-status key.
    pub fn from_legacy(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approved" | "published" | "live" | "auto_approved" => Some(Self::Published),
            "pending" | "pending_review" | "needs_review" | "in_review" | "review" => {
                Some(Self::PendingReview)
            }
            "flagged" | "quarantined" | "rejected" | "held" | "unsafe" => Some(Self::Quarantined),
            "archived" | "trashed" | "deleted" => Some(Self::Archived),
            "unprocessed" | "queued" => Some(Self::Unprocessed),
            _ => None,
        }
    }
}

impl fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown workflow stage: {s}"))
    }
}

/// A stage change requested by an automated component while the item was
/// locked for processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRequest {
    pub target: WorkflowStage,
    pub actor: Actor,
    pub note: Option<String>,
    pub requested_at: DateTime<Utc>,
}

/// One entry of an item's capped audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub actor: String,
    pub from: Option<WorkflowStage>,
    pub to: WorkflowStage,
    pub note: Option<String>,
}

/// A committed stage change, as seen by observers.
#[derive(Debug, Clone, PartialEq)]
pub struct StageChange {
    pub item_id: ItemId,
    /// `None` when the item had no canonical stage before.
    pub from: Option<WorkflowStage>,
    pub to: WorkflowStage,
    pub actor: Actor,
    /// Stage held before the processing lock, when leaving `processing`.
    pub before_lock: Option<WorkflowStage>,
}

impl StageChange {
    /// Entry into `published` from any other stage. A rescan that takes the
    /// lock on a published item and hands it back is not a publication.
    pub fn is_publication(&self) -> bool {
        self.to == WorkflowStage::Published
            && self.from != Some(WorkflowStage::Published)
            && self.before_lock != Some(WorkflowStage::Published)
    }
}

/// What happened to a requested transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "stage", rename_all = "snake_case")]
pub enum TransitionOutcome {
    Applied(WorkflowStage),
    /// Held until the processing lock is released.
    Deferred,
    /// Refused by arbitration; the item stays where it is.
    Rejected(WorkflowStage),
    Unchanged(WorkflowStage),
}
