//! Items under moderation and the attribute keys the pipeline writes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a submitted letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl ItemId {
    /// Item IDs are assigned by the store and always positive.
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ItemId {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

/// The only item kind the pipeline moderates.
pub const LETTER_KIND: &str = "letter";

/// Coarse visibility projected from the workflow stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Publish,
    Pending,
    Trash,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Pending => "pending",
            Self::Trash => "trash",
        }
    }

    /// Parse a stored visibility, accepting the legacy spellings.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "publish" | "published" | "public" => Some(Self::Publish),
            "pending" | "draft" => Some(Self::Pending),
            "trash" | "trashed" | "deleted" => Some(Self::Trash),
            _ => None,
        }
    }
}

/// A submitted letter as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub kind: String,
    pub body: String,
    pub visibility: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub fn is_letter(&self) -> bool {
        self.kind == LETTER_KIND
    }
}

/// Who asked for a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum Actor {
    /// A pipeline component (refiner, gate, batch runner, ...).
    Automation(String),
    /// A human reviewer or administrator. Admin writes are never arbitrated.
    Admin(String),
}

impl Actor {
    pub fn automation(name: impl Into<String>) -> Self {
        Self::Automation(name.into())
    }

    pub fn admin(name: impl Into<String>) -> Self {
        Self::Admin(name.into())
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin(_))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Automation(n) | Self::Admin(n) => n,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Automation(n) => write!(f, "automation:{n}"),
            Self::Admin(n) => write!(f, "admin:{n}"),
        }
    }
}

/// Loose boolean reading of a flag-like attribute value.
pub fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        serde_json::Value::String(s) => {
            matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
        }
        _ => false,
    }
}

/// Attribute keys written into an item's attribute map.
pub mod attr {
    // Workflow
    pub const STAGE: &str = "workflow_stage";
    pub const LEGACY_STAGE: &str = "moderation_status";
    pub const QUARANTINE_FLAG: &str = "quarantine_flag";
    pub const PROCESSING_LEASE: &str = "processing_lease";
    pub const PROCESSING_PREV_STAGE: &str = "processing_prev_stage";
    pub const DEFERRED_REQUESTS: &str = "deferred_stage_requests";
    pub const WORKFLOW_LOG: &str = "workflow_log";

    // Safety scanner
    pub const SCAN_PASS: &str = "scan_pass";
    pub const SCAN_FLAGS: &str = "scan_flags";
    pub const SCAN_SCORE: &str = "scan_score";
    pub const SCAN_THRESHOLD: &str = "scan_threshold";
    pub const SCAN_DETAILS: &str = "scan_details";
    pub const SCAN_CONTEXT: &str = "scan_context";
    pub const SCANNED_AT: &str = "scanned_at";

    // Auto-approval gate
    pub const APPROVAL_SCORE: &str = "approval_score";
    pub const APPROVED_AT: &str = "approved_at";
    pub const FLAG_REASON: &str = "flag_reason";
    pub const FLAGGED_AT: &str = "flagged_at";

    // Refiner
    pub const MANUAL_LOCK: &str = "manual_lock";
    pub const AUTOMATION_SNAPSHOT: &str = "automation_snapshot";
    pub const AUTOMATION_SNAPSHOT_AT: &str = "automation_snapshot_at";
    pub const PROCESSED_AT: &str = "processed_at";

    /// Stage-entry timestamp key for a stage name.
    pub fn stage_entered_at(stage: &str) -> String {
        format!("stage_{stage}_at")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_id_validity() {
        assert!(ItemId(1).is_valid());
        assert!(!ItemId(0).is_valid());
        assert!(!ItemId(-4).is_valid());
    }

    #[test]
    fn visibility_accepts_legacy_spellings() {
        assert_eq!(Visibility::parse("Published"), Some(Visibility::Publish));
        assert_eq!(Visibility::parse("trashed"), Some(Visibility::Trash));
        assert_eq!(Visibility::parse(" pending "), Some(Visibility::Pending));
        assert_eq!(Visibility::parse("future"), None);
    }

    #[test]
    fn truthy_values() {
        assert!(is_truthy(&serde_json::json!(true)));
        assert!(is_truthy(&serde_json::json!("Yes")));
        assert!(is_truthy(&serde_json::json!(1)));
        assert!(!is_truthy(&serde_json::json!("0")));
        assert!(!is_truthy(&serde_json::Value::Null));
    }

    #[test]
    fn actor_display() {
        assert_eq!(Actor::admin("maria").to_string(), "admin:maria");
        assert_eq!(Actor::automation("gate").to_string(), "automation:gate");
        assert!(Actor::admin("x").is_admin());
    }
}
