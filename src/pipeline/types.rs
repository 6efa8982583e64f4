//! Pipeline types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::gate::ApprovalDecision;
use crate::item::ItemId;
use crate::refiner::RefineOutcome;
use crate::workflow::WorkflowStage;

/// Administrative action applicable to many items at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkAction {
    Publish,
    Quarantine,
    Archive,
    ResetToUnprocessed,
    /// Drop scan and gate flags without touching the stage.
    ClearFlags,
    /// Run the full pipeline again.
    Rescan,
}

impl BulkAction {
    pub const ALL: [BulkAction; 6] = [
        Self::Publish,
        Self::Quarantine,
        Self::Archive,
        Self::ResetToUnprocessed,
        Self::ClearFlags,
        Self::Rescan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Quarantine => "quarantine",
            Self::Archive => "archive",
            Self::ResetToUnprocessed => "reset_to_unprocessed",
            Self::ClearFlags => "clear_flags",
            Self::Rescan => "rescan",
        }
    }

    /// The stage a stage-setting action moves items to.
    pub fn target_stage(&self) -> Option<WorkflowStage> {
        match self {
            Self::Publish => Some(WorkflowStage::Published),
            Self::Quarantine => Some(WorkflowStage::Quarantined),
            Self::Archive => Some(WorkflowStage::Archived),
            Self::ResetToUnprocessed => Some(WorkflowStage::Unprocessed),
            Self::ClearFlags | Self::Rescan => None,
        }
    }
}

impl fmt::Display for BulkAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BulkAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown bulk action: {s}"))
    }
}

/// Result of running one item through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub item_id: ItemId,
    pub refine: RefineOutcome,
    pub scan_pass: bool,
    pub scan_score: i32,
    pub decision: ApprovalDecision,
    /// Stage after the processing lock was released.
    pub stage: WorkflowStage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_action_names() {
        for action in BulkAction::ALL {
            assert_eq!(action.as_str().parse::<BulkAction>().unwrap(), action);
            assert_eq!(
                serde_json::to_value(action).unwrap(),
                serde_json::json!(action.as_str())
            );
        }
        assert!("delete".parse::<BulkAction>().is_err());
        assert_eq!(BulkAction::ClearFlags.target_stage(), None);
    }
}
