//! One-time stage inference for items written before canonical stages existed.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{info, warn};

use super::machine::Workflow;
use super::stage::WorkflowStage;
use crate::error::WorkflowError;
use crate::item::{Actor, LETTER_KIND, Visibility, attr, is_truthy};
use crate::store::ItemFilter;

/// Which legacy signal decided an inferred stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceSource {
    LegacyKey,
    Visibility,
    QuarantineFlag,
    Default,
}

/// Infer a starting stage from legacy data, in priority order: legacy key,
/// visibility, quarantine flag, then `pending_review`. Ambiguous content is
/// never routed back to `unprocessed`.
pub fn infer_legacy_stage(
    attrs: &HashMap<String, serde_json::Value>,
    visibility: Option<&str>,
) -> (WorkflowStage, InferenceSource) {
    if let Some(stage) = attrs
        .get(attr::LEGACY_STAGE)
        .and_then(|v| v.as_str())
        .and_then(WorkflowStage::from_legacy)
    {
        return (stage, InferenceSource::LegacyKey);
    }

    match visibility.and_then(Visibility::parse) {
        Some(Visibility::Publish) => return (WorkflowStage::Published, InferenceSource::Visibility),
        Some(Visibility::Trash) => return (WorkflowStage::Archived, InferenceSource::Visibility),
        Some(Visibility::Pending) => {
            return (WorkflowStage::PendingReview, InferenceSource::Visibility);
        }
        None => {}
    }

    if attrs.get(attr::QUARANTINE_FLAG).is_some_and(is_truthy) {
        return (WorkflowStage::Quarantined, InferenceSource::QuarantineFlag);
    }

    (WorkflowStage::PendingReview, InferenceSource::Default)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub migrated: usize,
    pub failed: usize,
}

impl Workflow {
    /// Give every letter lacking canonical stage data an inferred stage,
    /// `batch` items per query.
    pub async fn migrate_legacy(&self, batch: usize) -> Result<MigrationReport, WorkflowError> {
        let mut report = MigrationReport::default();
        let batch = batch.max(1);

        loop {
            // Migrated items drop out of the filter, so only failures advance the offset.
            let filter = ItemFilter {
                kind: Some(LETTER_KIND.to_string()),
                ..ItemFilter::page(batch, report.failed)
            }
            .lacking(attr::STAGE);
            let ids = self.db().list_items(&filter).await?;
            if ids.is_empty() {
                break;
            }

            for id in ids {
                match self.migrate_one(id).await {
                    Ok(()) => report.migrated += 1,
                    Err(e) => {
                        warn!(item_id = %id, "Legacy stage migration failed: {e}");
                        report.failed += 1;
                    }
                }
            }
        }

        if report.migrated > 0 || report.failed > 0 {
            info!(
                migrated = report.migrated,
                failed = report.failed,
                "Legacy stage migration finished"
            );
        }
        Ok(report)
    }

    async fn migrate_one(&self, id: crate::item::ItemId) -> Result<(), WorkflowError> {
        let item = self
            .db()
            .get_item(id)
            .await?
            .ok_or_else(|| WorkflowError::InvalidItem {
                id,
                reason: "vanished during migration".into(),
            })?;
        let attrs = self.db().get_attrs(id).await?;
        let (stage, source) = infer_legacy_stage(&attrs, item.visibility.as_deref());
        let note = format!("Stage inferred from legacy data ({source:?})");
        self.set_stage(id, stage, &Actor::automation("legacy-migration"), Some(&note))
            .await?;
        Ok(())
    }
}
