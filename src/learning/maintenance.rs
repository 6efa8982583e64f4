//! Daily learning upkeep.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::info;

use super::engine::LearningEngine;
use crate::error::LearningError;
use crate::item::{LETTER_KIND, attr};
use crate::store::ItemFilter;
use crate::workflow::WorkflowStage;

const PAGE: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub patterns_deactivated: usize,
    pub snapshots_removed: usize,
}

impl LearningEngine {
    /// Deactivate exhausted patterns, drop stale snapshots on unpublished
    /// items and invalidate the pattern cache.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, LearningError> {
        let patterns_deactivated = self
            .db()
            .deactivate_exhausted_patterns(self.config().min_samples_for_deactivation)
            .await?;

        let retention = TimeDelta::from_std(self.config().snapshot_retention)
            .unwrap_or(TimeDelta::days(30));
        let cutoff = Utc::now() - retention;
        let mut snapshots_removed = 0;
        let mut kept = 0;

        loop {
            let filter = ItemFilter {
                kind: Some(LETTER_KIND.to_string()),
                ..ItemFilter::page(PAGE, kept)
            }
            .having(attr::AUTOMATION_SNAPSHOT);
            let ids = self.db().list_items(&filter).await?;
            if ids.is_empty() {
                break;
            }

            for id in ids {
                let attrs = self.db().get_attrs(id).await?;
                let published =
                    WorkflowStage::from_value(attrs.get(attr::STAGE)) == WorkflowStage::Published;
                let taken_at = attrs
                    .get(attr::AUTOMATION_SNAPSHOT_AT)
                    .and_then(|v| v.as_str())
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|d| d.with_timezone(&Utc));
                // Undated snapshots cannot be aged and count as stale.
                let stale = taken_at.is_none_or(|at| at < cutoff);

                if published || !stale {
                    kept += 1;
                    continue;
                }
                self.db().delete_attr(id, attr::AUTOMATION_SNAPSHOT).await?;
                self.db().delete_attr(id, attr::AUTOMATION_SNAPSHOT_AT).await?;
                snapshots_removed += 1;
            }
        }

        self.provider().invalidate();
        info!(
            patterns_deactivated,
            snapshots_removed, "Learning maintenance finished"
        );
        Ok(MaintenanceReport {
            patterns_deactivated,
            snapshots_removed,
        })
    }
}
