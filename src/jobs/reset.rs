//! Administrative "nuclear" reset of all learned and in-flight pipeline state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::runner::RUN_BULK_HOOK;
use super::token::{LEASE_PREFIX, TOKEN_PREFIX};
use crate::error::{DatabaseError, JobError};
use crate::item::{Actor, attr};
use crate::learning::PatternProvider;
use crate::store::{Database, JobScheduler, TtlCache};
use crate::workflow::Workflow;

/// Literal phrase an operator must type.
pub const RESET_CONFIRMATION: &str = "RESET LETTER GUARD";

const RESET_LOG_SETTING: &str = "nuclear_reset_log";
const RESET_LOG_CAP: usize = 50;

/// Per-item attributes holding automation state.
const AUTOMATION_ATTRS: [&str; 5] = [
    attr::PROCESSING_LEASE,
    attr::DEFERRED_REQUESTS,
    attr::PROCESSING_PREV_STAGE,
    attr::AUTOMATION_SNAPSHOT,
    attr::AUTOMATION_SNAPSHOT_AT,
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetReport {
    pub patterns_cleared: usize,
    pub tokens_cleared: usize,
    pub jobs_cancelled: usize,
    pub attributes_cleared: usize,
    pub locks_reset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetLogEntry {
    pub actor: Actor,
    pub at: DateTime<Utc>,
    pub cleared: ResetReport,
}

pub struct AdminReset {
    db: Arc<dyn Database>,
    cache: Arc<dyn TtlCache>,
    scheduler: Arc<dyn JobScheduler>,
    workflow: Arc<Workflow>,
    patterns: Arc<dyn PatternProvider>,
}

impl AdminReset {
    pub fn new(
        db: Arc<dyn Database>,
        cache: Arc<dyn TtlCache>,
        scheduler: Arc<dyn JobScheduler>,
        workflow: Arc<Workflow>,
        patterns: Arc<dyn PatternProvider>,
    ) -> Self {
        Self {
            db,
            cache,
            scheduler,
            workflow,
            patterns,
        }
    }

    /// Wipe learned patterns, bulk tokens, queued continuations, processing
    /// locks and automation snapshots. Only admins with the exact
    /// confirmation phrase may run it.
    pub async fn nuclear_reset(
        &self,
        actor: &Actor,
        confirmation: &str,
    ) -> Result<ResetReport, JobError> {
        if !actor.is_admin() {
            return Err(JobError::ResetRefused(format!("{actor} is not an administrator")));
        }
        if confirmation != RESET_CONFIRMATION {
            return Err(JobError::ResetRefused(format!(
                "confirmation must read '{RESET_CONFIRMATION}'"
            )));
        }

        let mut report = ResetReport {
            patterns_cleared: self.db.clear_patterns().await?,
            ..Default::default()
        };
        self.patterns.invalidate();

        for prefix in [TOKEN_PREFIX, LEASE_PREFIX] {
            for entry in self.cache.cache_keys(prefix).await? {
                if self.cache.cache_delete(&entry.key).await? && prefix == TOKEN_PREFIX {
                    report.tokens_cleared += 1;
                }
            }
        }
        report.jobs_cancelled = self.scheduler.cancel(RUN_BULK_HOOK, None).await?;

        // Locks go stale first so the reset returns those items to `unprocessed`.
        report.locks_reset = self.release_locks().await;
        for key in AUTOMATION_ATTRS {
            report.attributes_cleared += self.db.delete_attr_everywhere(key).await?;
        }

        self.append_log(actor, &report).await?;
        warn!(
            actor = %actor,
            patterns = report.patterns_cleared,
            tokens = report.tokens_cleared,
            jobs = report.jobs_cancelled,
            attributes = report.attributes_cleared,
            locks = report.locks_reset,
            "Nuclear reset executed"
        );
        Ok(report)
    }

    /// Force every `processing` item back to `unprocessed`.
    async fn release_locks(&self) -> usize {
        match self.db.delete_attr_everywhere(attr::PROCESSING_LEASE).await {
            Ok(_) => {}
            Err(e) => warn!("Failed to drop processing leases: {e}"),
        }
        // Without a lease every processing item reads as stale.
        match self.workflow.reset_stale_locks().await {
            Ok(n) => n,
            Err(e) => {
                warn!("Failed to reset processing locks: {e}");
                0
            }
        }
    }

    async fn append_log(&self, actor: &Actor, cleared: &ResetReport) -> Result<(), JobError> {
        let mut log = self.reset_log().await?;
        log.push(ResetLogEntry {
            actor: actor.clone(),
            at: Utc::now(),
            cleared: cleared.clone(),
        });
        if log.len() > RESET_LOG_CAP {
            log.drain(..log.len() - RESET_LOG_CAP);
        }
        let value = serde_json::to_value(&log)
            .map_err(|e| DatabaseError::Serialization(format!("{RESET_LOG_SETTING}: {e}")))?;
        self.db.set_setting(RESET_LOG_SETTING, &value).await?;
        info!(entries = log.len(), "Reset audit trail updated");
        Ok(())
    }

    /// Audit trail of past resets, oldest first.
    pub async fn reset_log(&self) -> Result<Vec<ResetLogEntry>, JobError> {
        let Some(raw) = self.db.get_setting(RESET_LOG_SETTING).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_value(raw) {
            Ok(log) => Ok(log),
            Err(e) => {
                warn!("Reset audit trail unreadable, starting fresh: {e}");
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::WorkflowConfig;
    use crate::item::LETTER_KIND;
    use crate::jobs::runner::continuation_args;
    use crate::learning::StaticPatternProvider;
    use crate::store::LibSqlBackend;
    use crate::workflow::WorkflowStage;

    async fn setup() -> (Arc<LibSqlBackend>, Arc<Workflow>, AdminReset) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let workflow = Arc::new(Workflow::new(db.clone(), WorkflowConfig::default()));
        let reset = AdminReset::new(
            db.clone(),
            db.clone(),
            db.clone(),
            workflow.clone(),
            Arc::new(StaticPatternProvider::default()),
        );
        (db, workflow, reset)
    }

    #[tokio::test]
    async fn refuses_without_exact_confirmation() {
        let (_db, _wf, reset) = setup().await;
        let admin = Actor::admin("root");
        assert!(matches!(
            reset.nuclear_reset(&admin, "reset letter guard").await,
            Err(JobError::ResetRefused(_))
        ));
        assert!(matches!(
            reset
                .nuclear_reset(&Actor::automation("cron"), RESET_CONFIRMATION)
                .await,
            Err(JobError::ResetRefused(_))
        ));
        assert!(reset.reset_log().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clears_everything_and_logs() {
        let (db, workflow, reset) = setup().await;
        let id = db.insert_item(LETTER_KIND, "Dear friend", None).await.unwrap();
        workflow.register_new(id).await.unwrap();
        workflow.mark_processing_started(id, "w1").await.unwrap();
        db.set_attr(id, attr::AUTOMATION_SNAPSHOT, &serde_json::json!("x"))
            .await
            .unwrap();
        db.record_pattern_failure("ignore_cap", "iPhone").await.unwrap();
        db.cache_set("bulk_token:t1", &serde_json::json!({}), Duration::from_secs(60))
            .await
            .unwrap();
        db.cache_set("bulk_lease:t1", &serde_json::json!({}), Duration::from_secs(60))
            .await
            .unwrap();
        db.schedule(RUN_BULK_HOOK, &continuation_args("t1", 0), Duration::ZERO)
            .await
            .unwrap();

        let admin = Actor::admin("root");
        let report = reset.nuclear_reset(&admin, RESET_CONFIRMATION).await.unwrap();
        assert_eq!(report.patterns_cleared, 1);
        assert_eq!(report.tokens_cleared, 1);
        assert_eq!(report.jobs_cancelled, 1);
        assert_eq!(report.locks_reset, 1);

        assert_eq!(workflow.get_stage(id).await.unwrap(), WorkflowStage::Unprocessed);
        assert!(db.get_attr(id, attr::AUTOMATION_SNAPSHOT).await.unwrap().is_none());
        assert!(db.list_patterns(None).await.unwrap().is_empty());
        assert!(db.cache_keys("bulk_").await.unwrap().is_empty());

        let log = reset.reset_log().await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].actor, admin);
        assert_eq!(log[0].cleared, report);
    }
}
