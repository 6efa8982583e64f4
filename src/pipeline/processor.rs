//! Moderation pipeline: drives one letter through refine, scan and gate.
//!
//! Flow for [`ModerationPipeline::process_item`]:
//! 1. Take the processing lock (stage becomes `processing`)
//! 2. Refine the body in place
//! 3. Safety scan, persisted into the attribute map
//! 4. Auto-approval gate
//! 5. Release the lock; the workflow applies the winning stage request

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, WorkflowError};
use crate::gate::{ApprovalDecision, AutoApprovalGate};
use crate::item::{Actor, ItemId, attr};
use crate::pipeline::types::{BulkAction, ProcessOutcome};
use crate::refiner::{RefineOutcome, Refiner};
use crate::safety::{SafetyScanner, ScanResult};
use crate::store::Database;
use crate::workflow::{Workflow, WorkflowStage};

/// Attributes dropped by [`BulkAction::ClearFlags`].
const FLAG_ATTRS: [&str; 10] = [
    attr::SCAN_PASS,
    attr::SCAN_FLAGS,
    attr::SCAN_SCORE,
    attr::SCAN_THRESHOLD,
    attr::SCAN_DETAILS,
    attr::SCAN_CONTEXT,
    attr::SCANNED_AT,
    attr::FLAG_REASON,
    attr::FLAGGED_AT,
    attr::QUARANTINE_FLAG,
];

pub struct ModerationPipeline {
    db: Arc<dyn Database>,
    workflow: Arc<Workflow>,
    scanner: SafetyScanner,
    gate: AutoApprovalGate,
    refiner: Refiner,
    worker_id: String,
}

impl ModerationPipeline {
    pub fn new(
        db: Arc<dyn Database>,
        workflow: Arc<Workflow>,
        scanner: SafetyScanner,
        gate: AutoApprovalGate,
        refiner: Refiner,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            db,
            workflow,
            scanner,
            gate,
            refiner,
            worker_id: worker_id.into(),
        }
    }

    pub fn workflow(&self) -> &Arc<Workflow> {
        &self.workflow
    }

    pub fn scanner(&self) -> &SafetyScanner {
        &self.scanner
    }

    pub fn gate(&self) -> &AutoApprovalGate {
        &self.gate
    }

    pub fn refiner(&self) -> &Refiner {
        &self.refiner
    }

    /// Run one letter through the full pipeline under the processing lock.
    pub async fn process_item(&self, id: ItemId) -> Result<ProcessOutcome, Error> {
        // One holder per run, so concurrent runs in this process exclude each other.
        let holder = format!("{}:{}", self.worker_id, Uuid::new_v4().simple());
        self.workflow.mark_processing_started(id, &holder).await?;

        let (refine, scan, decision) = match self.run_locked(id).await {
            Ok(done) => done,
            Err(e) => {
                // Half-processed: nothing requested so far may stick.
                match self
                    .workflow
                    .abandon_processing(id, &holder, &e.to_string())
                    .await
                {
                    Ok(stage) => warn!(item_id = %id, ?stage, "Processing failed, lock released: {e}"),
                    Err(release) => warn!(item_id = %id, "Processing failed and lock release failed: {release}"),
                }
                return Err(e);
            }
        };

        let released = self.workflow.clear_processing_lock(id, &holder).await;
        let stage = match released? {
            Some(stage) => stage,
            None => self.workflow.get_stage(id).await?,
        };

        info!(
            item_id = %id,
            stage = %stage,
            scan_pass = scan.pass,
            approval_score = decision.score,
            "Letter processed"
        );
        Ok(ProcessOutcome {
            item_id: id,
            refine,
            scan_pass: scan.pass,
            scan_score: scan.score,
            decision,
            stage,
        })
    }

    async fn run_locked(
        &self,
        id: ItemId,
    ) -> Result<(RefineOutcome, ScanResult, ApprovalDecision), Error> {
        let refine = self.refiner.refine(id, false).await?;
        if !refine.success {
            debug!(item_id = %id, message = %refine.message, "Refinement skipped");
        }

        let item = self
            .db
            .get_item(id)
            .await?
            .ok_or_else(|| WorkflowError::InvalidItem {
                id,
                reason: "vanished during processing".into(),
            })?;

        let scan = self.scanner.scan(&item.body);
        self.persist_scan(id, &scan).await?;

        let decision = self.gate.evaluate(id, &item.body).await?;
        Ok((refine, scan, decision))
    }

    /// Write the scan verdict into the attribute map.
    async fn persist_scan(&self, id: ItemId, scan: &ScanResult) -> Result<(), Error> {
        let values = [
            (attr::SCAN_PASS, json!(scan.pass)),
            (attr::SCAN_FLAGS, json!(scan.flag_names())),
            (attr::SCAN_SCORE, json!(scan.score)),
            (attr::SCAN_THRESHOLD, json!(scan.threshold_used)),
            (attr::SCAN_DETAILS, json!(scan.details)),
            (attr::SCAN_CONTEXT, json!(scan.context_summary)),
            (attr::SCANNED_AT, json!(Utc::now().to_rfc3339())),
        ];
        for (key, value) in values {
            self.db.set_attr(id, key, &value).await?;
        }
        Ok(())
    }

    /// Re-run a quarantined letter. Letters no longer quarantined are skipped.
    pub async fn resweep_quarantined(&self, id: ItemId) -> Result<Option<ProcessOutcome>, Error> {
        if self.workflow.get_stage(id).await? != WorkflowStage::Quarantined {
            debug!(item_id = %id, "Resweep skipped: not quarantined");
            return Ok(None);
        }
        self.process_item(id).await.map(Some)
    }

    /// Process a backlog letter only if it is still waiting.
    pub async fn process_if_unprocessed(&self, id: ItemId) -> Result<Option<ProcessOutcome>, Error> {
        if self.workflow.get_stage(id).await? != WorkflowStage::Unprocessed {
            return Ok(None);
        }
        self.process_item(id).await.map(Some)
    }

    /// Apply an administrative action. Returns the resulting stage.
    pub async fn apply_bulk_action(
        &self,
        id: ItemId,
        action: BulkAction,
        actor: &Actor,
    ) -> Result<WorkflowStage, Error> {
        match action {
            BulkAction::Rescan => return Ok(self.process_item(id).await?.stage),
            BulkAction::ClearFlags => {
                let mut cleared = 0;
                for key in FLAG_ATTRS {
                    if self.db.delete_attr(id, key).await? {
                        cleared += 1;
                    }
                }
                debug!(item_id = %id, cleared, "Flags cleared");
            }
            _ => {
                if let Some(target) = action.target_stage() {
                    let note = format!("Bulk action: {action}");
                    let outcome = self
                        .workflow
                        .request_transition(id, target, actor, Some(&note))
                        .await?;
                    debug!(item_id = %id, %action, ?outcome, "Bulk action applied");
                } else {
                    warn!(item_id = %id, %action, "Bulk action has no target stage");
                }
            }
        }
        Ok(self.workflow.get_stage(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::config::{GateConfig, ScannerConfig, WorkflowConfig};
    use crate::error::DatabaseError;
    use crate::item::{Item, LETTER_KIND};
    use crate::learning::NoopPatternProvider;
    use crate::notify::NoopNotifier;
    use crate::store::{DiffEvent, ItemFilter, LearnedPattern, LibSqlBackend, Revision};

    const KIND_LETTER: &str = "Dear stranger, I hope this letter finds you on a good day. You \
        matter more than you know, and the people around you are lucky to have you. Keep going, \
        be gentle with yourself, and remember that hard days pass.";

    const HOSTILE_LETTER: &str =
        "You're worthless and nobody will miss you if you jump off a bridge tonight.";

    async fn pipeline() -> (Arc<LibSqlBackend>, ModerationPipeline) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let workflow = Arc::new(Workflow::new(db.clone(), WorkflowConfig::default()));
        let gate = AutoApprovalGate::new(
            db.clone(),
            workflow.clone(),
            Arc::new(NoopNotifier),
            db.clone(),
            GateConfig::default(),
        );
        let refiner = Refiner::new(db.clone(), workflow.clone(), Arc::new(NoopPatternProvider));
        let pipeline = ModerationPipeline::new(
            db.clone(),
            workflow,
            SafetyScanner::new(&ScannerConfig::default()),
            gate,
            refiner,
            "test",
        );
        (db, pipeline)
    }

    /// Store whose scan-verdict writes fail; everything else is delegated.
    struct ScanWriteFails(Arc<LibSqlBackend>);

    #[async_trait]
    impl Database for ScanWriteFails {
        async fn run_migrations(&self) -> Result<(), DatabaseError> {
            self.0.run_migrations().await
        }
        async fn insert_item(
            &self,
            kind: &str,
            body: &str,
            visibility: Option<&str>,
        ) -> Result<ItemId, DatabaseError> {
            self.0.insert_item(kind, body, visibility).await
        }
        async fn get_item(&self, id: ItemId) -> Result<Option<Item>, DatabaseError> {
            self.0.get_item(id).await
        }
        async fn update_body(&self, id: ItemId, body: &str) -> Result<(), DatabaseError> {
            self.0.update_body(id, body).await
        }
        async fn set_visibility(&self, id: ItemId, visibility: &str) -> Result<(), DatabaseError> {
            self.0.set_visibility(id, visibility).await
        }
        async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<ItemId>, DatabaseError> {
            self.0.list_items(filter).await
        }
        async fn get_attr(
            &self,
            id: ItemId,
            key: &str,
        ) -> Result<Option<serde_json::Value>, DatabaseError> {
            self.0.get_attr(id, key).await
        }
        async fn set_attr(
            &self,
            id: ItemId,
            key: &str,
            value: &serde_json::Value,
        ) -> Result<(), DatabaseError> {
            if key == attr::SCAN_PASS {
                return Err(DatabaseError::Query("set_attr: disk full".into()));
            }
            self.0.set_attr(id, key, value).await
        }
        async fn delete_attr(&self, id: ItemId, key: &str) -> Result<bool, DatabaseError> {
            self.0.delete_attr(id, key).await
        }
        async fn get_attrs(
            &self,
            id: ItemId,
        ) -> Result<HashMap<String, serde_json::Value>, DatabaseError> {
            self.0.get_attrs(id).await
        }
        async fn compare_and_set_attr(
            &self,
            id: ItemId,
            key: &str,
            expected: Option<&serde_json::Value>,
            value: &serde_json::Value,
        ) -> Result<bool, DatabaseError> {
            self.0.compare_and_set_attr(id, key, expected, value).await
        }
        async fn delete_attr_everywhere(&self, key: &str) -> Result<usize, DatabaseError> {
            self.0.delete_attr_everywhere(key).await
        }
        async fn save_revision(&self, id: ItemId, body: &str) -> Result<i64, DatabaseError> {
            self.0.save_revision(id, body).await
        }
        async fn list_revisions(&self, id: ItemId) -> Result<Vec<Revision>, DatabaseError> {
            self.0.list_revisions(id).await
        }
        async fn delete_revision(&self, revision_id: i64) -> Result<(), DatabaseError> {
            self.0.delete_revision(revision_id).await
        }
        async fn record_pattern_failure(
            &self,
            pattern_type: &str,
            value: &str,
        ) -> Result<(), DatabaseError> {
            self.0.record_pattern_failure(pattern_type, value).await
        }
        async fn record_pattern_success(
            &self,
            pattern_type: &str,
            value: &str,
        ) -> Result<(), DatabaseError> {
            self.0.record_pattern_success(pattern_type, value).await
        }
        async fn list_patterns(
            &self,
            pattern_type: Option<&str>,
        ) -> Result<Vec<LearnedPattern>, DatabaseError> {
            self.0.list_patterns(pattern_type).await
        }
        async fn deactivate_exhausted_patterns(
            &self,
            min_samples: i64,
        ) -> Result<usize, DatabaseError> {
            self.0.deactivate_exhausted_patterns(min_samples).await
        }
        async fn clear_patterns(&self) -> Result<usize, DatabaseError> {
            self.0.clear_patterns().await
        }
        async fn record_diff(&self, event: &DiffEvent) -> Result<(), DatabaseError> {
            self.0.record_diff(event).await
        }
        async fn list_diffs(&self, id: ItemId) -> Result<Vec<DiffEvent>, DatabaseError> {
            self.0.list_diffs(id).await
        }
        async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError> {
            self.0.get_setting(key).await
        }
        async fn set_setting(
            &self,
            key: &str,
            value: &serde_json::Value,
        ) -> Result<(), DatabaseError> {
            self.0.set_setting(key, value).await
        }
    }

    async fn submit(db: &LibSqlBackend, pipeline: &ModerationPipeline, body: &str) -> ItemId {
        let id = db.insert_item(LETTER_KIND, body, None).await.unwrap();
        pipeline.workflow().register_new(id).await.unwrap();
        id
    }

    #[tokio::test]
    async fn kind_letter_is_published() {
        let (db, pipeline) = pipeline().await;
        let id = submit(&db, &pipeline, KIND_LETTER).await;

        let outcome = pipeline.process_item(id).await.unwrap();
        assert!(outcome.scan_pass);
        assert!(outcome.decision.safe);
        assert_eq!(outcome.stage, WorkflowStage::Published);

        let attrs = db.get_attrs(id).await.unwrap();
        assert_eq!(attrs[attr::SCAN_PASS], json!(true));
        assert!(attrs.contains_key(attr::SCANNED_AT));
        assert!(!attrs.contains_key(attr::PROCESSING_LEASE));
        assert_eq!(
            db.get_item(id).await.unwrap().unwrap().visibility.as_deref(),
            Some("publish")
        );
    }

    #[tokio::test]
    async fn failed_run_leaves_letter_retryable() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let workflow = Arc::new(Workflow::new(db.clone(), WorkflowConfig::default()));
        let gate = AutoApprovalGate::new(
            db.clone(),
            workflow.clone(),
            Arc::new(NoopNotifier),
            db.clone(),
            GateConfig::default(),
        );
        let refiner = Refiner::new(db.clone(), workflow.clone(), Arc::new(NoopPatternProvider));
        let pipeline = ModerationPipeline::new(
            Arc::new(ScanWriteFails(db.clone())),
            workflow,
            SafetyScanner::new(&ScannerConfig::default()),
            gate,
            refiner,
            "test",
        );
        let id = submit(&db, &pipeline, "you matter ,friend.keep going").await;

        assert!(pipeline.process_item(id).await.is_err());
        // The refiner asked for review before the scan failed; that request is void.
        assert_eq!(
            pipeline.workflow().get_stage(id).await.unwrap(),
            WorkflowStage::Unprocessed
        );
        let attrs = db.get_attrs(id).await.unwrap();
        assert!(!attrs.contains_key(attr::PROCESSING_LEASE));
        assert!(!attrs.contains_key(attr::DEFERRED_REQUESTS));
        let log = pipeline.workflow().audit_log(id).await.unwrap();
        assert!(log.last().unwrap().note.as_deref().unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn hostile_letter_is_quarantined() {
        let (db, pipeline) = pipeline().await;
        let id = submit(&db, &pipeline, HOSTILE_LETTER).await;

        let outcome = pipeline.process_item(id).await.unwrap();
        assert!(!outcome.scan_pass);
        assert!(!outcome.decision.safe);
        assert_eq!(outcome.stage, WorkflowStage::Quarantined);

        let flags = db.get_attr(id, attr::SCAN_FLAGS).await.unwrap().unwrap();
        let flags: Vec<String> = serde_json::from_value(flags).unwrap();
        assert!(flags.contains(&"encouragement_of_harm".to_string()));
        assert!(flags.contains(&"imminent_danger".to_string()));
    }

    #[tokio::test]
    async fn resweep_keeps_unsafe_letters_quarantined() {
        let (db, pipeline) = pipeline().await;
        let id = submit(&db, &pipeline, HOSTILE_LETTER).await;
        pipeline.process_item(id).await.unwrap();

        let again = pipeline.resweep_quarantined(id).await.unwrap().unwrap();
        assert_eq!(again.stage, WorkflowStage::Quarantined);

        let kind = submit(&db, &pipeline, KIND_LETTER).await;
        assert!(pipeline.resweep_quarantined(kind).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bulk_actions() {
        let (db, pipeline) = pipeline().await;
        let id = submit(&db, &pipeline, HOSTILE_LETTER).await;
        pipeline.process_item(id).await.unwrap();
        let admin = Actor::admin("moderator");

        assert_eq!(
            pipeline
                .apply_bulk_action(id, BulkAction::ClearFlags, &admin)
                .await
                .unwrap(),
            WorkflowStage::Quarantined
        );
        assert!(db.get_attr(id, attr::SCAN_FLAGS).await.unwrap().is_none());
        assert!(db.get_attr(id, attr::FLAG_REASON).await.unwrap().is_none());

        for (action, stage) in [
            (BulkAction::Publish, WorkflowStage::Published),
            (BulkAction::Archive, WorkflowStage::Archived),
            (BulkAction::ResetToUnprocessed, WorkflowStage::Unprocessed),
            (BulkAction::Quarantine, WorkflowStage::Quarantined),
        ] {
            assert_eq!(
                pipeline.apply_bulk_action(id, action, &admin).await.unwrap(),
                stage
            );
        }
    }

    #[tokio::test]
    async fn locked_items_are_not_processed_twice() {
        let (db, pipeline) = pipeline().await;
        let id = submit(&db, &pipeline, KIND_LETTER).await;
        pipeline
            .workflow()
            .mark_processing_started(id, "other-worker")
            .await
            .unwrap();
        assert!(matches!(
            pipeline.process_item(id).await,
            Err(Error::Workflow(WorkflowError::Locked { .. }))
        ));
    }
}
