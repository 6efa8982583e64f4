use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::html::clean_html;
use super::normalize::normalize;
use super::structure::apply_structure;
use crate::error::RefineError;
use crate::item::{Actor, ItemId, attr, is_truthy};
use crate::learning::{PatternKind, PatternProvider, PatternSet};
use crate::store::Database;
use crate::workflow::{Workflow, WorkflowStage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefineOutcome {
    pub success: bool,
    pub message: String,
    /// Whether the body was rewritten.
    pub changed: bool,
}

impl RefineOutcome {
    fn refused(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            changed: false,
        }
    }
}

/// Run the full transform over one text.
pub fn refine_text(text: &str, patterns: &PatternSet) -> String {
    let cleaned = if patterns.is_active(PatternKind::AllowHtmlStyle) {
        text.to_string()
    } else {
        clean_html(text)
    };
    apply_structure(&normalize(&cleaned, patterns))
}

pub struct Refiner {
    db: Arc<dyn Database>,
    workflow: Arc<Workflow>,
    patterns: Arc<dyn PatternProvider>,
}

impl Refiner {
    pub fn new(
        db: Arc<dyn Database>,
        workflow: Arc<Workflow>,
        patterns: Arc<dyn PatternProvider>,
    ) -> Self {
        Self {
            db,
            workflow,
            patterns,
        }
    }

    /// Refine a letter in place. A manual lock is honoured unless `force`.
    pub async fn refine(&self, id: ItemId, force: bool) -> Result<RefineOutcome, RefineError> {
        let Some(item) = self.db.get_item(id).await? else {
            return Ok(RefineOutcome::refused("Item not found"));
        };
        if !item.is_letter() {
            return Ok(RefineOutcome::refused(format!(
                "Items of kind '{}' are not refined",
                item.kind
            )));
        }
        let locked = self
            .db
            .get_attr(id, attr::MANUAL_LOCK)
            .await?
            .is_some_and(|v| is_truthy(&v));
        if locked && !force {
            debug!(item_id = %id, "Refine skipped: manual lock");
            return Ok(RefineOutcome::refused("Manual lock is set; use force to override"));
        }

        let patterns = match self.patterns.patterns().await {
            Ok(set) => set,
            Err(e) => {
                warn!(item_id = %id, "Learned patterns unavailable, refining with defaults: {e}");
                Arc::default()
            }
        };

        let refined = refine_text(&item.body, &patterns);
        let changed = refined != item.body;
        let stage = self.workflow.get_stage(id).await?;
        // Never demote a published letter.
        let target = if stage == WorkflowStage::Published {
            WorkflowStage::Published
        } else {
            WorkflowStage::PendingReview
        };

        if changed {
            self.db.save_revision(id, &item.body).await?;
            self.db.update_body(id, &refined).await?;
        }

        if changed || target != stage {
            let now = serde_json::json!(Utc::now().to_rfc3339());
            self.db
                .set_attr(id, attr::AUTOMATION_SNAPSHOT, &serde_json::json!(refined))
                .await?;
            self.db.set_attr(id, attr::AUTOMATION_SNAPSHOT_AT, &now).await?;
            self.db.set_attr(id, attr::PROCESSED_AT, &now).await?;
            if target != stage {
                let outcome = self
                    .workflow
                    .request_transition(id, target, &Actor::automation("refiner"), Some("Refined"))
                    .await?;
                debug!(item_id = %id, ?outcome, "Refiner stage request");
            }
        }

        if changed {
            info!(item_id = %id, "Letter refined");
        }
        Ok(RefineOutcome {
            success: true,
            message: if changed { "Refined" } else { "No changes" }.to_string(),
            changed,
        })
    }

    /// Restore the most recent revision. Returns `false` when there is none.
    pub async fn revert(&self, id: ItemId) -> Result<bool, RefineError> {
        if self.db.get_item(id).await?.is_none() {
            return Err(RefineError::NotFound(id));
        }
        let Some(latest) = self.db.list_revisions(id).await?.into_iter().next() else {
            return Ok(false);
        };
        self.db.update_body(id, &latest.body).await?;
        self.db.delete_revision(latest.id).await?;
        for key in [
            attr::AUTOMATION_SNAPSHOT,
            attr::AUTOMATION_SNAPSHOT_AT,
            attr::PROCESSED_AT,
        ] {
            self.db.delete_attr(id, key).await?;
        }
        info!(item_id = %id, revision = latest.id, "Letter reverted");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowConfig;
    use crate::item::LETTER_KIND;
    use crate::learning::StaticPatternProvider;
    use crate::store::LibSqlBackend;

    const RAW: &str = "you matter ,friend.keep  going!\n\n<span style=\"color:red\">stay</span> strong";

    struct Harness {
        db: Arc<LibSqlBackend>,
        workflow: Arc<Workflow>,
        patterns: Arc<StaticPatternProvider>,
        refiner: Refiner,
    }

    async fn harness() -> Harness {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let workflow = Arc::new(Workflow::new(db.clone(), WorkflowConfig::default()));
        let patterns = Arc::new(StaticPatternProvider::default());
        let refiner = Refiner::new(db.clone(), workflow.clone(), patterns.clone());
        Harness {
            db,
            workflow,
            patterns,
            refiner,
        }
    }

    #[test]
    fn full_transform() {
        assert_eq!(
            refine_text(RAW, &PatternSet::default()),
            "<p>Dear Friend,</p>\n<p>You matter, friend. Keep going!</p>\n<p><span>Stay</span> strong</p>"
        );
    }

    #[test]
    fn allow_html_style_skips_cleanup() {
        let mut set = PatternSet::default();
        set.insert(PatternKind::AllowHtmlStyle, "style=\"color:red\"");
        assert!(refine_text(RAW, &set).contains("style=\"color:red\""));
    }

    #[tokio::test]
    async fn refine_is_idempotent_and_routes_to_pending() {
        let h = harness().await;
        let id = h.db.insert_item(LETTER_KIND, RAW, None).await.unwrap();
        h.workflow.register_new(id).await.unwrap();

        let first = h.refiner.refine(id, false).await.unwrap();
        assert!(first.success && first.changed);
        assert_eq!(h.workflow.get_stage(id).await.unwrap(), WorkflowStage::PendingReview);
        let body = h.db.get_item(id).await.unwrap().unwrap().body;
        let attrs = h.db.get_attrs(id).await.unwrap();
        assert_eq!(attrs[attr::AUTOMATION_SNAPSHOT], serde_json::json!(body));
        assert!(attrs.contains_key(attr::PROCESSED_AT));

        let second = h.refiner.refine(id, false).await.unwrap();
        assert_eq!(second.message, "No changes");
        assert!(!second.changed);
        assert_eq!(h.db.get_item(id).await.unwrap().unwrap().body, body);
        assert_eq!(h.db.list_revisions(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn published_letters_stay_published() {
        let h = harness().await;
        let id = h.db.insert_item(LETTER_KIND, RAW, None).await.unwrap();
        h.workflow
            .set_stage(id, WorkflowStage::Published, &Actor::admin("r"), None)
            .await
            .unwrap();
        h.refiner.refine(id, false).await.unwrap();
        assert_eq!(h.workflow.get_stage(id).await.unwrap(), WorkflowStage::Published);
    }

    #[tokio::test]
    async fn revert_restores_original_bytes() {
        let h = harness().await;
        let id = h.db.insert_item(LETTER_KIND, RAW, None).await.unwrap();
        assert!(!h.refiner.revert(id).await.unwrap());

        h.refiner.refine(id, false).await.unwrap();
        assert!(h.refiner.revert(id).await.unwrap());
        assert_eq!(h.db.get_item(id).await.unwrap().unwrap().body, RAW);
        let attrs = h.db.get_attrs(id).await.unwrap();
        assert!(!attrs.contains_key(attr::AUTOMATION_SNAPSHOT));
        assert!(!attrs.contains_key(attr::PROCESSED_AT));
        assert!(h.db.list_revisions(id).await.unwrap().is_empty());

        assert!(matches!(
            h.refiner.revert(ItemId(9999)).await,
            Err(RefineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn manual_lock_requires_force() {
        let h = harness().await;
        let id = h.db.insert_item(LETTER_KIND, RAW, None).await.unwrap();
        h.db.set_attr(id, attr::MANUAL_LOCK, &serde_json::json!(true))
            .await
            .unwrap();

        let refused = h.refiner.refine(id, false).await.unwrap();
        assert!(!refused.success);
        assert_eq!(h.db.get_item(id).await.unwrap().unwrap().body, RAW);

        assert!(h.refiner.refine(id, true).await.unwrap().success);
        assert!(!h.refiner.refine(ItemId(424242), false).await.unwrap().success);
    }

    #[tokio::test]
    async fn learned_casing_applies_on_next_run() {
        let h = harness().await;
        let id = h
            .db
            .insert_item(LETTER_KIND, "Hi there. iphone users unite.", None)
            .await
            .unwrap();
        let mut set = PatternSet::default();
        set.insert(PatternKind::ProperNoun, "iPhone");
        h.patterns.replace(set);
        h.refiner.refine(id, false).await.unwrap();
        assert_eq!(
            h.db.get_item(id).await.unwrap().unwrap().body,
            "<p>Hi there. iPhone users unite.</p>"
        );
    }
}
