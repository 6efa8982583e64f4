use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::pattern::{PatternKind, PatternStats, looks_like_proper_noun};
use super::provider::PatternProvider;
use crate::config::LearningConfig;
use crate::error::LearningError;
use crate::item::{ItemId, attr};
use crate::store::{Database, DiffEvent};
use crate::text::{MISSING_SPACE_AFTER_PUNCT, SPACE_BEFORE_PUNCT, WORD, plain, style_attributes};
use crate::workflow::{StageChange, StageObserver};

/// One difference between the automated snapshot and the human's text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Observation {
    pub kind: PatternKind,
    /// Value registered as the exception.
    pub value: String,
    pub before: String,
    pub after: String,
}

/// Diff the refiner's snapshot against the human-approved text.
pub fn compare(before: &str, after: &str) -> Vec<Observation> {
    let before_plain = plain(before);
    let after_plain = plain(after);
    let mut found = Vec::new();

    let bot_words = WORD.find_iter(&before_plain).map(|m| m.as_str());
    let human_words = WORD.find_iter(&after_plain).map(|m| m.as_str());
    for (bot, human) in bot_words.zip(human_words) {
        if bot == human || bot.to_lowercase() != human.to_lowercase() {
            continue;
        }
        found.push(Observation {
            kind: PatternKind::IgnoreCap,
            value: human.to_string(),
            before: bot.to_string(),
            after: human.to_string(),
        });
        if looks_like_proper_noun(human) {
            found.push(Observation {
                kind: PatternKind::ProperNoun,
                value: human.to_string(),
                before: bot.to_string(),
                after: human.to_string(),
            });
        }
    }

    let spacing = [
        (PatternKind::IgnorePunctSpaceBeforePunct, &*SPACE_BEFORE_PUNCT),
        (PatternKind::IgnorePunctMissingSpaceAfterPunct, &*MISSING_SPACE_AFTER_PUNCT),
    ];
    for (kind, regex) in spacing {
        if regex.is_match(&before_plain) {
            continue;
        }
        if let Some(m) = regex.find(&after_plain) {
            found.push(Observation {
                kind,
                value: m.as_str().to_string(),
                before: String::new(),
                after: m.as_str().to_string(),
            });
        }
    }

    if style_attributes(before).is_empty()
        && let Some(style) = style_attributes(after).into_iter().next()
    {
        found.push(Observation {
            kind: PatternKind::AllowHtmlStyle,
            value: style.clone(),
            before: String::new(),
            after: style,
        });
    }

    found
}

/// Adapts refinement from the corrections humans make before publishing.
pub struct LearningEngine {
    db: Arc<dyn Database>,
    provider: Arc<dyn PatternProvider>,
    config: LearningConfig,
}

impl LearningEngine {
    pub fn new(
        db: Arc<dyn Database>,
        provider: Arc<dyn PatternProvider>,
        config: LearningConfig,
    ) -> Self {
        Self {
            db,
            provider,
            config,
        }
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    pub(crate) fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn provider(&self) -> &Arc<dyn PatternProvider> {
        &self.provider
    }

    /// Register a failure for every exception the human's text reveals,
    /// then clear the item's snapshot. Returns the registered observations.
    pub async fn learn_from_comparison(
        &self,
        id: ItemId,
        before: &str,
        after: &str,
    ) -> Result<Vec<Observation>, LearningError> {
        let mut seen = BTreeSet::new();
        let mut registered = Vec::new();

        for obs in compare(before, after) {
            if !seen.insert((obs.kind, obs.value.clone())) {
                continue;
            }
            self.db
                .record_pattern_failure(obs.kind.as_str(), &obs.value)
                .await?;
            self.db
                .record_diff(&DiffEvent {
                    item_id: id,
                    change_type: obs.kind.as_str().to_string(),
                    before_value: obs.before.clone(),
                    after_value: obs.after.clone(),
                    created_at: Utc::now(),
                })
                .await?;
            debug!(item_id = %id, kind = %obs.kind, value = %obs.value, "Registered learned exception");
            registered.push(obs);
        }

        if !registered.is_empty() {
            self.provider.invalidate();
            info!(item_id = %id, patterns = registered.len(), "Learned from human edits");
        }

        self.db.delete_attr(id, attr::AUTOMATION_SNAPSHOT).await?;
        self.db.delete_attr(id, attr::AUTOMATION_SNAPSHOT_AT).await?;
        Ok(registered)
    }

    /// Learn from a freshly published item. `None` when it has no snapshot.
    pub async fn learn_on_publication(
        &self,
        id: ItemId,
    ) -> Result<Option<Vec<Observation>>, LearningError> {
        let snapshot = self.db.get_attr(id, attr::AUTOMATION_SNAPSHOT).await?;
        let Some(snapshot) = snapshot.as_ref().and_then(|v| v.as_str()) else {
            return Ok(None);
        };
        let Some(item) = self.db.get_item(id).await? else {
            return Ok(None);
        };
        self.learn_from_comparison(id, snapshot, &item.body)
            .await
            .map(Some)
    }

    /// Active values of one pattern kind.
    pub async fn get_patterns(&self, kind: PatternKind) -> Result<Vec<String>, LearningError> {
        Ok(self.provider.patterns().await?.values(kind).to_vec())
    }

    /// Every stored pattern with its smoothed confidence.
    pub async fn pattern_stats(&self) -> Result<Vec<PatternStats>, LearningError> {
        Ok(self
            .db
            .list_patterns(None)
            .await?
            .into_iter()
            .map(PatternStats::from)
            .collect())
    }
}

#[async_trait]
impl StageObserver for LearningEngine {
    async fn on_stage_change(&self, change: &StageChange) {
        if !change.is_publication() {
            return;
        }
        if let Err(e) = self.learn_on_publication(change.item_id).await {
            warn!(item_id = %change.item_id, "Learning after publication failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::WorkflowConfig;
    use crate::item::{Actor, LETTER_KIND};
    use crate::learning::CachedPatternProvider;
    use crate::store::LibSqlBackend;
    use crate::workflow::{Workflow, WorkflowStage};

    async fn engine() -> (Arc<LibSqlBackend>, Arc<LearningEngine>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let provider = Arc::new(CachedPatternProvider::new(db.clone(), Duration::from_secs(3600)));
        let engine = Arc::new(LearningEngine::new(
            db.clone(),
            provider,
            LearningConfig::default(),
        ));
        (db, engine)
    }

    fn kinds(obs: &[Observation]) -> Vec<(PatternKind, &str)> {
        obs.iter().map(|o| (o.kind, o.value.as_str())).collect()
    }

    #[test]
    fn capitalization_changes_register_both_kinds() {
        let obs = compare(
            "<p>Hello from Iphone land. Ebay is great.</p>",
            "<p>Hello from iPhone land. eBay is great.</p>",
        );
        assert_eq!(
            kinds(&obs),
            vec![
                (PatternKind::IgnoreCap, "iPhone"),
                (PatternKind::ProperNoun, "iPhone"),
                (PatternKind::IgnoreCap, "eBay"),
                (PatternKind::ProperNoun, "eBay"),
            ]
        );
    }

    #[test]
    fn lowercased_word_is_not_a_proper_noun() {
        let obs = compare("Grandma says hi.", "grandma says hi.");
        assert_eq!(kinds(&obs), vec![(PatternKind::IgnoreCap, "grandma")]);
    }

    #[test]
    fn punctuation_spacing_uses_first_human_match() {
        let obs = compare("Wait, what? I wrote Node. js apps", "Wait , what ? I wrote Node.js apps");
        assert_eq!(
            kinds(&obs),
            vec![
                (PatternKind::IgnorePunctSpaceBeforePunct, " ,"),
                (PatternKind::IgnorePunctMissingSpaceAfterPunct, ".j"),
            ]
        );
    }

    #[test]
    fn style_added_by_human_allows_html_style() {
        let obs = compare("<p>Hi there</p>", r#"<p style="text-align:center">Hi there</p>"#);
        assert_eq!(
            kinds(&obs),
            vec![(PatternKind::AllowHtmlStyle, r#"style="text-align:center""#)]
        );
        assert!(compare(r#"<p style="x">a</p>"#, r#"<p style="y">a</p>"#).is_empty());
    }

    #[test]
    fn inline_markup_alone_teaches_nothing() {
        assert!(
            compare(
                "<p>Thanks, friend. You matter.</p>",
                "<p><b>Thanks</b>, friend. You matter.</p>",
            )
            .is_empty()
        );
        assert!(
            compare(
                "<p>Keep going. You are loved.</p>",
                "<p>Keep <em>going</em>. You are <strong>loved</strong>.</p>",
            )
            .is_empty()
        );
    }

    #[tokio::test]
    async fn learning_registers_logs_invalidates_and_clears_snapshot() {
        let (db, engine) = engine().await;
        let id = db.insert_item(LETTER_KIND, "x", None).await.unwrap();
        db.set_attr(id, attr::AUTOMATION_SNAPSHOT, &serde_json::json!("x"))
            .await
            .unwrap();

        // Warm the cache before learning.
        assert!(engine.get_patterns(PatternKind::ProperNoun).await.unwrap().is_empty());

        let obs = engine
            .learn_from_comparison(id, "Iphone. Iphone.", "iPhone. iPhone.")
            .await
            .unwrap();
        assert_eq!(obs.len(), 2, "duplicates are registered once");

        assert_eq!(
            engine.get_patterns(PatternKind::ProperNoun).await.unwrap(),
            vec!["iPhone".to_string()]
        );
        assert_eq!(db.list_diffs(id).await.unwrap().len(), 2);
        assert!(db.get_attr(id, attr::AUTOMATION_SNAPSHOT).await.unwrap().is_none());

        let stats = engine.pattern_stats().await.unwrap();
        assert!(stats.iter().all(|s| (s.confidence - 1.0 / 3.0).abs() < 1e-9));
    }

    #[tokio::test]
    async fn snapshot_is_cleared_even_without_differences() {
        let (db, engine) = engine().await;
        let id = db.insert_item(LETTER_KIND, "Same text.", None).await.unwrap();
        db.set_attr(id, attr::AUTOMATION_SNAPSHOT, &serde_json::json!("Same text."))
            .await
            .unwrap();
        let obs = engine.learn_on_publication(id).await.unwrap();
        assert_eq!(obs, Some(vec![]));
        assert!(db.get_attr(id, attr::AUTOMATION_SNAPSHOT).await.unwrap().is_none());
        assert_eq!(engine.learn_on_publication(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn publication_triggers_learning_once() {
        let (db, engine) = engine().await;
        let workflow = Workflow::new(db.clone(), WorkflowConfig::default());
        workflow.register_observer(engine.clone());

        let id = db
            .insert_item(LETTER_KIND, "Dear friend, I love my iPhone.", None)
            .await
            .unwrap();
        db.set_attr(
            id,
            attr::AUTOMATION_SNAPSHOT,
            &serde_json::json!("Dear friend, I love my Iphone."),
        )
        .await
        .unwrap();

        let reviewer = Actor::admin("reviewer");
        workflow
            .set_stage(id, WorkflowStage::PendingReview, &reviewer, None)
            .await
            .unwrap();
        assert!(db.list_diffs(id).await.unwrap().is_empty());

        workflow
            .set_stage(id, WorkflowStage::Published, &reviewer, None)
            .await
            .unwrap();
        assert_eq!(db.list_diffs(id).await.unwrap().len(), 2);
        assert!(db.get_attr(id, attr::AUTOMATION_SNAPSHOT).await.unwrap().is_none());
    }
}
