//! Auto-approval gate: heuristic scoring that routes a letter to
//! publication or quarantine.

use std::sync::{Arc, LazyLock};

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::GateConfig;
use crate::error::WorkflowError;
use crate::item::{Actor, ItemId, attr};
use crate::notify::Notifier;
use crate::store::{Database, DecisionLog, DecisionRecord};
use crate::text::strip_tags;
use crate::workflow::{Workflow, WorkflowStage};

static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:https?://|www\.)\S+").expect("valid regex"));

static PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+?\d{1,3}[\s.-]?)?(?:\(\d{3}\)|\b\d{3})[\s.-]?\d{3}[\s.-]?\d{4}\b")
        .expect("valid regex")
});

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").expect("valid regex")
});

static DANGEROUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:suicide|suicidal|kill\s+(?:yourself|myself)|end\s+(?:your|my)\s+life|overdos\w*|self[- ]harm|hang\s+(?:yourself|myself)|jump\s+off)\b",
    )
    .expect("valid regex")
});

static IMMEDIACY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:tonight|today|now|immediately|soon|this\s+(?:week|weekend|evening|morning))\b",
    )
    .expect("valid regex")
});

static SPAM_PHRASES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bbuy\s+now\b",
        r"(?i)\bclick\s+here\b",
        r"(?i)\bfree\s+money\b",
        r"(?i)\bact\s+now\b",
        r"(?i)\blimited\s+time\b",
        r"(?i)\b100%\s+free\b",
        r"(?i)\bearn\s+\$\d+",
        r"(?i)\bmake\s+money\s+fast\b",
        r"(?i)\b(?:casino|viagra|crypto\s+giveaway)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

const MIN_WORDS: usize = 20;
const MAX_WORDS: usize = 2000;
const MAX_URLS: usize = 2;
const MAX_CAPS_RATIO: f64 = 0.3;

/// Outcome of the gate for one letter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub safe: bool,
    pub score: i32,
    pub reason: String,
}

/// Result of the pure heuristic checks.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub score: i32,
    pub reasons: Vec<String>,
    /// Dangerous content is an absolute veto.
    pub dangerous: bool,
}

/// Score a text. `previously_flagged` is the independent scanner verdict.
pub fn assess(text: &str, previously_flagged: bool) -> Assessment {
    let plain = strip_tags(text);
    let mut score: i32 = 100;
    let mut reasons = Vec::new();

    let words = plain.split_whitespace().count();
    if words < MIN_WORDS {
        score -= 30;
        reasons.push(format!("Too short ({words} words)"));
    } else if words > MAX_WORDS {
        score -= 20;
        reasons.push(format!("Too long ({words} words)"));
    }

    let urls = URL.find_iter(&plain).count();
    if urls > MAX_URLS {
        score -= 40;
        reasons.push(format!("Contains {urls} URLs"));
    }
    if PHONE.is_match(&plain) {
        score -= 35;
        reasons.push("Contains a phone number".into());
    }
    if EMAIL.is_match(&plain) {
        score -= 35;
        reasons.push("Contains an email address".into());
    }

    let dangerous = DANGEROUS.is_match(&plain) && IMMEDIACY.is_match(&plain);
    if dangerous {
        score = 0;
        reasons.push("Dangerous content with immediacy".into());
    }

    if SPAM_PHRASES.iter().any(|re| re.is_match(&plain)) {
        score -= 50;
        reasons.push("Contains spam phrases".into());
    }

    let letters = plain.chars().filter(|c| c.is_alphabetic()).count();
    if letters > 0 {
        let caps = plain.chars().filter(|c| c.is_uppercase()).count();
        let ratio = caps as f64 / letters as f64;
        if ratio > MAX_CAPS_RATIO {
            score -= 25;
            reasons.push(format!("Excessive capitals ({:.0}%)", ratio * 100.0));
        }
    }

    if previously_flagged {
        score -= 50;
        reasons.push("Flagged by safety scan".into());
    }

    Assessment {
        score: score.clamp(0, 100),
        reasons,
        dangerous,
    }
}

/// Whether the stored scan verdict flagged the item.
fn scan_flagged(attrs: &std::collections::HashMap<String, serde_json::Value>) -> bool {
    let failed = attrs
        .get(attr::SCAN_PASS)
        .and_then(|v| v.as_bool())
        .is_some_and(|pass| !pass);
    let has_flags = attrs
        .get(attr::SCAN_FLAGS)
        .and_then(|v| v.as_array())
        .is_some_and(|flags| !flags.is_empty());
    failed || has_flags
}

pub struct AutoApprovalGate {
    db: Arc<dyn Database>,
    workflow: Arc<Workflow>,
    notifier: Arc<dyn Notifier>,
    decisions: Arc<dyn DecisionLog>,
    config: GateConfig,
}

impl AutoApprovalGate {
    pub fn new(
        db: Arc<dyn Database>,
        workflow: Arc<Workflow>,
        notifier: Arc<dyn Notifier>,
        decisions: Arc<dyn DecisionLog>,
        config: GateConfig,
    ) -> Self {
        Self {
            db,
            workflow,
            notifier,
            decisions,
            config,
        }
    }

    /// Decide without side effects.
    pub fn decide(&self, text: &str, previously_flagged: bool) -> ApprovalDecision {
        let assessment = assess(text, previously_flagged);
        let safe = assessment.score >= self.config.min_score && !assessment.dangerous;
        let reason = if assessment.reasons.is_empty() {
            "Passed all checks".to_string()
        } else {
            assessment.reasons.join("; ")
        };
        ApprovalDecision {
            safe,
            score: assessment.score,
            reason,
        }
    }

    /// Score the letter and request publication or quarantine.
    pub async fn evaluate(&self, id: ItemId, text: &str) -> Result<ApprovalDecision, WorkflowError> {
        let attrs = self.db.get_attrs(id).await?;
        let decision = self.decide(text, scan_flagged(&attrs));
        let now = Utc::now();
        let actor = Actor::automation("auto-approval");

        self.db
            .set_attr(id, attr::APPROVAL_SCORE, &serde_json::json!(decision.score))
            .await?;

        if decision.safe {
            self.db
                .set_attr(id, attr::APPROVED_AT, &serde_json::json!(now.to_rfc3339()))
                .await?;
            self.db.delete_attr(id, attr::FLAG_REASON).await?;
            let note = format!("Auto-approved (score {})", decision.score);
            self.workflow
                .request_transition(id, WorkflowStage::Published, &actor, Some(&note))
                .await?;
            info!(item_id = %id, score = decision.score, "Letter auto-approved");
        } else {
            self.db
                .set_attr(id, attr::FLAG_REASON, &serde_json::json!(decision.reason))
                .await?;
            self.db
                .set_attr(id, attr::FLAGGED_AT, &serde_json::json!(now.to_rfc3339()))
                .await?;
            let note = format!("Quarantined (score {}): {}", decision.score, decision.reason);
            self.workflow
                .request_transition(id, WorkflowStage::Quarantined, &actor, Some(&note))
                .await?;
            self.notifier
                .notify_quarantine(id, &decision.reason, decision.score)
                .await;
            info!(item_id = %id, score = decision.score, reason = %decision.reason, "Letter quarantined");
        }

        let record = DecisionRecord {
            item_id: id,
            safe: decision.safe,
            score: decision.score,
            reason: decision.reason.clone(),
            decided_at: now,
        };
        if let Err(e) = self.decisions.record_decision(&record).await {
            warn!(item_id = %id, "Failed to record approval decision: {e}");
        }

        Ok(decision)
    }
}
