//! End-to-end tests for the moderation pipeline.
//!
//! Each test wires the real components over an in-memory libSQL store:
//! backlog → dispatcher → batches → stages → human publish → learning →
//! the next refine run.

use std::sync::Arc;
use std::time::Duration;

use letter_guard::config::{
    BatchConfig, GateConfig, LearningConfig, ScannerConfig, WorkflowConfig,
};
use letter_guard::gate::AutoApprovalGate;
use letter_guard::item::{Actor, ItemId, LETTER_KIND, attr};
use letter_guard::jobs::{BatchRunner, BulkJobToken, JobDispatcher, JobKind};
use letter_guard::learning::{CachedPatternProvider, LearningEngine, PatternKind};
use letter_guard::notify::LogNotifier;
use letter_guard::pipeline::{BulkAction, ModerationPipeline};
use letter_guard::refiner::Refiner;
use letter_guard::safety::SafetyScanner;
use letter_guard::store::{Database, DecisionLog, LibSqlBackend};
use letter_guard::workflow::{Workflow, WorkflowStage};

const KIND_LETTER: &str = "Dear stranger, I hope this letter finds you on a good day. You matter \
    more than you know, and the people around you are lucky to have you. Keep going, be gentle \
    with yourself, and remember that hard days pass.";

/// Short and carries a phone number: the gate holds it back.
const CONTACT_LETTER: &str = "hello friend. My iphone number is 555-123-4567, call me anytime.";

const HOSTILE_LETTER: &str =
    "You're worthless and nobody will miss you if you jump off a bridge tonight.";

struct Stack {
    db: Arc<LibSqlBackend>,
    workflow: Arc<Workflow>,
    learning: Arc<LearningEngine>,
    pipeline: Arc<ModerationPipeline>,
    runner: Arc<BatchRunner>,
    dispatcher: JobDispatcher,
}

async fn stack() -> Stack {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let workflow = Arc::new(Workflow::new(db.clone(), WorkflowConfig::default()));
    let patterns = Arc::new(CachedPatternProvider::new(
        db.clone(),
        Duration::from_secs(3600),
    ));
    let learning = Arc::new(LearningEngine::new(
        db.clone(),
        patterns.clone(),
        LearningConfig::default(),
    ));
    workflow.register_observer(learning.clone());

    let gate = AutoApprovalGate::new(
        db.clone(),
        workflow.clone(),
        Arc::new(LogNotifier),
        db.clone(),
        GateConfig::default(),
    );
    let refiner = Refiner::new(db.clone(), workflow.clone(), patterns);
    let pipeline = Arc::new(ModerationPipeline::new(
        db.clone(),
        workflow.clone(),
        SafetyScanner::new(&ScannerConfig::default()),
        gate,
        refiner,
        "it",
    ));
    let runner = Arc::new(BatchRunner::new(
        db.clone(),
        db.clone(),
        db.clone(),
        pipeline.clone(),
        BatchConfig {
            continuation_delay: Duration::ZERO,
            continuation_jitter: Duration::ZERO,
            ..Default::default()
        },
    ));
    let dispatcher = JobDispatcher::new(db.clone(), runner.clone());
    Stack {
        db,
        workflow,
        learning,
        pipeline,
        runner,
        dispatcher,
    }
}

async fn submit(s: &Stack, body: &str) -> ItemId {
    let id = s.db.insert_item(LETTER_KIND, body, None).await.unwrap();
    s.workflow.register_new(id).await.unwrap();
    id
}

/// Run the dispatcher until nothing is due.
async fn drain(s: &Stack) -> usize {
    let mut ticks = 0;
    while s.dispatcher.run_due().await > 0 {
        ticks += 1;
        assert!(ticks < 100, "dispatcher never went idle");
    }
    ticks
}

#[tokio::test]
async fn backlog_to_learning_round_trip() {
    let s = stack().await;
    let kind = submit(&s, KIND_LETTER).await;
    let contact = submit(&s, CONTACT_LETTER).await;
    let hostile = submit(&s, HOSTILE_LETTER).await;

    let tokens = s.runner.enqueue_backlog().await.unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(drain(&s).await, 1);

    assert_eq!(s.workflow.get_stage(kind).await.unwrap(), WorkflowStage::Published);
    assert_eq!(s.workflow.get_stage(contact).await.unwrap(), WorkflowStage::Quarantined);
    assert_eq!(s.workflow.get_stage(hostile).await.unwrap(), WorkflowStage::Quarantined);
    assert_eq!(s.db.list_decisions(kind).await.unwrap().len(), 1);

    // Automation published `kind` itself: its snapshot was consumed with nothing learned.
    assert!(s.db.get_attr(kind, attr::AUTOMATION_SNAPSHOT).await.unwrap().is_none());
    assert!(s.learning.pattern_stats().await.unwrap().is_empty());

    // A moderator undoes two capitalizations, then publishes.
    let refined = s.db.get_item(contact).await.unwrap().unwrap().body;
    assert_eq!(
        refined,
        "<p>Hello friend. My iphone number is 555-123-4567, call me anytime.</p>"
    );
    let human = "<p>hello friend. My iPhone number is 555-123-4567, call me anytime.</p>";
    s.db.update_body(contact, human).await.unwrap();
    s.workflow
        .set_stage(contact, WorkflowStage::Published, &Actor::admin("mod"), Some("ok"))
        .await
        .unwrap();

    assert!(s.db.get_attr(contact, attr::AUTOMATION_SNAPSHOT).await.unwrap().is_none());
    let proper = s.learning.get_patterns(PatternKind::ProperNoun).await.unwrap();
    assert_eq!(proper, vec!["iPhone".to_string()]);
    let ignored = s.learning.get_patterns(PatternKind::IgnoreCap).await.unwrap();
    assert!(ignored.contains(&"hello".to_string()));
    assert!(!s.db.list_diffs(contact).await.unwrap().is_empty());

    // The next refine honours what was learned.
    let next = submit(&s, "hello again. iphone owners unite.").await;
    let outcome = s.pipeline.refiner().refine(next, false).await.unwrap();
    assert!(outcome.changed);
    assert_eq!(
        s.db.get_item(next).await.unwrap().unwrap().body,
        "<p>hello again. iPhone owners unite.</p>"
    );
}

#[tokio::test]
async fn bulk_action_runs_in_batches() {
    let s = stack().await;
    let mut ids = Vec::new();
    for _ in 0..60 {
        ids.push(submit(&s, KIND_LETTER).await);
    }

    s.runner
        .create_job(
            JobKind::Action {
                action: BulkAction::Archive,
            },
            ids.clone(),
            Actor::admin("mod"),
        )
        .await
        .unwrap();

    assert_eq!(drain(&s).await, 3);
    for id in ids {
        assert_eq!(s.workflow.get_stage(id).await.unwrap(), WorkflowStage::Archived);
    }
}

#[tokio::test]
async fn cancelled_token_leaves_items_alone() {
    let s = stack().await;
    let id = submit(&s, KIND_LETTER).await;
    let token = s
        .runner
        .create_job(JobKind::Rescan, vec![id], Actor::admin("mod"))
        .await
        .unwrap();

    BulkJobToken::delete(s.db.as_ref(), &token.id).await.unwrap();
    assert_eq!(drain(&s).await, 1);
    assert_eq!(s.workflow.get_stage(id).await.unwrap(), WorkflowStage::Unprocessed);
    assert!(s.db.get_attr(id, attr::SCAN_PASS).await.unwrap().is_none());
}

#[tokio::test]
async fn quarantine_resweep_holds_unsafe_letters() {
    let s = stack().await;
    let hostile = submit(&s, HOSTILE_LETTER).await;
    s.pipeline.process_item(hostile).await.unwrap();

    s.runner
        .create_job(JobKind::QuarantineResweep, vec![hostile], Actor::admin("mod"))
        .await
        .unwrap();
    drain(&s).await;
    assert_eq!(
        s.workflow.get_stage(hostile).await.unwrap(),
        WorkflowStage::Quarantined
    );
    assert!(s.db.get_attr(hostile, attr::PROCESSING_LEASE).await.unwrap().is_none());
}
