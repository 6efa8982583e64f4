//! Shared fixtures for job tests.

use std::sync::Arc;
use std::time::Duration;

use super::runner::BatchRunner;
use crate::config::{BatchConfig, GateConfig, ScannerConfig, WorkflowConfig};
use crate::gate::AutoApprovalGate;
use crate::learning::NoopPatternProvider;
use crate::notify::NoopNotifier;
use crate::pipeline::ModerationPipeline;
use crate::refiner::Refiner;
use crate::safety::SafetyScanner;
use crate::store::LibSqlBackend;
use crate::workflow::Workflow;

pub fn fast_config() -> BatchConfig {
    BatchConfig {
        continuation_delay: Duration::ZERO,
        continuation_jitter: Duration::ZERO,
        ..Default::default()
    }
}

pub async fn runner_with(config: BatchConfig) -> (Arc<LibSqlBackend>, BatchRunner) {
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
    let pipeline = Arc::new(ModerationPipeline::new(
        db.clone(),
        workflow,
        SafetyScanner::new(&ScannerConfig::default()),
        gate,
        refiner,
        "test",
    ));
    let runner = BatchRunner::new(db.clone(), db.clone(), db.clone(), pipeline, config);
    (db, runner)
}
