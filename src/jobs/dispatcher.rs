//! Polls the durable scheduler and runs due continuations.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, error, warn};

use super::runner::{BatchRunner, RUN_BULK_HOOK, RunOutcome, parse_continuation_args};
use crate::store::{JobScheduler, ScheduledJob};

pub struct JobDispatcher {
    scheduler: Arc<dyn JobScheduler>,
    runner: Arc<BatchRunner>,
    claim_limit: usize,
}

impl JobDispatcher {
    pub fn new(scheduler: Arc<dyn JobScheduler>, runner: Arc<BatchRunner>) -> Self {
        let claim_limit = runner.config().claim_limit.max(1);
        Self {
            scheduler,
            runner,
            claim_limit,
        }
    }

    /// Claim and run every due entry once. Returns how many were claimed.
    pub async fn run_due(&self) -> usize {
        let jobs = match self.scheduler.claim_due(Utc::now(), self.claim_limit).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("Scheduler unavailable, skipping tick: {e}");
                return 0;
            }
        };
        let claimed = jobs.len();
        if claimed > 0 {
            debug!(claimed, "Dispatching due jobs");
        }
        join_all(jobs.into_iter().map(|job| self.run_job(job))).await;
        claimed
    }

    async fn run_job(&self, job: ScheduledJob) {
        match job.hook.as_str() {
            RUN_BULK_HOOK => match parse_continuation_args(&job.args) {
                Ok((token, offset)) => match self.runner.run_bulk(&token, offset).await {
                    Ok(RunOutcome::Continued { next_offset, .. }) => {
                        debug!(token = %token, offset, next_offset, "Batch done, more to come");
                    }
                    Ok(outcome) => debug!(token = %token, offset, ?outcome, "Batch finished"),
                    Err(e) => error!(token = %token, offset, "Batch failed: {e}"),
                },
                Err(e) => warn!(job_id = job.id, "Dropping job: {e}"),
            },
            other => warn!(job_id = job.id, hook = other, "No handler for hook; dropping job"),
        }

        if let Err(e) = self.scheduler.complete(job.id).await {
            warn!(job_id = job.id, "Failed to complete job: {e}");
        }
    }
}

/// Spawn the dispatcher polling loop.
pub fn spawn_dispatcher(
    dispatcher: Arc<JobDispatcher>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            // Drain back-to-back while work is due.
            while dispatcher.run_due().await >= dispatcher.claim_limit {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{Actor, LETTER_KIND};
    use crate::jobs::JobKind;
    use crate::jobs::test_support::{fast_config, runner_with};
    use crate::pipeline::BulkAction;
    use crate::store::Database;
    use crate::workflow::WorkflowStage;

    #[tokio::test]
    async fn dispatcher_drives_a_token_to_completion() {
        let (db, runner) = runner_with(fast_config()).await;
        let mut ids = Vec::new();
        for n in 0..30 {
            let id = db
                .insert_item(LETTER_KIND, &format!("letter {n}"), None)
                .await
                .unwrap();
            ids.push(id);
        }
        let runner = Arc::new(runner);
        runner
            .create_job(
                JobKind::Action {
                    action: BulkAction::Archive,
                },
                ids.clone(),
                Actor::admin("mod"),
            )
            .await
            .unwrap();

        let dispatcher = JobDispatcher::new(db.clone(), runner.clone());
        let mut ticks = 0;
        while dispatcher.run_due().await > 0 {
            ticks += 1;
        }
        assert_eq!(ticks, 2);
        for id in ids {
            assert_eq!(
                runner.pipeline().workflow().get_stage(id).await.unwrap(),
                WorkflowStage::Archived
            );
        }
        assert!(db.list_pending(RUN_BULK_HOOK).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_jobs_are_completed_not_retried() {
        let (db, runner) = runner_with(fast_config()).await;
        let dispatcher = JobDispatcher::new(db.clone(), Arc::new(runner));
        db.schedule(RUN_BULK_HOOK, &serde_json::json!({"offset": 3}), Duration::ZERO)
            .await
            .unwrap();
        db.schedule("mystery", &serde_json::json!({}), Duration::ZERO)
            .await
            .unwrap();
        db.schedule(
            RUN_BULK_HOOK,
            &serde_json::json!({"token": "gone", "offset": 0}),
            Duration::ZERO,
        )
        .await
        .unwrap();

        assert_eq!(dispatcher.run_due().await, 3);
        assert_eq!(dispatcher.run_due().await, 0);
        assert!(db.list_pending(RUN_BULK_HOOK).await.unwrap().is_empty());
    }
}
