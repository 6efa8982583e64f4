//! Resumable, offset-based batch runner.
//!
//! One invocation of [`BatchRunner::run_bulk`]:
//! 1. Load the token (missing → exit quietly, malformed → drop it)
//! 2. Check the offset and the batch ceiling
//! 3. Take the token's in-flight lease
//! 4. Process one slice with per-item error isolation and a wall-clock cap
//! 5. Advance or delete the token, release the lease
//! 6. Schedule the continuation unless an identical one is already queued

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::token::{BulkJobToken, JobKind, TOKEN_PREFIX, TokenLookup};
use crate::config::BatchConfig;
use crate::error::{DatabaseError, Error, JobError, SchedulerError};
use crate::item::{Actor, ItemId, LETTER_KIND, attr};
use crate::lease::Lease;
use crate::pipeline::ModerationPipeline;
use crate::store::{Database, ItemFilter, JobScheduler, TtlCache};
use crate::workflow::WorkflowStage;

/// Scheduler hook every token continuation runs under.
pub const RUN_BULK_HOOK: &str = "letter_guard_run_bulk";

/// Items per backlog token.
const BACKLOG_CHUNK: usize = 1000;

/// Slack on top of the batch wall clock before an in-flight lease lapses.
const LEASE_SLACK: Duration = Duration::from_secs(60);

pub fn continuation_args(token: &str, offset: usize) -> serde_json::Value {
    json!({ "token": token, "offset": offset })
}

/// Decode `{token, offset}` scheduler arguments.
pub fn parse_continuation_args(args: &serde_json::Value) -> Result<(String, usize), SchedulerError> {
    let invalid = |reason: &str| SchedulerError::InvalidArgs {
        hook: RUN_BULK_HOOK.to_string(),
        reason: reason.to_string(),
    };
    let token = args
        .get("token")
        .and_then(|v| v.as_str())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| invalid("missing token"))?;
    let offset = args
        .get("offset")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| invalid("missing or negative offset"))?;
    Ok((token.to_string(), offset as usize))
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub item_id: ItemId,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub offset: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: Vec<ItemFailure>,
    /// The wall-clock cap cut the slice short.
    pub timed_out: bool,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// Token deleted or expired; nothing was touched.
    Missing,
    /// Token payload undecodable; it was dropped.
    Malformed,
    /// Offset disagrees with the token's progress; a duplicate continuation.
    Stale { expected: usize },
    /// Another worker holds the token's lease.
    Busy,
    /// Batch ceiling reached; token dropped.
    Aborted,
    /// Token deleted while the slice ran; no continuation.
    Cancelled { report: BatchReport },
    Continued {
        next_offset: usize,
        /// Whether this run queued the continuation.
        scheduled: bool,
        report: BatchReport,
    },
    Completed { report: BatchReport },
}

pub struct BatchRunner {
    db: Arc<dyn Database>,
    cache: Arc<dyn TtlCache>,
    scheduler: Arc<dyn JobScheduler>,
    pipeline: Arc<ModerationPipeline>,
    config: BatchConfig,
}

impl BatchRunner {
    pub fn new(
        db: Arc<dyn Database>,
        cache: Arc<dyn TtlCache>,
        scheduler: Arc<dyn JobScheduler>,
        pipeline: Arc<ModerationPipeline>,
        config: BatchConfig,
    ) -> Self {
        Self {
            db,
            cache,
            scheduler,
            pipeline,
            config,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<dyn TtlCache> {
        &self.cache
    }

    pub fn scheduler(&self) -> &Arc<dyn JobScheduler> {
        &self.scheduler
    }

    pub fn pipeline(&self) -> &Arc<ModerationPipeline> {
        &self.pipeline
    }

    /// Store a token for `item_ids` and schedule its first slice.
    pub async fn create_job(
        &self,
        kind: JobKind,
        item_ids: Vec<ItemId>,
        actor: Actor,
    ) -> Result<BulkJobToken, JobError> {
        if item_ids.is_empty() {
            return Err(JobError::InvalidInput("no item IDs given".into()));
        }
        if let Some(bad) = item_ids.iter().find(|id| !id.is_valid()) {
            return Err(JobError::InvalidInput(format!("invalid item ID {bad}")));
        }

        let token = BulkJobToken::new(kind, item_ids, actor);
        token.save(self.cache.as_ref(), self.config.token_ttl).await?;

        let args = continuation_args(&token.id, 0);
        if let Err(e) = self
            .scheduler
            .schedule(RUN_BULK_HOOK, &args, Duration::ZERO)
            .await
        {
            error!(token = %token.id, "Failed to schedule bulk job: {e}");
            if let Err(e) = BulkJobToken::delete(self.cache.as_ref(), &token.id).await {
                warn!(token = %token.id, "Failed to drop unscheduled token: {e}");
            }
            return Err(e.into());
        }

        info!(
            token = %token.id,
            kind = %token.kind.label(),
            items = token.item_ids.len(),
            actor = %token.actor,
            "Bulk job created"
        );
        Ok(token)
    }

    /// Run one slice of a token starting at `offset`.
    pub async fn run_bulk(&self, token_id: &str, offset: usize) -> Result<RunOutcome, JobError> {
        let mut token = match BulkJobToken::load(self.cache.as_ref(), token_id).await? {
            TokenLookup::Found(token) => token,
            TokenLookup::Missing => {
                debug!(token = %token_id, offset, "Token gone; continuation exits");
                return Ok(RunOutcome::Missing);
            }
            TokenLookup::Malformed(reason) => {
                error!(token = %token_id, offset, "Malformed token dropped: {reason}");
                BulkJobToken::delete(self.cache.as_ref(), token_id).await?;
                return Ok(RunOutcome::Malformed);
            }
        };

        if offset != token.next_offset {
            warn!(
                token = %token_id,
                offset,
                expected = token.next_offset,
                "Stale continuation ignored"
            );
            return Ok(RunOutcome::Stale {
                expected: token.next_offset,
            });
        }

        if token.batch_count >= self.config.max_batches {
            let abort = JobError::RunawayToken {
                token: token_id.to_string(),
                max: self.config.max_batches,
            };
            error!(token = %token_id, offset, batches = token.batch_count, "{abort}; token dropped");
            BulkJobToken::delete(self.cache.as_ref(), token_id).await?;
            return Ok(RunOutcome::Aborted);
        }

        let holder = format!("runner:{}", Uuid::new_v4().simple());
        let lease_key = BulkJobToken::lease_key(token_id);
        let ttl = self.config.max_batch_duration + LEASE_SLACK;
        let lease = Lease::acquire(holder.as_str(), ttl, Utc::now());
        let lease_value = serde_json::to_value(&lease)
            .map_err(|e| DatabaseError::Serialization(format!("lease {lease_key}: {e}")))?;
        if !self.cache.cache_add(&lease_key, &lease_value, ttl).await? {
            debug!(token = %token_id, offset, "Token busy in another worker");
            return Ok(RunOutcome::Busy);
        }

        let report = self.run_slice(&token, offset).await;
        let advanced = self.advance(&mut token, &report).await;

        if let Err(e) = self.cache.cache_delete(&lease_key).await {
            warn!(token = %token_id, "Failed to release token lease: {e}");
        }

        match advanced? {
            Advance::Cancelled => {
                info!(token = %token_id, offset, "Token cancelled mid-batch");
                Ok(RunOutcome::Cancelled { report })
            }
            Advance::Done => {
                info!(
                    token = %token_id,
                    batches = token.batch_count,
                    failed = report.failed.len(),
                    "Bulk job completed"
                );
                Ok(RunOutcome::Completed { report })
            }
            Advance::More(next_offset) => {
                let scheduled = self.schedule_continuation(token_id, next_offset).await;
                Ok(RunOutcome::Continued {
                    next_offset,
                    scheduled,
                    report,
                })
            }
        }
    }

    async fn run_slice(&self, token: &BulkJobToken, offset: usize) -> BatchReport {
        let started = Instant::now();
        let end = (offset + self.config.batch_size).min(token.item_ids.len());
        let mut report = BatchReport {
            offset,
            ..Default::default()
        };

        for &id in token.item_ids.get(offset..end).unwrap_or_default() {
            if started.elapsed() >= self.config.max_batch_duration {
                warn!(token = %token.id, offset, processed = report.processed, "Batch wall clock exceeded");
                report.timed_out = true;
                break;
            }
            report.processed += 1;
            match self.process_one(token, id).await {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    warn!(token = %token.id, item_id = %id, "Item failed in batch: {e}");
                    report.failed.push(ItemFailure {
                        item_id: id,
                        error: e.to_string(),
                    });
                }
            }
        }

        debug!(
            token = %token.id,
            offset,
            processed = report.processed,
            failed = report.failed.len(),
            "Batch slice finished"
        );
        report
    }

    async fn process_one(&self, token: &BulkJobToken, id: ItemId) -> Result<(), Error> {
        match token.kind {
            JobKind::Rescan => {
                self.pipeline.process_item(id).await?;
            }
            JobKind::Backlog => {
                self.pipeline.process_if_unprocessed(id).await?;
            }
            JobKind::QuarantineResweep => {
                self.pipeline.resweep_quarantined(id).await?;
            }
            JobKind::Action { action } => {
                self.pipeline
                    .apply_bulk_action(id, action, &token.actor)
                    .await?;
            }
        }
        Ok(())
    }

    /// Persist progress. A token deleted mid-slice stays deleted.
    async fn advance(
        &self,
        token: &mut BulkJobToken,
        report: &BatchReport,
    ) -> Result<Advance, JobError> {
        token.batch_count += 1;
        token.next_offset = report.offset + report.processed;
        if token.remaining_items() == 0 {
            if !BulkJobToken::delete(self.cache.as_ref(), &token.id).await? {
                return Ok(Advance::Cancelled);
            }
            return Ok(Advance::Done);
        }
        if !token.update(self.cache.as_ref(), self.config.token_ttl).await? {
            return Ok(Advance::Cancelled);
        }
        Ok(Advance::More(token.next_offset))
    }

    /// Queue `run_bulk(token, offset)` unless an identical entry exists.
    /// Scheduler failures are logged; the token survives for the sweep.
    async fn schedule_continuation(&self, token_id: &str, offset: usize) -> bool {
        let args = continuation_args(token_id, offset);
        match self.scheduler.is_scheduled(RUN_BULK_HOOK, &args).await {
            Ok(true) => {
                debug!(token = %token_id, offset, "Continuation already queued");
                return false;
            }
            Ok(false) => {}
            Err(e) => {
                error!(token = %token_id, offset, "Scheduler unavailable: {e}");
                return false;
            }
        }

        let delay = self.continuation_delay();
        match self.scheduler.schedule(RUN_BULK_HOOK, &args, delay).await {
            Ok(_) => {
                debug!(token = %token_id, offset, delay_ms = delay.as_millis() as u64, "Continuation scheduled");
                true
            }
            Err(e) => {
                error!(token = %token_id, offset, "Failed to schedule continuation: {e}");
                false
            }
        }
    }

    fn continuation_delay(&self) -> Duration {
        let jitter_ms = self.config.continuation_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.config.continuation_delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        self.config.continuation_delay + Duration::from_millis(jitter)
    }

    /// Live backlog tokens, used to avoid enqueueing the same backlog twice.
    async fn live_backlog_tokens(&self) -> Result<usize, JobError> {
        let now = Utc::now();
        let mut live = 0;
        for entry in self.cache.cache_keys(TOKEN_PREFIX).await? {
            if entry.expires_at <= now {
                continue;
            }
            let Some(id) = BulkJobToken::id_from_key(&entry.key) else {
                continue;
            };
            if let TokenLookup::Found(token) = BulkJobToken::load(self.cache.as_ref(), id).await?
                && token.kind == JobKind::Backlog
            {
                live += 1;
            }
        }
        Ok(live)
    }

    /// Create backlog tokens covering every `unprocessed` letter.
    /// Skipped while a backlog token is still live.
    pub async fn enqueue_backlog(&self) -> Result<Vec<BulkJobToken>, JobError> {
        let live = self.live_backlog_tokens().await?;
        if live > 0 {
            debug!(live, "Backlog already queued");
            return Ok(Vec::new());
        }

        let filter = ItemFilter {
            kind: Some(LETTER_KIND.to_string()),
            ..Default::default()
        }
        .with_attr(attr::STAGE, WorkflowStage::Unprocessed.to_value());
        let ids = self.db.list_items(&filter).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut tokens = Vec::new();
        for chunk in ids.chunks(BACKLOG_CHUNK) {
            let token = self
                .create_job(JobKind::Backlog, chunk.to_vec(), Actor::automation("backlog"))
                .await?;
            tokens.push(token);
        }
        info!(items = ids.len(), tokens = tokens.len(), "Backlog enqueued");
        Ok(tokens)
    }
}

enum Advance {
    Cancelled,
    Done,
    More(usize),
}
