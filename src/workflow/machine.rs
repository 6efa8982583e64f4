//! The workflow state machine: sole writer of canonical stage data.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::stage::{AuditEntry, StageChange, StageRequest, TransitionOutcome, WorkflowStage};
use crate::config::WorkflowConfig;
use crate::error::WorkflowError;
use crate::item::{Actor, ItemId, attr};
use crate::lease::Lease;
use crate::store::{Database, ItemFilter};

/// Notified after every committed stage change.
#[async_trait]
pub trait StageObserver: Send + Sync {
    async fn on_stage_change(&self, change: &StageChange);
}

pub struct Workflow {
    db: Arc<dyn Database>,
    config: WorkflowConfig,
    observers: RwLock<Vec<Arc<dyn StageObserver>>>,
}

/// Whether automation may move an item from `from` to `to` on its own.
pub fn automation_allows(from: WorkflowStage, to: WorkflowStage) -> bool {
    use WorkflowStage::*;
    if from == to || to == Processing {
        return false;
    }
    match from {
        Published | Archived => false,
        Quarantined => to == PendingReview,
        Unprocessed | Processing | PendingReview => true,
    }
}

/// Pick the winning deferred request against the pre-lock stage. A request
/// to stay at `prev` competes like any other.
pub fn arbitrate_deferred(prev: WorkflowStage, requests: &[StageRequest]) -> Option<&StageRequest> {
    requests
        .iter()
        .filter(|r| r.target == prev || automation_allows(prev, r.target))
        .filter(|r| r.target != WorkflowStage::Processing)
        .max_by_key(|r| r.target.automation_precedence())
}

fn timestamp(now: DateTime<Utc>) -> serde_json::Value {
    serde_json::Value::String(now.to_rfc3339())
}

impl Workflow {
    pub fn new(db: Arc<dyn Database>, config: WorkflowConfig) -> Self {
        Self {
            db,
            config,
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn register_observer(&self, observer: Arc<dyn StageObserver>) {
        match self.observers.write() {
            Ok(mut observers) => observers.push(observer),
            Err(_) => warn!("Observer registry poisoned; observer not registered"),
        }
    }

    fn observers(&self) -> Vec<Arc<dyn StageObserver>> {
        self.observers
            .read()
            .map(|o| o.clone())
            .unwrap_or_default()
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub(crate) fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Reject IDs that cannot name a letter.
    async fn validate(&self, id: ItemId) -> Result<(), WorkflowError> {
        if !id.is_valid() {
            return Err(WorkflowError::InvalidItem {
                id,
                reason: "item IDs must be positive".into(),
            });
        }
        match self.db.get_item(id).await? {
            None => Err(WorkflowError::InvalidItem {
                id,
                reason: "no such item".into(),
            }),
            Some(item) if !item.is_letter() => Err(WorkflowError::InvalidItem {
                id,
                reason: format!("items of kind '{}' are not moderated", item.kind),
            }),
            Some(_) => Ok(()),
        }
    }

    /// Canonical stage, if one was ever written.
    pub async fn stored_stage(&self, id: ItemId) -> Result<Option<WorkflowStage>, WorkflowError> {
        let raw = self.db.get_attr(id, attr::STAGE).await?;
        Ok(raw.as_ref().map(|v| WorkflowStage::from_value(Some(v))))
    }

    /// Current stage. Never fails on bad data: missing or unknown reads as
    /// `Unprocessed`.
    pub async fn get_stage(&self, id: ItemId) -> Result<WorkflowStage, WorkflowError> {
        Ok(self.stored_stage(id).await?.unwrap_or(WorkflowStage::Unprocessed))
    }

    /// Write a stage. Returns whether the stored stage changed.
    ///
    /// Stamps entry times, projects visibility, appends to the audit log and
    /// notifies observers. Leaving `processing` drops the lock state.
    pub async fn set_stage(
        &self,
        id: ItemId,
        stage: WorkflowStage,
        actor: &Actor,
        note: Option<&str>,
    ) -> Result<bool, WorkflowError> {
        self.validate(id).await?;
        let from = self.stored_stage(id).await?;
        let now = Utc::now();

        if from == Some(stage) {
            if let Some(note) = note {
                self.append_audit(id, from, stage, actor, Some(note), now)
                    .await?;
            }
            return Ok(false);
        }

        self.db.set_attr(id, attr::STAGE, &stage.to_value()).await?;

        // Stage held before the lock: on entry to `processing` it is written
        // just beforehand, on exit it is still present.
        let before_lock = if stage == WorkflowStage::Processing
            || from == Some(WorkflowStage::Processing)
        {
            self.db
                .get_attr(id, attr::PROCESSING_PREV_STAGE)
                .await?
                .map(|v| WorkflowStage::from_value(Some(&v)))
        } else {
            None
        };
        let returning = from == Some(WorkflowStage::Processing) && before_lock == Some(stage);

        // Handing the item back to its pre-lock stage is not a new entry.
        let entered_key = attr::stage_entered_at(stage.as_str());
        if stage.stamps_every_entry() && !returning {
            self.db.set_attr(id, &entered_key, &timestamp(now)).await?;
        } else if stage == WorkflowStage::Unprocessed {
            self.db
                .compare_and_set_attr(id, &entered_key, None, &timestamp(now))
                .await?;
        }

        // A locked item stays as visible as it was before the lock.
        let visible_as = match (stage, before_lock) {
            (WorkflowStage::Processing, Some(prev)) => prev,
            _ => stage,
        };
        self.db
            .set_visibility(id, visible_as.visibility().as_str())
            .await?;

        if from == Some(WorkflowStage::Processing) {
            self.db.delete_attr(id, attr::PROCESSING_LEASE).await?;
            self.db.delete_attr(id, attr::DEFERRED_REQUESTS).await?;
            self.db.delete_attr(id, attr::PROCESSING_PREV_STAGE).await?;
        }

        self.append_audit(id, from, stage, actor, note, now).await?;

        info!(
            item_id = %id,
            from = from.map(|s| s.as_str()).unwrap_or("none"),
            to = %stage,
            actor = %actor,
            "Stage changed"
        );

        let change = StageChange {
            item_id: id,
            from,
            to: stage,
            actor: actor.clone(),
            before_lock: before_lock.filter(|_| from == Some(WorkflowStage::Processing)),
        };
        for observer in self.observers() {
            observer.on_stage_change(&change).await;
        }
        Ok(true)
    }

    async fn append_audit(
        &self,
        id: ItemId,
        from: Option<WorkflowStage>,
        to: WorkflowStage,
        actor: &Actor,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        let mut log = self.audit_log(id).await?;
        log.push(AuditEntry {
            at: now,
            actor: actor.to_string(),
            from,
            to,
            note: note.map(str::to_string),
        });
        if log.len() > self.config.audit_log_cap {
            let excess = log.len() - self.config.audit_log_cap;
            log.drain(..excess);
        }
        let value = serde_json::to_value(&log)
            .map_err(|e| crate::error::DatabaseError::Serialization(e.to_string()))?;
        self.db.set_attr(id, attr::WORKFLOW_LOG, &value).await?;
        Ok(())
    }

    /// Audit entries, oldest first.
    pub async fn audit_log(&self, id: ItemId) -> Result<Vec<AuditEntry>, WorkflowError> {
        let raw = self.db.get_attr(id, attr::WORKFLOW_LOG).await?;
        Ok(raw
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default())
    }

    /// Give a freshly submitted item its first stage.
    pub async fn register_new(&self, id: ItemId) -> Result<bool, WorkflowError> {
        if self.stored_stage(id).await?.is_some() {
            return Ok(false);
        }
        self.set_stage(
            id,
            WorkflowStage::Unprocessed,
            &Actor::automation("intake"),
            None,
        )
        .await
    }

    /// Ask for a stage change.
    ///
    /// Admin requests are applied as-is. Automated requests on a locked item
    /// are deferred until the lock is released; otherwise they are checked
    /// against [`automation_allows`].
    pub async fn request_transition(
        &self,
        id: ItemId,
        target: WorkflowStage,
        actor: &Actor,
        note: Option<&str>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        if actor.is_admin() {
            return Ok(if self.set_stage(id, target, actor, note).await? {
                TransitionOutcome::Applied(target)
            } else {
                TransitionOutcome::Unchanged(target)
            });
        }

        self.validate(id).await?;
        let current = self.get_stage(id).await?;

        if current == WorkflowStage::Processing {
            let mut requests = self.deferred_requests(id).await?;
            requests.push(StageRequest {
                target,
                actor: actor.clone(),
                note: note.map(str::to_string),
                requested_at: Utc::now(),
            });
            let value = serde_json::to_value(&requests)
                .map_err(|e| crate::error::DatabaseError::Serialization(e.to_string()))?;
            self.db.set_attr(id, attr::DEFERRED_REQUESTS, &value).await?;
            debug!(item_id = %id, target = %target, actor = %actor, "Stage request deferred");
            return Ok(TransitionOutcome::Deferred);
        }

        if current == target {
            return Ok(TransitionOutcome::Unchanged(current));
        }
        if !automation_allows(current, target) {
            debug!(
                item_id = %id,
                current = %current,
                target = %target,
                actor = %actor,
                "Automated stage request rejected"
            );
            return Ok(TransitionOutcome::Rejected(current));
        }
        self.set_stage(id, target, actor, note).await?;
        Ok(TransitionOutcome::Applied(target))
    }

    pub async fn deferred_requests(&self, id: ItemId) -> Result<Vec<StageRequest>, WorkflowError> {
        let raw = self.db.get_attr(id, attr::DEFERRED_REQUESTS).await?;
        Ok(raw
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default())
    }

    async fn current_lease(&self, id: ItemId) -> Result<Option<(serde_json::Value, Option<Lease>)>, WorkflowError> {
        let raw = self.db.get_attr(id, attr::PROCESSING_LEASE).await?;
        Ok(raw.map(|v| {
            let lease = serde_json::from_value(v.clone()).ok();
            (v, lease)
        }))
    }

    /// Take the processing lock and move the item to `processing`.
    ///
    /// Expired leases are reclaimed. Fails with `Locked` when another holder
    /// has a live lease or wins the race for it.
    pub async fn mark_processing_started(
        &self,
        id: ItemId,
        holder: &str,
    ) -> Result<Lease, WorkflowError> {
        self.validate(id).await?;
        let now = Utc::now();
        let current = self.get_stage(id).await?;
        let existing = self.current_lease(id).await?;

        if let Some((_, Some(ref lease))) = existing
            && !lease.can_be_taken_by(holder, now)
        {
            return Err(WorkflowError::Locked {
                id,
                holder: lease.holder.clone(),
                remaining: lease.remaining(now),
            });
        }

        let lease = Lease::acquire(holder, self.config.stale_lock_after, now);
        let value = serde_json::to_value(&lease)
            .map_err(|e| crate::error::DatabaseError::Serialization(e.to_string()))?;
        let expected = existing.as_ref().map(|(raw, _)| raw);
        if !self
            .db
            .compare_and_set_attr(id, attr::PROCESSING_LEASE, expected, &value)
            .await?
        {
            let winner = self
                .current_lease(id)
                .await?
                .and_then(|(_, l)| l)
                .map(|l| l.holder)
                .unwrap_or_else(|| "unknown".into());
            return Err(WorkflowError::Locked {
                id,
                holder: winner,
                remaining: self.config.stale_lock_after,
            });
        }

        if existing.is_some() {
            // Reclaimed: whatever the previous holder deferred is void.
            self.db.delete_attr(id, attr::DEFERRED_REQUESTS).await?;
        }
        if current != WorkflowStage::Processing {
            self.db
                .set_attr(id, attr::PROCESSING_PREV_STAGE, &current.to_value())
                .await?;
            self.set_stage(
                id,
                WorkflowStage::Processing,
                &Actor::automation(holder),
                None,
            )
            .await?;
        }
        debug!(item_id = %id, holder, "Processing lock acquired");
        Ok(lease)
    }

    /// Release the processing lock, applying the winning deferred request.
    ///
    /// With no admissible request the item returns to its pre-lock stage.
    /// Returns the resulting stage, or `None` if `holder` no longer owns
    /// the lock.
    pub async fn clear_processing_lock(
        &self,
        id: ItemId,
        holder: &str,
    ) -> Result<Option<WorkflowStage>, WorkflowError> {
        self.release(id, holder, None).await
    }

    /// Release the lock after a failed run. Deferred requests are discarded
    /// and the item goes back to its pre-lock stage, so it can be retried.
    pub async fn abandon_processing(
        &self,
        id: ItemId,
        holder: &str,
        reason: &str,
    ) -> Result<Option<WorkflowStage>, WorkflowError> {
        self.release(id, holder, Some(reason)).await
    }

    async fn release(
        &self,
        id: ItemId,
        holder: &str,
        abandoned: Option<&str>,
    ) -> Result<Option<WorkflowStage>, WorkflowError> {
        let Some((_, lease)) = self.current_lease(id).await? else {
            debug!(item_id = %id, holder, "No processing lock to clear");
            return Ok(None);
        };
        if let Some(ref lease) = lease
            && lease.holder != holder
        {
            warn!(item_id = %id, holder, owner = %lease.holder, "Refusing to clear a lock held by another worker");
            return Ok(None);
        }

        let prev = WorkflowStage::from_value(
            self.db
                .get_attr(id, attr::PROCESSING_PREV_STAGE)
                .await?
                .as_ref(),
        );
        let requests = match abandoned {
            Some(_) => Vec::new(),
            None => self.deferred_requests(id).await?,
        };
        let (target, actor, note) = match arbitrate_deferred(prev, &requests) {
            Some(winner) => (winner.target, winner.actor.clone(), winner.note.clone()),
            None if abandoned.is_some() => (
                prev,
                Actor::automation(holder),
                abandoned.map(|reason| format!("Processing failed, returned for retry: {reason}")),
            ),
            None => (
                prev,
                Actor::automation(holder),
                Some("Processing finished without a stage change".to_string()),
            ),
        };

        if self.get_stage(id).await? == WorkflowStage::Processing {
            self.set_stage(id, target, &actor, note.as_deref()).await?;
        } else {
            self.db.delete_attr(id, attr::PROCESSING_LEASE).await?;
            self.db.delete_attr(id, attr::DEFERRED_REQUESTS).await?;
            self.db.delete_attr(id, attr::PROCESSING_PREV_STAGE).await?;
        }
        debug!(item_id = %id, holder, stage = %target, "Processing lock released");
        Ok(Some(target))
    }

    /// Reset items stuck in `processing` past the stale threshold.
    pub async fn reset_stale_locks(&self) -> Result<usize, WorkflowError> {
        let now = Utc::now();
        let filter = ItemFilter::default().with_attr(attr::STAGE, WorkflowStage::Processing.to_value());
        let mut reset = 0;

        for id in self.db.list_items(&filter).await? {
            let lease = self.current_lease(id).await?.and_then(|(_, l)| l);
            let stale = match lease {
                Some(ref l) => l.is_expired(now),
                None => true,
            };
            if !stale {
                continue;
            }
            let age = lease
                .as_ref()
                .map(|l| l.age(now).as_secs())
                .unwrap_or_default();
            let note = format!(
                "Processing lock stale after {age}s (threshold {}s); reset for retry",
                self.config.stale_lock_after.as_secs()
            );
            match self
                .set_stage(
                    id,
                    WorkflowStage::Unprocessed,
                    &Actor::automation("stale-lock-reset"),
                    Some(&note),
                )
                .await
            {
                Ok(_) => {
                    warn!(item_id = %id, age_secs = age, "Stale processing lock reset");
                    reset += 1;
                }
                Err(e) => warn!(item_id = %id, "Failed to reset stale lock: {e}"),
            }
        }
        Ok(reset)
    }
}
