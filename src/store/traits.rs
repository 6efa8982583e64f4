//! Persistence interfaces.
//!
//! `Database` is the single async interface for durable pipeline state:
//! items and their attribute maps, revisions, learned patterns and the audit
//! tables. The durable job scheduler and the ephemeral TTL cache are separate
//! traits so they can be backed by different infrastructure.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DatabaseError, SchedulerError};
use crate::item::{Item, ItemId};

/// Predicate for listing item IDs, with pagination.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    /// Only items of this kind.
    pub kind: Option<String>,
    /// Only items whose attribute equals the given value.
    pub attr_equals: Option<(String, serde_json::Value)>,
    /// Only items that carry this attribute.
    pub has_attr: Option<String>,
    /// Only items that lack this attribute.
    pub missing_attr: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl ItemFilter {
    pub fn page(limit: usize, offset: usize) -> Self {
        Self {
            limit,
            offset,
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, key: &str, value: serde_json::Value) -> Self {
        self.attr_equals = Some((key.to_string(), value));
        self
    }

    pub fn having(mut self, key: &str) -> Self {
        self.has_attr = Some(key.to_string());
        self
    }

    pub fn lacking(mut self, key: &str) -> Self {
        self.missing_attr = Some(key.to_string());
        self
    }
}

/// A saved prior version of an item's body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    pub id: i64,
    pub item_id: ItemId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted exception to a default refinement rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub pattern_type: String,
    pub value: String,
    pub success_count: i64,
    pub failure_count: i64,
    pub is_active: bool,
    pub last_updated: DateTime<Utc>,
}

/// One observed difference between automated output and the human's final text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffEvent {
    pub item_id: ItemId,
    pub change_type: String,
    pub before_value: String,
    pub after_value: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted auto-approval decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub item_id: ItemId,
    pub safe: bool,
    pub score: i32,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
}

/// Backend-agnostic database trait covering items, revisions, patterns and audit.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Items ───────────────────────────────────────────────────────

    /// Insert a new item. Returns its generated ID.
    async fn insert_item(
        &self,
        kind: &str,
        body: &str,
        visibility: Option<&str>,
    ) -> Result<ItemId, DatabaseError>;

    async fn get_item(&self, id: ItemId) -> Result<Option<Item>, DatabaseError>;

    async fn update_body(&self, id: ItemId, body: &str) -> Result<(), DatabaseError>;

    async fn set_visibility(&self, id: ItemId, visibility: &str) -> Result<(), DatabaseError>;

    /// List item IDs matching the filter, ordered by ID.
    async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<ItemId>, DatabaseError>;

    // ── Attributes ──────────────────────────────────────────────────

    async fn get_attr(
        &self,
        id: ItemId,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError>;

    async fn set_attr(
        &self,
        id: ItemId,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    /// Delete an attribute. Returns whether it existed.
    async fn delete_attr(&self, id: ItemId, key: &str) -> Result<bool, DatabaseError>;

    async fn get_attrs(
        &self,
        id: ItemId,
    ) -> Result<HashMap<String, serde_json::Value>, DatabaseError>;

    /// Atomically replace an attribute only if it currently equals `expected`
    /// (`None` = only if absent). Returns whether the write happened.
    async fn compare_and_set_attr(
        &self,
        id: ItemId,
        key: &str,
        expected: Option<&serde_json::Value>,
        value: &serde_json::Value,
    ) -> Result<bool, DatabaseError>;

    /// Delete an attribute from every item. Returns the number removed.
    async fn delete_attr_everywhere(&self, key: &str) -> Result<usize, DatabaseError>;

    // ── Revisions ───────────────────────────────────────────────────

    async fn save_revision(&self, id: ItemId, body: &str) -> Result<i64, DatabaseError>;

    /// Revisions for an item, most recent first.
    async fn list_revisions(&self, id: ItemId) -> Result<Vec<Revision>, DatabaseError>;

    async fn delete_revision(&self, revision_id: i64) -> Result<(), DatabaseError>;

    // ── Learned patterns ────────────────────────────────────────────

    /// Create the pattern or bump its failure count.
    async fn record_pattern_failure(
        &self,
        pattern_type: &str,
        value: &str,
    ) -> Result<(), DatabaseError>;

    /// Create the pattern or bump its success count.
    async fn record_pattern_success(
        &self,
        pattern_type: &str,
        value: &str,
    ) -> Result<(), DatabaseError>;

    /// All patterns, optionally restricted to one type.
    async fn list_patterns(
        &self,
        pattern_type: Option<&str>,
    ) -> Result<Vec<LearnedPattern>, DatabaseError>;

    /// Deactivate patterns with `failure > 2 * success` and at least
    /// `min_samples` observations. Returns the number deactivated.
    async fn deactivate_exhausted_patterns(&self, min_samples: i64)
    -> Result<usize, DatabaseError>;

    async fn clear_patterns(&self) -> Result<usize, DatabaseError>;

    // ── Learning diff log ───────────────────────────────────────────

    async fn record_diff(&self, event: &DiffEvent) -> Result<(), DatabaseError>;

    async fn list_diffs(&self, id: ItemId) -> Result<Vec<DiffEvent>, DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError>;

    async fn set_setting(&self, key: &str, value: &serde_json::Value)
    -> Result<(), DatabaseError>;
}

/// Sink for auto-approval decisions.
#[async_trait]
pub trait DecisionLog: Send + Sync {
    async fn record_decision(&self, record: &DecisionRecord) -> Result<(), DatabaseError>;

    /// Decisions for an item, most recent first.
    async fn list_decisions(&self, id: ItemId) -> Result<Vec<DecisionRecord>, DatabaseError>;
}

/// Decision log used when no durable log is configured.
pub struct NoopDecisionLog;

#[async_trait]
impl DecisionLog for NoopDecisionLog {
    async fn record_decision(&self, _record: &DecisionRecord) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn list_decisions(&self, _id: ItemId) -> Result<Vec<DecisionRecord>, DatabaseError> {
        Ok(Vec::new())
    }
}

/// Lifecycle of a scheduler entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledJobStatus {
    Pending,
    Running,
}

/// An entry in the durable job scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: i64,
    pub hook: String,
    pub args: serde_json::Value,
    pub status: ScheduledJobStatus,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Durable, out-of-band job scheduler.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Schedule `hook(args)` to run after `delay`. Returns the entry ID.
    async fn schedule(
        &self,
        hook: &str,
        args: &serde_json::Value,
        delay: Duration,
    ) -> Result<i64, SchedulerError>;

    /// Whether an identical `hook(args)` entry is pending or running.
    async fn is_scheduled(
        &self,
        hook: &str,
        args: &serde_json::Value,
    ) -> Result<bool, SchedulerError>;

    /// Cancel entries for a hook, all of them when `args` is `None`.
    async fn cancel(
        &self,
        hook: &str,
        args: Option<&serde_json::Value>,
    ) -> Result<usize, SchedulerError>;

    /// Cancel one entry by ID.
    async fn cancel_job(&self, id: i64) -> Result<bool, SchedulerError>;

    /// Pending and running entries for a hook.
    async fn list_pending(&self, hook: &str) -> Result<Vec<ScheduledJob>, SchedulerError>;

    /// Claim up to `limit` due pending entries, marking them running.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, SchedulerError>;

    /// Remove a finished entry.
    async fn complete(&self, id: i64) -> Result<(), SchedulerError>;
}

/// Metadata of a cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntryMeta {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Ephemeral key-value cache with per-entry TTL.
#[async_trait]
pub trait TtlCache: Send + Sync {
    /// Get a live entry. Expired entries read as absent.
    async fn cache_get(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError>;

    async fn cache_set(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), DatabaseError>;

    /// Insert only if the key is absent or expired. Returns whether it was written.
    async fn cache_add(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<bool, DatabaseError>;

    /// Overwrite only a live entry. Returns whether it was written.
    async fn cache_replace(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<bool, DatabaseError>;

    async fn cache_delete(&self, key: &str) -> Result<bool, DatabaseError>;

    /// Entries (live or expired) whose key starts with `prefix`.
    async fn cache_keys(&self, prefix: &str) -> Result<Vec<CacheEntryMeta>, DatabaseError>;

    /// Drop expired entries. Returns the number removed.
    async fn cache_purge_expired(&self) -> Result<usize, DatabaseError>;
}
