//! libSQL backend: async `Database`, `JobScheduler` and `TtlCache` implementation.
//!
//! Supports local file and in-memory databases. All timestamps are written
//! as fixed-width RFC 3339 UTC strings so SQL comparisons order correctly.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::{DatabaseError, SchedulerError};
use crate::item::{Item, ItemId};
use crate::store::migrations;
use crate::store::traits::{
    CacheEntryMeta, Database, DecisionLog, DecisionRecord, DiffEvent, ItemFilter, JobScheduler,
    LearnedPattern, Revision, ScheduledJob, ScheduledJobStatus, TtlCache,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for timestamps.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// `now + d`, saturating at a century out.
fn after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or_else(|| now + chrono::Duration::days(36_500))
}

fn to_json(value: &serde_json::Value) -> String {
    // serde_json maps are key-sorted, so equal values serialize identically.
    value.to_string()
}

fn from_json(raw: &str) -> Result<serde_json::Value, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn query_err(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

fn sched_err(op: &'static str) -> impl Fn(libsql::Error) -> SchedulerError {
    move |e| SchedulerError::Unavailable(format!("{op}: {e}"))
}

fn row_to_item(row: &libsql::Row) -> Result<Item, libsql::Error> {
    let created_str: String = row.get(4)?;
    let updated_str: String = row.get(5)?;
    Ok(Item {
        id: ItemId(row.get(0)?),
        kind: row.get(1)?,
        body: row.get(2)?,
        visibility: row.get(3).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_pattern(row: &libsql::Row) -> Result<LearnedPattern, libsql::Error> {
    let active: i64 = row.get(4)?;
    let updated_str: String = row.get(5)?;
    Ok(LearnedPattern {
        pattern_type: row.get(0)?,
        value: row.get(1)?,
        success_count: row.get(2)?,
        failure_count: row.get(3)?,
        is_active: active != 0,
        last_updated: parse_datetime(&updated_str),
    })
}

fn row_to_job(row: &libsql::Row) -> Result<ScheduledJob, SchedulerError> {
    let get_err = |e: libsql::Error| SchedulerError::Unavailable(e.to_string());
    let hook: String = row.get(1).map_err(get_err)?;
    let args_str: String = row.get(2).map_err(get_err)?;
    let status_str: String = row.get(3).map_err(get_err)?;
    let run_str: String = row.get(4).map_err(get_err)?;
    let created_str: String = row.get(5).map_err(get_err)?;
    let claimed_str: Option<String> = row.get(6).ok();

    let args = serde_json::from_str(&args_str).map_err(|e| SchedulerError::InvalidArgs {
        hook: hook.clone(),
        reason: e.to_string(),
    })?;
    let status = match status_str.as_str() {
        "running" => ScheduledJobStatus::Running,
        _ => ScheduledJobStatus::Pending,
    };

    Ok(ScheduledJob {
        id: row.get(0).map_err(get_err)?,
        hook,
        args,
        status,
        run_at: parse_datetime(&run_str),
        created_at: parse_datetime(&created_str),
        claimed_at: parse_optional_datetime(&claimed_str),
    })
}

// ── Database trait implementation ───────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Items ───────────────────────────────────────────────────────

    async fn insert_item(
        &self,
        kind: &str,
        body: &str,
        visibility: Option<&str>,
    ) -> Result<ItemId, DatabaseError> {
        let now = ts(Utc::now());
        let vis: libsql::Value = match visibility {
            Some(v) => libsql::Value::Text(v.to_string()),
            None => libsql::Value::Null,
        };
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO items (kind, body, visibility, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4) RETURNING id",
                params![kind, body, vis, now],
            )
            .await
            .map_err(query_err("insert_item"))?;

        let row = rows
            .next()
            .await
            .map_err(query_err("insert_item"))?
            .ok_or_else(|| DatabaseError::Query("INSERT returned no id".into()))?;
        let id: i64 = row.get(0).map_err(query_err("insert_item"))?;
        debug!(item_id = id, kind, "Item inserted");
        Ok(ItemId(id))
    }

    async fn get_item(&self, id: ItemId) -> Result<Option<Item>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, kind, body, visibility, created_at, updated_at
                 FROM items WHERE id = ?1",
                params![id.0],
            )
            .await
            .map_err(query_err("get_item"))?;

        match rows.next().await.map_err(query_err("get_item"))? {
            Some(row) => Ok(Some(row_to_item(&row).map_err(query_err("get_item"))?)),
            None => Ok(None),
        }
    }

    async fn update_body(&self, id: ItemId, body: &str) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE items SET body = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.0, body, ts(Utc::now())],
            )
            .await
            .map_err(query_err("update_body"))?;
        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "item".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_visibility(&self, id: ItemId, visibility: &str) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE items SET visibility = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.0, visibility, ts(Utc::now())],
            )
            .await
            .map_err(query_err("set_visibility"))?;
        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "item".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<ItemId>, DatabaseError> {
        let mut sql = String::from("SELECT i.id FROM items i WHERE 1 = 1");
        let mut args: Vec<libsql::Value> = Vec::new();

        if let Some(ref kind) = filter.kind {
            args.push(libsql::Value::Text(kind.clone()));
            sql.push_str(&format!(" AND i.kind = ?{}", args.len()));
        }
        if let Some((ref key, ref value)) = filter.attr_equals {
            args.push(libsql::Value::Text(key.clone()));
            args.push(libsql::Value::Text(to_json(value)));
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM item_attributes a
                   WHERE a.item_id = i.id AND a.key = ?{} AND a.value = ?{})",
                args.len() - 1,
                args.len()
            ));
        }
        if let Some(ref key) = filter.has_attr {
            args.push(libsql::Value::Text(key.clone()));
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM item_attributes a
                   WHERE a.item_id = i.id AND a.key = ?{})",
                args.len()
            ));
        }
        if let Some(ref key) = filter.missing_attr {
            args.push(libsql::Value::Text(key.clone()));
            sql.push_str(&format!(
                " AND NOT EXISTS (SELECT 1 FROM item_attributes a
                   WHERE a.item_id = i.id AND a.key = ?{})",
                args.len()
            ));
        }

        // SQLite treats a negative LIMIT as unbounded.
        let limit = if filter.limit == 0 {
            -1
        } else {
            filter.limit as i64
        };
        args.push(libsql::Value::Integer(limit));
        args.push(libsql::Value::Integer(filter.offset as i64));
        sql.push_str(&format!(
            " ORDER BY i.id LIMIT ?{} OFFSET ?{}",
            args.len() - 1,
            args.len()
        ));

        let mut rows = self.conn().query(&sql, args).await.map_err(query_err("list_items"))?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_items"))? {
            ids.push(ItemId(row.get(0).map_err(query_err("list_items"))?));
        }
        Ok(ids)
    }

    // ── Attributes ──────────────────────────────────────────────────

    async fn get_attr(
        &self,
        id: ItemId,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT value FROM item_attributes WHERE item_id = ?1 AND key = ?2",
                params![id.0, key],
            )
            .await
            .map_err(query_err("get_attr"))?;

        match rows.next().await.map_err(query_err("get_attr"))? {
            Some(row) => {
                let raw: String = row.get(0).map_err(query_err("get_attr"))?;
                Ok(Some(from_json(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn set_attr(
        &self,
        id: ItemId,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO item_attributes (item_id, key, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(item_id, key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at",
                params![id.0, key, to_json(value), ts(Utc::now())],
            )
            .await
            .map_err(query_err("set_attr"))?;
        Ok(())
    }

    async fn delete_attr(&self, id: ItemId, key: &str) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "DELETE FROM item_attributes WHERE item_id = ?1 AND key = ?2",
                params![id.0, key],
            )
            .await
            .map_err(query_err("delete_attr"))?;
        Ok(affected > 0)
    }

    async fn get_attrs(
        &self,
        id: ItemId,
    ) -> Result<HashMap<String, serde_json::Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT key, value FROM item_attributes WHERE item_id = ?1",
                params![id.0],
            )
            .await
            .map_err(query_err("get_attrs"))?;

        let mut attrs = HashMap::new();
        while let Some(row) = rows.next().await.map_err(query_err("get_attrs"))? {
            let key: String = row.get(0).map_err(query_err("get_attrs"))?;
            let raw: String = row.get(1).map_err(query_err("get_attrs"))?;
            attrs.insert(key, from_json(&raw)?);
        }
        Ok(attrs)
    }

    async fn compare_and_set_attr(
        &self,
        id: ItemId,
        key: &str,
        expected: Option<&serde_json::Value>,
        value: &serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        let now = ts(Utc::now());
        let affected = match expected {
            Some(expected) => self
                .conn()
                .execute(
                    "UPDATE item_attributes SET value = ?4, updated_at = ?5
                     WHERE item_id = ?1 AND key = ?2 AND value = ?3",
                    params![id.0, key, to_json(expected), to_json(value), now],
                )
                .await
                .map_err(query_err("compare_and_set_attr"))?,
            None => self
                .conn()
                .execute(
                    "INSERT INTO item_attributes (item_id, key, value, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(item_id, key) DO NOTHING",
                    params![id.0, key, to_json(value), now],
                )
                .await
                .map_err(query_err("compare_and_set_attr"))?,
        };
        Ok(affected > 0)
    }

    async fn delete_attr_everywhere(&self, key: &str) -> Result<usize, DatabaseError> {
        let affected = self
            .conn()
            .execute("DELETE FROM item_attributes WHERE key = ?1", params![key])
            .await
            .map_err(query_err("delete_attr_everywhere"))?;
        Ok(affected as usize)
    }

    // ── Revisions ───────────────────────────────────────────────────

    async fn save_revision(&self, id: ItemId, body: &str) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO revisions (item_id, body, created_at) VALUES (?1, ?2, ?3)
                 RETURNING id",
                params![id.0, body, ts(Utc::now())],
            )
            .await
            .map_err(query_err("save_revision"))?;
        let row = rows
            .next()
            .await
            .map_err(query_err("save_revision"))?
            .ok_or_else(|| DatabaseError::Query("INSERT returned no id".into()))?;
        row.get(0).map_err(query_err("save_revision"))
    }

    async fn list_revisions(&self, id: ItemId) -> Result<Vec<Revision>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, item_id, body, created_at FROM revisions
                 WHERE item_id = ?1 ORDER BY id DESC",
                params![id.0],
            )
            .await
            .map_err(query_err("list_revisions"))?;

        let mut revisions = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_revisions"))? {
            let created_str: String = row.get(3).map_err(query_err("list_revisions"))?;
            revisions.push(Revision {
                id: row.get(0).map_err(query_err("list_revisions"))?,
                item_id: ItemId(row.get(1).map_err(query_err("list_revisions"))?),
                body: row.get(2).map_err(query_err("list_revisions"))?,
                created_at: parse_datetime(&created_str),
            });
        }
        Ok(revisions)
    }

    async fn delete_revision(&self, revision_id: i64) -> Result<(), DatabaseError> {
        self.conn()
            .execute("DELETE FROM revisions WHERE id = ?1", params![revision_id])
            .await
            .map_err(query_err("delete_revision"))?;
        Ok(())
    }

    // ── Learned patterns ────────────────────────────────────────────

    async fn record_pattern_failure(
        &self,
        pattern_type: &str,
        value: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO learned_patterns
                    (pattern_type, value, success_count, failure_count, is_active, last_updated)
                 VALUES (?1, ?2, 0, 1, 1, ?3)
                 ON CONFLICT(pattern_type, value) DO UPDATE SET
                    failure_count = failure_count + 1,
                    last_updated = excluded.last_updated",
                params![pattern_type, value, ts(Utc::now())],
            )
            .await
            .map_err(query_err("record_pattern_failure"))?;
        Ok(())
    }

    async fn record_pattern_success(
        &self,
        pattern_type: &str,
        value: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO learned_patterns
                    (pattern_type, value, success_count, failure_count, is_active, last_updated)
                 VALUES (?1, ?2, 1, 0, 1, ?3)
                 ON CONFLICT(pattern_type, value) DO UPDATE SET
                    success_count = success_count + 1,
                    last_updated = excluded.last_updated",
                params![pattern_type, value, ts(Utc::now())],
            )
            .await
            .map_err(query_err("record_pattern_success"))?;
        Ok(())
    }

    async fn list_patterns(
        &self,
        pattern_type: Option<&str>,
    ) -> Result<Vec<LearnedPattern>, DatabaseError> {
        const COLUMNS: &str =
            "SELECT pattern_type, value, success_count, failure_count, is_active, last_updated
             FROM learned_patterns";
        let mut rows = match pattern_type {
            Some(t) => self
                .conn()
                .query(
                    &format!("{COLUMNS} WHERE pattern_type = ?1 ORDER BY value"),
                    params![t],
                )
                .await
                .map_err(query_err("list_patterns"))?,
            None => self
                .conn()
                .query(&format!("{COLUMNS} ORDER BY pattern_type, value"), ())
                .await
                .map_err(query_err("list_patterns"))?,
        };

        let mut patterns = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_patterns"))? {
            patterns.push(row_to_pattern(&row).map_err(query_err("list_patterns"))?);
        }
        Ok(patterns)
    }

    async fn deactivate_exhausted_patterns(
        &self,
        min_samples: i64,
    ) -> Result<usize, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE learned_patterns SET is_active = 0, last_updated = ?2
                 WHERE is_active = 1
                   AND failure_count > 2 * success_count
                   AND success_count + failure_count >= ?1",
                params![min_samples, ts(Utc::now())],
            )
            .await
            .map_err(query_err("deactivate_exhausted_patterns"))?;
        Ok(affected as usize)
    }

    async fn clear_patterns(&self) -> Result<usize, DatabaseError> {
        let affected = self
            .conn()
            .execute("DELETE FROM learned_patterns", ())
            .await
            .map_err(query_err("clear_patterns"))?;
        Ok(affected as usize)
    }

    // ── Learning diff log ───────────────────────────────────────────

    async fn record_diff(&self, event: &DiffEvent) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO learning_events
                    (item_id, change_type, before_value, after_value, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.item_id.0,
                    event.change_type.as_str(),
                    event.before_value.as_str(),
                    event.after_value.as_str(),
                    ts(event.created_at)
                ],
            )
            .await
            .map_err(query_err("record_diff"))?;
        Ok(())
    }

    async fn list_diffs(&self, id: ItemId) -> Result<Vec<DiffEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT item_id, change_type, before_value, after_value, created_at
                 FROM learning_events WHERE item_id = ?1 ORDER BY id",
                params![id.0],
            )
            .await
            .map_err(query_err("list_diffs"))?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_diffs"))? {
            let created_str: String = row.get(4).map_err(query_err("list_diffs"))?;
            events.push(DiffEvent {
                item_id: ItemId(row.get(0).map_err(query_err("list_diffs"))?),
                change_type: row.get(1).map_err(query_err("list_diffs"))?,
                before_value: row.get(2).map_err(query_err("list_diffs"))?,
                after_value: row.get(3).map_err(query_err("list_diffs"))?,
                created_at: parse_datetime(&created_str),
            });
        }
        Ok(events)
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT value FROM settings WHERE key = ?1", params![key])
            .await
            .map_err(query_err("get_setting"))?;

        match rows.next().await.map_err(query_err("get_setting"))? {
            Some(row) => {
                let raw: String = row.get(0).map_err(query_err("get_setting"))?;
                Ok(Some(from_json(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn set_setting(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at",
                params![key, to_json(value), ts(Utc::now())],
            )
            .await
            .map_err(query_err("set_setting"))?;
        Ok(())
    }
}

// ── DecisionLog ─────────────────────────────────────────────────────

#[async_trait]
impl DecisionLog for LibSqlBackend {
    async fn record_decision(&self, record: &DecisionRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO decision_log (item_id, safe, score, reason, decided_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.item_id.0,
                    record.safe as i64,
                    record.score as i64,
                    record.reason.as_str(),
                    ts(record.decided_at)
                ],
            )
            .await
            .map_err(query_err("record_decision"))?;
        Ok(())
    }

    async fn list_decisions(&self, id: ItemId) -> Result<Vec<DecisionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT item_id, safe, score, reason, decided_at FROM decision_log
                 WHERE item_id = ?1 ORDER BY id DESC",
                params![id.0],
            )
            .await
            .map_err(query_err("list_decisions"))?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_decisions"))? {
            let safe: i64 = row.get(1).map_err(query_err("list_decisions"))?;
            let score: i64 = row.get(2).map_err(query_err("list_decisions"))?;
            let decided_str: String = row.get(4).map_err(query_err("list_decisions"))?;
            records.push(DecisionRecord {
                item_id: ItemId(row.get(0).map_err(query_err("list_decisions"))?),
                safe: safe != 0,
                score: score as i32,
                reason: row.get(3).map_err(query_err("list_decisions"))?,
                decided_at: parse_datetime(&decided_str),
            });
        }
        Ok(records)
    }
}

// ── JobScheduler ────────────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, hook, args, status, run_at, created_at, claimed_at";

#[async_trait]
impl JobScheduler for LibSqlBackend {
    async fn schedule(
        &self,
        hook: &str,
        args: &serde_json::Value,
        delay: Duration,
    ) -> Result<i64, SchedulerError> {
        let now = Utc::now();
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO scheduled_jobs (hook, args, status, run_at, created_at)
                 VALUES (?1, ?2, 'pending', ?3, ?4) RETURNING id",
                params![hook, to_json(args), ts(after(now, delay)), ts(now)],
            )
            .await
            .map_err(sched_err("schedule"))?;
        let row = rows
            .next()
            .await
            .map_err(sched_err("schedule"))?
            .ok_or_else(|| SchedulerError::Unavailable("INSERT returned no id".into()))?;
        let id: i64 = row.get(0).map_err(sched_err("schedule"))?;
        debug!(job_id = id, hook, delay_secs = delay.as_secs(), "Job scheduled");
        Ok(id)
    }

    async fn is_scheduled(
        &self,
        hook: &str,
        args: &serde_json::Value,
    ) -> Result<bool, SchedulerError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM scheduled_jobs WHERE hook = ?1 AND args = ?2",
                params![hook, to_json(args)],
            )
            .await
            .map_err(sched_err("is_scheduled"))?;
        let count: i64 = match rows.next().await.map_err(sched_err("is_scheduled"))? {
            Some(row) => row.get(0).map_err(sched_err("is_scheduled"))?,
            None => 0,
        };
        Ok(count > 0)
    }

    async fn cancel(
        &self,
        hook: &str,
        args: Option<&serde_json::Value>,
    ) -> Result<usize, SchedulerError> {
        let affected = match args {
            Some(args) => self
                .conn()
                .execute(
                    "DELETE FROM scheduled_jobs WHERE hook = ?1 AND args = ?2",
                    params![hook, to_json(args)],
                )
                .await
                .map_err(sched_err("cancel"))?,
            None => self
                .conn()
                .execute("DELETE FROM scheduled_jobs WHERE hook = ?1", params![hook])
                .await
                .map_err(sched_err("cancel"))?,
        };
        Ok(affected as usize)
    }

    async fn cancel_job(&self, id: i64) -> Result<bool, SchedulerError> {
        let affected = self
            .conn()
            .execute("DELETE FROM scheduled_jobs WHERE id = ?1", params![id])
            .await
            .map_err(sched_err("cancel_job"))?;
        Ok(affected > 0)
    }

    async fn list_pending(&self, hook: &str) -> Result<Vec<ScheduledJob>, SchedulerError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE hook = ?1 ORDER BY run_at, id"
                ),
                params![hook],
            )
            .await
            .map_err(sched_err("list_pending"))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(sched_err("list_pending"))? {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, SchedulerError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE scheduled_jobs SET status = 'running', claimed_at = ?1
                     WHERE id IN (
                        SELECT id FROM scheduled_jobs
                        WHERE status = 'pending' AND run_at <= ?1
                        ORDER BY run_at, id LIMIT ?2
                     )
                     RETURNING {JOB_COLUMNS}"
                ),
                params![ts(now), limit as i64],
            )
            .await
            .map_err(sched_err("claim_due"))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(sched_err("claim_due"))? {
            jobs.push(row_to_job(&row)?);
        }
        jobs.sort_by(|a, b| a.run_at.cmp(&b.run_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn complete(&self, id: i64) -> Result<(), SchedulerError> {
        self.conn()
            .execute("DELETE FROM scheduled_jobs WHERE id = ?1", params![id])
            .await
            .map_err(sched_err("complete"))?;
        Ok(())
    }
}

// ── TtlCache ────────────────────────────────────────────────────────

#[async_trait]
impl TtlCache for LibSqlBackend {
    async fn cache_get(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT value FROM cache_entries WHERE key = ?1 AND expires_at > ?2",
                params![key, ts(Utc::now())],
            )
            .await
            .map_err(query_err("cache_get"))?;

        match rows.next().await.map_err(query_err("cache_get"))? {
            Some(row) => {
                let raw: String = row.get(0).map_err(query_err("cache_get"))?;
                Ok(Some(from_json(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn cache_set(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now();
        self.conn()
            .execute(
                "INSERT INTO cache_entries (key, value, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    expires_at = excluded.expires_at",
                params![key, to_json(value), ts(now), ts(after(now, ttl))],
            )
            .await
            .map_err(query_err("cache_set"))?;
        Ok(())
    }

    async fn cache_add(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now();
        let affected = self
            .conn()
            .execute(
                "INSERT INTO cache_entries (key, value, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    created_at = excluded.created_at,
                    expires_at = excluded.expires_at
                 WHERE cache_entries.expires_at <= excluded.created_at",
                params![key, to_json(value), ts(now), ts(after(now, ttl))],
            )
            .await
            .map_err(query_err("cache_add"))?;
        Ok(affected > 0)
    }

    async fn cache_replace(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now();
        let affected = self
            .conn()
            .execute(
                "UPDATE cache_entries SET value = ?2, expires_at = ?4
                 WHERE key = ?1 AND expires_at > ?3",
                params![key, to_json(value), ts(now), ts(after(now, ttl))],
            )
            .await
            .map_err(query_err("cache_replace"))?;
        Ok(affected > 0)
    }

    async fn cache_delete(&self, key: &str) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute("DELETE FROM cache_entries WHERE key = ?1", params![key])
            .await
            .map_err(query_err("cache_delete"))?;
        Ok(affected > 0)
    }

    async fn cache_keys(&self, prefix: &str) -> Result<Vec<CacheEntryMeta>, DatabaseError> {
        // substr() instead of LIKE: key prefixes contain `_`.
        let mut rows = self
            .conn()
            .query(
                "SELECT key, created_at, expires_at FROM cache_entries
                 WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
                params![prefix],
            )
            .await
            .map_err(query_err("cache_keys"))?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("cache_keys"))? {
            let created_str: String = row.get(1).map_err(query_err("cache_keys"))?;
            let expires_str: String = row.get(2).map_err(query_err("cache_keys"))?;
            entries.push(CacheEntryMeta {
                key: row.get(0).map_err(query_err("cache_keys"))?,
                created_at: parse_datetime(&created_str),
                expires_at: parse_datetime(&expires_str),
            });
        }
        Ok(entries)
    }

    async fn cache_purge_expired(&self) -> Result<usize, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "DELETE FROM cache_entries WHERE expires_at <= ?1",
                params![ts(Utc::now())],
            )
            .await
            .map_err(query_err("cache_purge_expired"))?;
        Ok(affected as usize)
    }
}
