//! Bulk job tokens: the TTL-bound handle for one unit-of-work list.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::item::{Actor, ItemId};
use crate::pipeline::BulkAction;
use crate::store::TtlCache;

pub const TOKEN_PREFIX: &str = "bulk_token:";
pub const LEASE_PREFIX: &str = "bulk_lease:";

/// What a token does to each of its items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// Full pipeline run regardless of stage.
    Rescan,
    /// Full pipeline run for items still waiting in `unprocessed`.
    Backlog,
    /// Administrative bulk action.
    Action { action: BulkAction },
    /// Re-run quarantined items.
    QuarantineResweep,
}

impl JobKind {
    pub fn label(&self) -> String {
        match self {
            Self::Rescan => "rescan".into(),
            Self::Backlog => "backlog".into(),
            Self::Action { action } => format!("action:{action}"),
            Self::QuarantineResweep => "quarantine_resweep".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkJobToken {
    pub id: String,
    pub kind: JobKind,
    pub item_ids: Vec<ItemId>,
    pub actor: Actor,
    /// Batches run so far.
    pub batch_count: u32,
    /// Offset the next continuation must carry.
    #[serde(default)]
    pub next_offset: usize,
    pub created_at: DateTime<Utc>,
}

/// Result of reading a token back from the cache.
#[derive(Debug)]
pub enum TokenLookup {
    Found(BulkJobToken),
    Missing,
    /// Present but undecodable. Carries the decode error.
    Malformed(String),
}

impl BulkJobToken {
    pub fn new(kind: JobKind, item_ids: Vec<ItemId>, actor: Actor) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            kind,
            item_ids,
            actor,
            batch_count: 0,
            next_offset: 0,
            created_at: Utc::now(),
        }
    }

    pub fn cache_key(id: &str) -> String {
        format!("{TOKEN_PREFIX}{id}")
    }

    pub fn lease_key(id: &str) -> String {
        format!("{LEASE_PREFIX}{id}")
    }

    pub fn remaining_items(&self) -> usize {
        self.item_ids.len().saturating_sub(self.next_offset)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub async fn load(cache: &dyn TtlCache, id: &str) -> Result<TokenLookup, DatabaseError> {
        let Some(raw) = cache.cache_get(&Self::cache_key(id)).await? else {
            return Ok(TokenLookup::Missing);
        };
        match serde_json::from_value::<BulkJobToken>(raw) {
            Ok(token) if token.id == id => Ok(TokenLookup::Found(token)),
            Ok(token) => Ok(TokenLookup::Malformed(format!(
                "stored under {id} but names {}",
                token.id
            ))),
            Err(e) => Ok(TokenLookup::Malformed(e.to_string())),
        }
    }

    /// Write the token with whatever is left of `ttl` since creation.
    pub async fn save(&self, cache: &dyn TtlCache, ttl: Duration) -> Result<(), DatabaseError> {
        let remaining = ttl.saturating_sub(self.age(Utc::now()));
        if remaining.is_zero() {
            warn!(token = %self.id, "Token outlived its TTL; not saving");
            return Ok(());
        }
        let value = serde_json::to_value(self)
            .map_err(|e| DatabaseError::Serialization(format!("token {}: {e}", self.id)))?;
        cache.cache_set(&Self::cache_key(&self.id), &value, remaining).await
    }

    /// Like `save`, but never recreates a token that was deleted or expired.
    /// Returns whether the token was written.
    pub async fn update(&self, cache: &dyn TtlCache, ttl: Duration) -> Result<bool, DatabaseError> {
        let remaining = ttl.saturating_sub(self.age(Utc::now()));
        if remaining.is_zero() {
            return Ok(false);
        }
        let value = serde_json::to_value(self)
            .map_err(|e| DatabaseError::Serialization(format!("token {}: {e}", self.id)))?;
        cache
            .cache_replace(&Self::cache_key(&self.id), &value, remaining)
            .await
    }

    pub async fn delete(cache: &dyn TtlCache, id: &str) -> Result<bool, DatabaseError> {
        cache.cache_delete(&Self::cache_key(id)).await
    }

    /// Token ID from a cache key, if it is a token key.
    pub fn id_from_key(key: &str) -> Option<&str> {
        key.strip_prefix(TOKEN_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    #[test]
    fn kind_serializes_with_type_tag() {
        let kind = JobKind::Action {
            action: BulkAction::Archive,
        };
        assert_eq!(
            serde_json::to_value(kind).unwrap(),
            serde_json::json!({"type": "action", "action": "archive"})
        );
        assert_eq!(kind.label(), "action:archive");
        assert_eq!(
            serde_json::to_value(JobKind::QuarantineResweep).unwrap(),
            serde_json::json!({"type": "quarantine_resweep"})
        );
    }

    #[tokio::test]
    async fn save_load_delete() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let token = BulkJobToken::new(
            JobKind::Rescan,
            vec![ItemId(1), ItemId(2)],
            Actor::admin("mod"),
        );
        token.save(&db, Duration::from_secs(3600)).await.unwrap();

        match BulkJobToken::load(&db, &token.id).await.unwrap() {
            TokenLookup::Found(loaded) => assert_eq!(loaded, token),
            other => panic!("expected token, got {other:?}"),
        }
        assert!(BulkJobToken::delete(&db, &token.id).await.unwrap());
        assert!(matches!(
            BulkJobToken::load(&db, &token.id).await.unwrap(),
            TokenLookup::Missing
        ));
    }

    #[tokio::test]
    async fn update_leaves_deleted_token_deleted() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let ttl = Duration::from_secs(3600);
        let mut token = BulkJobToken::new(JobKind::Rescan, vec![ItemId(1)], Actor::admin("mod"));
        token.save(&db, ttl).await.unwrap();

        token.next_offset = 1;
        assert!(token.update(&db, ttl).await.unwrap());
        match BulkJobToken::load(&db, &token.id).await.unwrap() {
            TokenLookup::Found(loaded) => assert_eq!(loaded.next_offset, 1),
            other => panic!("expected token, got {other:?}"),
        }

        BulkJobToken::delete(&db, &token.id).await.unwrap();
        assert!(!token.update(&db, ttl).await.unwrap());
        assert!(matches!(
            BulkJobToken::load(&db, &token.id).await.unwrap(),
            TokenLookup::Missing
        ));
    }

    #[tokio::test]
    async fn garbage_payload_is_malformed() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.cache_set(
            &BulkJobToken::cache_key("bad"),
            &serde_json::json!({"id": "bad", "item_ids": "nope"}),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        assert!(matches!(
            BulkJobToken::load(&db, "bad").await.unwrap(),
            TokenLookup::Malformed(_)
        ));
    }

    #[test]
    fn key_helpers() {
        let key = BulkJobToken::cache_key("abc");
        assert_eq!(BulkJobToken::id_from_key(&key), Some("abc"));
        assert_eq!(BulkJobToken::id_from_key("bulk_lease:abc"), None);
    }
}
