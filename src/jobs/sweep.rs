//! Daily sweep of expired tokens, dead leases and zombie scheduler entries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::runner::{BatchRunner, RUN_BULK_HOOK, parse_continuation_args};
use super::token::{BulkJobToken, LEASE_PREFIX, TOKEN_PREFIX, TokenLookup};
use crate::error::JobError;
use crate::lease::Lease;
use crate::store::{ScheduledJob, ScheduledJobStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Cache entries past their own TTL.
    pub expired_entries: usize,
    /// Tokens older than the token TTL or undecodable.
    pub tokens_removed: usize,
    pub leases_released: usize,
    /// Entries stuck pending or running past the zombie window.
    pub zombies_cancelled: usize,
    /// Entries whose token no longer exists.
    pub orphans_cancelled: usize,
}

fn older_than(then: DateTime<Utc>, now: DateTime<Utc>, window: std::time::Duration) -> bool {
    now.signed_duration_since(then)
        .to_std()
        .is_ok_and(|age| age >= window)
}

impl BatchRunner {
    pub async fn sweep(&self) -> Result<SweepReport, JobError> {
        let now = Utc::now();
        let config = self.config();
        let cache = self.cache().as_ref();
        let mut report = SweepReport {
            expired_entries: cache.cache_purge_expired().await?,
            ..Default::default()
        };

        for entry in cache.cache_keys(TOKEN_PREFIX).await? {
            let Some(id) = BulkJobToken::id_from_key(&entry.key) else {
                continue;
            };
            let expired = match BulkJobToken::load(cache, id).await? {
                TokenLookup::Found(token) => older_than(token.created_at, now, config.token_ttl),
                TokenLookup::Malformed(_) => true,
                TokenLookup::Missing => false,
            };
            if expired && BulkJobToken::delete(cache, id).await? {
                debug!(token = %id, "Expired token removed");
                report.tokens_removed += 1;
            }
        }

        for entry in cache.cache_keys(LEASE_PREFIX).await? {
            let dead = match cache.cache_get(&entry.key).await? {
                Some(raw) => serde_json::from_value::<Lease>(raw).map_or(true, |l| l.is_expired(now)),
                None => false,
            };
            if dead && cache.cache_delete(&entry.key).await? {
                debug!(key = %entry.key, "Dead token lease released");
                report.leases_released += 1;
            }
        }

        for job in self.scheduler().list_pending(RUN_BULK_HOOK).await? {
            match self.classify(&job, now).await? {
                Some(Dead::Zombie) => report.zombies_cancelled += 1,
                Some(Dead::Orphan) => report.orphans_cancelled += 1,
                None => continue,
            }
            if !self.scheduler().cancel_job(job.id).await? {
                warn!(job_id = job.id, "Scheduler entry vanished before cancel");
            }
        }

        if report != SweepReport::default() {
            info!(
                expired = report.expired_entries,
                tokens = report.tokens_removed,
                leases = report.leases_released,
                zombies = report.zombies_cancelled,
                orphans = report.orphans_cancelled,
                "Job sweep finished"
            );
        }
        Ok(report)
    }

    async fn classify(&self, job: &ScheduledJob, now: DateTime<Utc>) -> Result<Option<Dead>, JobError> {
        let window = self.config().zombie_after;
        let stuck = match job.status {
            ScheduledJobStatus::Pending => older_than(job.created_at, now, window),
            ScheduledJobStatus::Running => job
                .claimed_at
                .is_none_or(|claimed| older_than(claimed, now, window)),
        };
        if stuck {
            return Ok(Some(Dead::Zombie));
        }

        let Ok((token, _)) = parse_continuation_args(&job.args) else {
            return Ok(Some(Dead::Orphan));
        };
        match BulkJobToken::load(self.cache().as_ref(), &token).await? {
            TokenLookup::Missing => Ok(Some(Dead::Orphan)),
            _ => Ok(None),
        }
    }
}

enum Dead {
    Zombie,
    Orphan,
}
