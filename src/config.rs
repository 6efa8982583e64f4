//! Configuration types.
//!
//! Every section has a `Default` holding the production constants and a
//! `from_env()` that overrides individual values from `LETTER_GUARD_*`
//! variables. Unparsable values fall back to the default with a warning.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "Unparsable configuration value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(key, default.as_secs()))
}

/// Safety scanner tuning.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Link domains that are blocked outright.
    pub blocked_domains: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            blocked_domains: [
                "bit.ly", "tinyurl.com", "goo.gl", "t.me", "ow.ly", "is.gd", "cutt.ly",
            ]
            .iter()
            .map(|d| d.to_string())
            .collect(),
        }
    }
}

impl ScannerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("LETTER_GUARD_BLOCKED_DOMAINS") {
            config.blocked_domains = raw
                .split(',')
                .map(|d| d.trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect();
        }
        config
    }
}

/// Auto-approval gate tuning.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Minimum score (0-100) for automatic publication.
    pub min_score: i32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self { min_score: 60 }
    }
}

impl GateConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            min_score: env_or("LETTER_GUARD_GATE_MIN_SCORE", d.min_score).clamp(0, 100),
        }
    }
}

/// Workflow state machine tuning.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// A processing lock older than this is considered crashed.
    pub stale_lock_after: Duration,
    /// Number of audit entries kept per item.
    pub audit_log_cap: usize,
    /// How often stale processing locks are looked for.
    pub lock_sweep_interval: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            stale_lock_after: Duration::from_secs(15 * 60),
            audit_log_cap: 100,
            lock_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl WorkflowConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            stale_lock_after: env_secs("LETTER_GUARD_STALE_LOCK_SECS", d.stale_lock_after),
            audit_log_cap: d.audit_log_cap,
            lock_sweep_interval: env_secs(
                "LETTER_GUARD_LOCK_SWEEP_SECS",
                d.lock_sweep_interval,
            )
            .max(Duration::from_secs(1)),
        }
    }
}

/// Batch job runner tuning.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    /// Ceiling on batches per token before the runner aborts it.
    pub max_batches: u32,
    /// Wall-clock ceiling for one batch.
    pub max_batch_duration: Duration,
    pub continuation_delay: Duration,
    /// Upper bound of random jitter added to the continuation delay.
    pub continuation_jitter: Duration,
    pub token_ttl: Duration,
    /// Pending scheduler entries older than this are treated as zombies.
    pub zombie_after: Duration,
    /// How often the dispatcher polls the scheduler for due jobs.
    pub poll_interval: Duration,
    /// Jobs claimed per dispatcher poll.
    pub claim_limit: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            max_batches: 500,
            max_batch_duration: Duration::from_secs(5 * 60),
            continuation_delay: Duration::from_secs(5),
            continuation_jitter: Duration::from_secs(2),
            token_ttl: Duration::from_secs(24 * 3600),
            zombie_after: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(2),
            claim_limit: 4,
        }
    }
}

impl BatchConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            batch_size: env_or("LETTER_GUARD_BATCH_SIZE", d.batch_size).max(1),
            max_batches: env_or("LETTER_GUARD_MAX_BATCHES", d.max_batches).max(1),
            max_batch_duration: env_secs("LETTER_GUARD_BATCH_MAX_SECS", d.max_batch_duration),
            continuation_delay: env_secs("LETTER_GUARD_CONTINUATION_SECS", d.continuation_delay),
            continuation_jitter: d.continuation_jitter,
            token_ttl: env_secs("LETTER_GUARD_TOKEN_TTL_SECS", d.token_ttl),
            zombie_after: env_secs("LETTER_GUARD_ZOMBIE_SECS", d.zombie_after),
            poll_interval: env_secs("LETTER_GUARD_POLL_SECS", d.poll_interval),
            claim_limit: env_or("LETTER_GUARD_CLAIM_LIMIT", d.claim_limit).max(1),
        }
    }
}

/// Learning engine tuning.
#[derive(Debug, Clone)]
pub struct LearningConfig {
    pub pattern_cache_ttl: Duration,
    /// Automation snapshots older than this on unpublished items are dropped.
    pub snapshot_retention: Duration,
    /// Minimum samples before a pattern may be deactivated.
    pub min_samples_for_deactivation: i64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            pattern_cache_ttl: Duration::from_secs(3600),
            snapshot_retention: Duration::from_secs(30 * 24 * 3600),
            min_samples_for_deactivation: 6,
        }
    }
}

impl LearningConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            pattern_cache_ttl: env_secs("LETTER_GUARD_PATTERN_CACHE_SECS", d.pattern_cache_ttl),
            snapshot_retention: Duration::from_secs(
                env_or("LETTER_GUARD_SNAPSHOT_RETENTION_DAYS", 30u64) * 24 * 3600,
            ),
            min_samples_for_deactivation: d.min_samples_for_deactivation,
        }
    }
}

/// Daily maintenance schedule.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    /// Six-field cron expression (seconds first), evaluated in UTC.
    pub schedule: String,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: "0 30 3 * * *".to_string(),
        }
    }
}

impl MaintenanceConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            enabled: env_or("LETTER_GUARD_MAINTENANCE_ENABLED", d.enabled),
            schedule: std::env::var("LETTER_GUARD_MAINTENANCE_CRON").unwrap_or(d.schedule),
        }
    }

    /// Reject schedules the `cron` crate cannot parse.
    pub fn validate(&self) -> Result<(), ConfigError> {
        cron::Schedule::from_str(&self.schedule)
            .map(|_| ())
            .map_err(|e| ConfigError::InvalidSchedule {
                schedule: self.schedule.clone(),
                reason: e.to_string(),
            })
    }
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct ModerationConfig {
    pub db_path: PathBuf,
    pub http_port: u16,
    pub scanner: ScannerConfig,
    pub gate: GateConfig,
    pub workflow: WorkflowConfig,
    pub batch: BatchConfig,
    pub learning: LearningConfig,
    pub maintenance: MaintenanceConfig,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/letter-guard.db"),
            http_port: 8088,
            scanner: ScannerConfig::default(),
            gate: GateConfig::default(),
            workflow: WorkflowConfig::default(),
            batch: BatchConfig::default(),
            learning: LearningConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl ModerationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            db_path: std::env::var("LETTER_GUARD_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.db_path),
            http_port: env_or("LETTER_GUARD_HTTP_PORT", d.http_port),
            scanner: ScannerConfig::from_env(),
            gate: GateConfig::from_env(),
            workflow: WorkflowConfig::from_env(),
            batch: BatchConfig::from_env(),
            learning: LearningConfig::from_env(),
            maintenance: MaintenanceConfig::from_env(),
        };
        config.maintenance.validate()?;
        if config.batch.max_batch_duration.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "LETTER_GUARD_BATCH_MAX_SECS".into(),
                message: "a batch needs a non-zero time budget".into(),
            });
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let c = ModerationConfig::default();
        assert_eq!(c.gate.min_score, 60);
        assert_eq!(c.batch.batch_size, 25);
        assert_eq!(c.batch.max_batches, 500);
        assert_eq!(c.workflow.stale_lock_after, Duration::from_secs(900));
        assert_eq!(c.workflow.lock_sweep_interval, Duration::from_secs(60));
        assert_eq!(c.workflow.audit_log_cap, 100);
        assert_eq!(c.batch.token_ttl, Duration::from_secs(86_400));
        assert_eq!(c.learning.pattern_cache_ttl, Duration::from_secs(3600));
        assert_eq!(c.learning.min_samples_for_deactivation, 6);
    }

    #[test]
    fn default_schedule_is_valid() {
        assert!(MaintenanceConfig::default().validate().is_ok());
    }

    #[test]
    fn bad_schedule_rejected() {
        let config = MaintenanceConfig {
            enabled: true,
            schedule: "every day at noon".into(),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSchedule { .. })
        ));
    }
}
