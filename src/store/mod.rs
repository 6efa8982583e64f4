//! Persistence layer: libSQL-backed storage for items, patterns, jobs and cache.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    CacheEntryMeta, Database, DecisionLog, DecisionRecord, DiffEvent, ItemFilter, JobScheduler,
    LearnedPattern, NoopDecisionLog, Revision, ScheduledJob, ScheduledJobStatus, TtlCache,
};
