//! Error types for Letter Guard.

use std::time::Duration;

use crate::item::ItemId;

/// Top-level error type for the moderation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Refine error: {0}")]
    Refine(#[from] RefineError),

    #[error("Learning error: {0}")]
    Learning(#[from] LearningError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid cron schedule '{schedule}': {reason}")]
    InvalidSchedule { schedule: String, reason: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Workflow state machine errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Invalid item {id}: {reason}")]
    InvalidItem { id: ItemId, reason: String },

    #[error("Item {id} is locked by {holder} for another {remaining:?}")]
    Locked {
        id: ItemId,
        holder: String,
        remaining: Duration,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Content refiner errors.
#[derive(Debug, thiserror::Error)]
pub enum RefineError {
    #[error("Item {0} not found")]
    NotFound(ItemId),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

/// Learning engine errors.
#[derive(Debug, thiserror::Error)]
pub enum LearningError {
    #[error("Unknown pattern type: {0}")]
    UnknownPatternType(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Batch job errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid job input: {0}")]
    InvalidInput(String),

    #[error("Token {token} exceeded the batch ceiling of {max}")]
    RunawayToken { token: String, max: u32 },

    #[error("Reset refused: {0}")]
    ResetRefused(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Durable job scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid job arguments for hook {hook}: {reason}")]
    InvalidArgs { hook: String, reason: String },
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
