//! Workflow state machine: the single source of truth for an item's stage.
//!
//! Automated components never write stages directly. They call
//! [`Workflow::request_transition`], which defers requests made while the
//! item is locked for processing and arbitrates them on release.

pub mod machine;
pub mod migration;
pub mod stage;

pub use machine::{StageObserver, Workflow, arbitrate_deferred, automation_allows};
pub use migration::{InferenceSource, MigrationReport, infer_legacy_stage};
pub use stage::{AuditEntry, StageChange, StageRequest, TransitionOutcome, WorkflowStage};
