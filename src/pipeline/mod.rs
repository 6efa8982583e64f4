//! Moderation pipeline.
//!
//! Every letter flows through:
//! 1. `Refiner::refine()`, normalization with learned exceptions
//! 2. `SafetyScanner::scan()`, context-weighted safety scoring
//! 3. `AutoApprovalGate::evaluate()`, publish or quarantine
//!
//! Stage changes are only ever requested; the workflow decides.

pub mod processor;
pub mod types;

pub use processor::ModerationPipeline;
pub use types::{BulkAction, ProcessOutcome};
