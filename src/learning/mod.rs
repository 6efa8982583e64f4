//! Learning engine.
//!
//! Compares the refiner's snapshot with the text a human published and turns
//! each correction into a learned exception. The refiner reads the active
//! exceptions through a [`PatternProvider`].

pub mod engine;
pub mod maintenance;
pub mod pattern;
pub mod provider;

pub use engine::{LearningEngine, Observation, compare};
pub use maintenance::MaintenanceReport;
pub use pattern::{PatternKind, PatternStats, confidence, looks_like_proper_noun};
pub use provider::{
    CachedPatternProvider, NoopPatternProvider, PatternProvider, PatternSet,
    StaticPatternProvider,
};
