//! Safety scanner: multi-phase heuristic analysis of letter text.
//!
//! Phases, in order:
//! 1. Context analysis (positive/negative language, pronoun framing, tense)
//! 2. Sentence segmentation
//! 3. Per-sentence encouragement, dehumanizing and abusive checks, skipped for
//!    self-directed sentences
//! 4. Instant-block checks (spam, script markers, blocked link domains)
//! 5. Imminent danger (method and timing together)

pub mod context;
pub mod rules;
pub mod scanner;
pub mod types;

pub use rules::{Category, Rule, RuleBook, STANDARD_RULES};
pub use scanner::{SafetyScanner, decision_threshold, severity};
pub use types::{ContextSummary, Flag, ScanResult};
