//! Content refiner: HTML cleanup, spacing and capitalization normalization,
//! then greeting and paragraph structure. Each step consults the learned
//! exceptions in the active [`PatternSet`](crate::learning::PatternSet).

pub mod engine;
pub mod html;
pub mod normalize;
pub mod structure;

pub use engine::{RefineOutcome, Refiner, refine_text};
pub use html::clean_html;
pub use normalize::normalize;
pub use structure::{DEFAULT_GREETING, apply_structure, has_greeting, wrap_paragraphs};
