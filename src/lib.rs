//! Letter Guard: moderation and refinement pipeline for submitted letters.

pub mod api;
pub mod config;
pub mod error;
pub mod gate;
pub mod item;
pub mod jobs;
pub mod learning;
pub mod lease;
pub mod notify;
pub mod pipeline;
pub mod refiner;
pub mod safety;
pub mod store;
pub mod text;
pub mod workflow;
