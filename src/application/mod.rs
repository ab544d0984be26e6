//! Request handling: the orchestrator, the engine seam and background jobs.

pub mod context;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod orchestrator;
