// src/lib.rs
// Public library surface for integration tests and the Shuttle binary.

pub mod api;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod model;
pub mod perspective;
pub mod resilient;
pub mod store;
pub mod telemetry;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::ensemble::EnsembleScorer;
pub use crate::error::{Result, ScoringError};
pub use crate::jobs::{ReanalysisJobManager, TriggerOutcome};
pub use crate::resilient::ResilientClient;
pub use crate::store::{InMemoryScoreStore, ScoreStore};
