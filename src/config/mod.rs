// src/config/mod.rs
pub mod scoring;

pub use scoring::{
    mock_mode_enabled, EnsembleConfig, JobConfig, PerspectiveEndpoint, PromptVariant,
    ResilienceConfig, ScoringConfig,
};
