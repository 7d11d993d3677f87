//! Error taxonomy shared by the resilient client, the gateways, the ensemble
//! scorer and the re-analysis jobs.
//!
//! Every variant maps to a stable `code()` that is used in API bodies, job
//! error messages and metric labels, so callers never have to match on
//! `Display` output.

use std::time::Duration;

use thiserror::Error;

use crate::model::Perspective;

pub type Result<T> = std::result::Result<T, ScoringError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScoringError {
    /// Bad article or job input (non-positive id, empty body, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A perspective model answered with a value that cannot be trusted.
    #[error("invalid model output from {perspective}: {detail}")]
    InvalidModelOutput { perspective: String, detail: String },

    #[error("all perspectives returned unusable scores")]
    AllPerspectivesInvalid,

    /// Every perspective call failed before producing output. Each cause is
    /// kept so auth and configuration faults stay visible to job consumers.
    #[error("all perspective calls failed: {}", describe_causes(.causes))]
    AllUpstreamsFailed {
        causes: Vec<(Perspective, ScoringError)>,
    },

    #[error("all usable perspectives reported zero confidence")]
    AllScoresZeroConfidence,

    /// Retryable timeouts exhausted every attempt.
    #[error("upstream {endpoint} timed out after {attempts} attempt(s)")]
    UpstreamTimeout { endpoint: String, attempts: u32 },

    /// Connection failures or 5xx responses exhausted every attempt.
    #[error("upstream {endpoint} unavailable after {attempts} attempt(s): {detail}")]
    UpstreamUnavailable {
        endpoint: String,
        attempts: u32,
        detail: String,
    },

    /// Fatal upstream answer (auth failure, malformed request, other 4xx).
    #[error("upstream {endpoint} rejected the request ({status}): {message}")]
    UpstreamRejected {
        endpoint: String,
        status: u16,
        message: String,
    },

    /// 429 on every configured credential.
    #[error("upstream {endpoint} rate limited")]
    UpstreamRateLimit {
        endpoint: String,
        retry_after: Option<Duration>,
    },

    /// Fast-fail while the endpoint's circuit is open; no network attempt was made.
    #[error("circuit open for {endpoint}")]
    CircuitOpen {
        endpoint: String,
        retry_in: Option<Duration>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// Recovered worker faults and other invariant breaks.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ScoringError {
    pub fn code(&self) -> &'static str {
        match self {
            ScoringError::Validation(_) => "validation",
            ScoringError::InvalidModelOutput { .. } => "invalid_model_output",
            ScoringError::AllPerspectivesInvalid => "all_perspectives_invalid",
            ScoringError::AllUpstreamsFailed { .. } => "all_upstreams_failed",
            ScoringError::AllScoresZeroConfidence => "all_scores_zero_confidence",
            ScoringError::UpstreamTimeout { .. } => "upstream_timeout",
            ScoringError::UpstreamUnavailable { .. } => "upstream_unavailable",
            ScoringError::UpstreamRejected { .. } => "upstream_rejected",
            ScoringError::UpstreamRateLimit { .. } => "upstream_rate_limit",
            ScoringError::CircuitOpen { .. } => "circuit_open",
            ScoringError::NotFound(_) => "not_found",
            ScoringError::Storage(_) => "storage",
            ScoringError::Internal(_) => "internal",
        }
    }

    /// True for the classes a caller may reasonably try again later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScoringError::UpstreamTimeout { .. }
                | ScoringError::UpstreamUnavailable { .. }
                | ScoringError::UpstreamRateLimit { .. }
                | ScoringError::CircuitOpen { .. }
        ) || matches!(
            self,
            ScoringError::AllUpstreamsFailed { causes }
                if !causes.is_empty() && causes.iter().all(|(_, e)| e.is_transient())
        )
    }

    /// Message shown to end users in job progress events.
    pub fn user_message(&self) -> String {
        match self {
            ScoringError::AllPerspectivesInvalid => {
                "No perspective model returned a usable score".to_string()
            }
            ScoringError::AllUpstreamsFailed { causes } => format!(
                "Every perspective service failed ({})",
                describe_causes(causes)
            ),
            ScoringError::AllScoresZeroConfidence => {
                "Every perspective model reported zero confidence".to_string()
            }
            ScoringError::UpstreamRateLimit { .. } => {
                "Scoring service is rate limited, try again later".to_string()
            }
            ScoringError::CircuitOpen { .. } => {
                "Scoring service is temporarily unavailable".to_string()
            }
            ScoringError::Internal(_) => "Internal error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

/// `left: upstream_rejected, center: circuit_open`
fn describe_causes(causes: &[(Perspective, ScoringError)]) -> String {
    causes
        .iter()
        .map(|(p, e)| format!("{p}: {}", e.code()))
        .collect::<Vec<_>>()
        .join(", ")
}
