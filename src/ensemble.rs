//! Ensemble scorer: fan out to the three perspective scorers, wait for all of
//! them, then aggregate the usable readings into one composite.
//!
//! `aggregate` is pure and carries all the math; `analyze` only orchestrates.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use metrics::counter;
use serde_json::json;

use crate::config::{EnsembleConfig, ScoringConfig};
use crate::error::{Result, ScoringError};
use crate::metrics::ensure_metrics_described;
use crate::model::{
    is_valid_confidence, is_valid_score, BreakdownStatus, CompositeResult, Perspective,
    PerspectiveBreakdown, ScoreValue,
};
use crate::perspective::{PerspectiveGateway, PerspectiveOutcome, PerspectiveScorer};
use crate::resilient::{CircuitSnapshot, Transport};

/// What one scorer produced: an outcome, or the upstream error that prevented one.
pub type GatewayResult = Result<PerspectiveOutcome>;

pub struct EnsembleScorer {
    scorers: Vec<Arc<dyn PerspectiveScorer>>,
    config: EnsembleConfig,
}

impl EnsembleScorer {
    /// Requires exactly one scorer per perspective. Broken thresholds or
    /// weights in `config` are replaced by defaults.
    pub fn new(scorers: Vec<Arc<dyn PerspectiveScorer>>, config: EnsembleConfig) -> Result<Self> {
        for p in Perspective::ALL {
            let n = scorers.iter().filter(|s| s.perspective() == p).count();
            if n != 1 {
                return Err(ScoringError::Validation(format!(
                    "expected exactly one scorer for {p}, got {n}"
                )));
            }
        }
        if scorers.len() != Perspective::ALL.len() {
            return Err(ScoringError::Validation(format!(
                "expected {} scorers, got {}",
                Perspective::ALL.len(),
                scorers.len()
            )));
        }
        Ok(Self {
            scorers,
            config: config.sanitized(),
        })
    }

    /// Gateways for every configured perspective, each with its own client.
    pub fn from_config<F>(cfg: &ScoringConfig, mut transport_for: F) -> Result<Self>
    where
        F: FnMut(Perspective) -> Arc<dyn Transport>,
    {
        let scorers = cfg
            .perspectives
            .iter()
            .map(|ep| {
                let gw = PerspectiveGateway::from_config(
                    ep,
                    transport_for(ep.perspective),
                    &cfg.resilience,
                );
                Arc::new(gw) as Arc<dyn PerspectiveScorer>
            })
            .collect();
        Self::new(scorers, cfg.ensemble.clone())
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// Breaker state per perspective, in perspective order.
    pub fn circuits(&self) -> Vec<(Perspective, Option<CircuitSnapshot>)> {
        let mut out: Vec<_> = self
            .scorers
            .iter()
            .map(|s| (s.perspective(), s.circuit()))
            .collect();
        out.sort_by_key(|(p, _)| *p);
        out
    }

    pub async fn analyze(&self, article_text: &str) -> Result<CompositeResult> {
        self.analyze_with_progress(article_text, |_, _| {}).await
    }

    /// Like `analyze`, calling `on_resolved` as each perspective finishes.
    pub async fn analyze_with_progress<F>(
        &self,
        article_text: &str,
        mut on_resolved: F,
    ) -> Result<CompositeResult>
    where
        F: FnMut(Perspective, &GatewayResult),
    {
        ensure_metrics_described();
        if article_text.trim().is_empty() {
            return Err(ScoringError::Validation("article text is empty".into()));
        }

        let mut pending: FuturesUnordered<_> = self
            .scorers
            .iter()
            .map(|s| async move { (s.perspective(), s.score(article_text).await) })
            .collect();

        let mut outcomes = Vec::with_capacity(self.scorers.len());
        while let Some((perspective, result)) = pending.next().await {
            on_resolved(perspective, &result);
            outcomes.push((perspective, result));
        }

        let result = aggregate(outcomes, &self.config);
        let outcome = match &result {
            Ok(r) if r.uncertainty_flag => "uncertain",
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        counter!("ensemble_analyses_total", "outcome" => outcome).increment(1);
        result
    }
}

/// Aggregate resolved perspectives into a composite.
///
/// Usable means a finite score in [-1, 1] plus a present, finite confidence
/// in [0, 1]. Zero confidence is usable but carries no weight. A weight set
/// that sums to zero is treated as the default one.
pub fn aggregate(
    mut outcomes: Vec<(Perspective, GatewayResult)>,
    cfg: &EnsembleConfig,
) -> Result<CompositeResult> {
    let cfg = &cfg.clone().sanitized();
    outcomes.sort_by_key(|(p, _)| *p);
    let total = outcomes.len();
    let failures: Vec<(Perspective, ScoringError)> = outcomes
        .iter()
        .filter_map(|(p, r)| r.as_ref().err().map(|e| (*p, e.clone())))
        .collect();
    let breakdown: Vec<PerspectiveBreakdown> = outcomes
        .into_iter()
        .map(|(p, r)| breakdown_for(p, r))
        .collect();

    let usable: Vec<(f64, f64)> = breakdown
        .iter()
        .filter(|b| b.is_usable())
        .filter_map(|b| Some((b.score.as_f64()?, b.confidence?)))
        .collect();

    if usable.is_empty() {
        for b in &breakdown {
            tracing::warn!(perspective = %b.perspective, status = ?b.status, detail = ?b.detail, "unusable perspective");
        }
        if !failures.is_empty() && failures.len() == total {
            return Err(ScoringError::AllUpstreamsFailed { causes: failures });
        }
        return Err(ScoringError::AllPerspectivesInvalid);
    }

    let conf_sum: f64 = usable.iter().map(|(_, c)| c).sum();
    if conf_sum <= 0.0 {
        return Err(ScoringError::AllScoresZeroConfidence);
    }

    let n = usable.len() as f64;
    let weighted_mean = usable.iter().map(|(s, c)| s * c).sum::<f64>() / conf_sum;
    let composite_score = (1.0 - weighted_mean.abs()).clamp(0.0, 1.0);

    let mean_score = usable.iter().map(|(s, _)| s).sum::<f64>() / n;
    let variance = usable
        .iter()
        .map(|(s, _)| (s - mean_score).powi(2))
        .sum::<f64>()
        / n;
    let (min, max) = usable
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (s, _)| {
            (lo.min(*s), hi.max(*s))
        });
    let spread = max - min;

    let mean_conf = conf_sum / n;
    let agreement = (1.0 - variance).clamp(0.0, 1.0);
    let coverage = n / Perspective::ALL.len() as f64;
    let weight_sum = cfg.confidence_weight + cfg.agreement_weight + cfg.coverage_weight;
    let confidence = ((cfg.confidence_weight * mean_conf
        + cfg.agreement_weight * agreement
        + cfg.coverage_weight * coverage)
        / weight_sum)
        .clamp(0.0, 1.0);

    let uncertainty_flag = confidence < cfg.min_confidence || spread > cfg.spread_threshold;

    Ok(CompositeResult {
        composite_score,
        confidence,
        uncertainty_flag,
        weighted_mean,
        variance,
        spread,
        usable_count: usable.len(),
        breakdown,
    })
}

fn breakdown_for(perspective: Perspective, result: GatewayResult) -> PerspectiveBreakdown {
    match result {
        Ok(PerspectiveOutcome::Scored(r)) => {
            let score = ScoreValue::from_raw(r.score);
            let (status, detail) = match r.confidence {
                _ if !is_valid_score(r.score) => {
                    (BreakdownStatus::Invalid, Some(format!("score {} outside [-1, 1]", r.score)))
                }
                None => (BreakdownStatus::Invalid, Some("missing confidence".to_string())),
                Some(c) if !is_valid_confidence(c) => {
                    (BreakdownStatus::Invalid, Some(format!("confidence {c} outside [0, 1]")))
                }
                Some(_) => (BreakdownStatus::Usable, None),
            };
            PerspectiveBreakdown {
                perspective,
                status,
                score,
                confidence: r.confidence.filter(|c| c.is_finite()),
                detail,
                metadata: r.raw_metadata,
            }
        }
        Ok(PerspectiveOutcome::Invalid {
            error,
            raw_metadata,
            ..
        }) => PerspectiveBreakdown {
            perspective,
            status: BreakdownStatus::Invalid,
            score: ScoreValue::Invalid,
            confidence: None,
            detail: Some(error.to_string()),
            metadata: raw_metadata,
        },
        Err(e) => PerspectiveBreakdown {
            perspective,
            status: BreakdownStatus::Failed,
            score: ScoreValue::Invalid,
            confidence: None,
            detail: Some(e.to_string()),
            metadata: json!({ "error_code": e.code() }),
        },
    }
}
