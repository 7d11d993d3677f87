//! model.rs: records shared between the scorer, the job manager and the store.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ArticleId = i64;

/// One of the three fixed viewpoints, each scored by an independent model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Perspective {
    Left,
    Center,
    Right,
}

impl Perspective {
    pub const ALL: [Perspective; 3] = [Perspective::Left, Perspective::Center, Perspective::Right];

    pub fn as_str(self) -> &'static str {
        match self {
            Perspective::Left => "left",
            Perspective::Center => "center",
            Perspective::Right => "right",
        }
    }

    /// Lenient parse behind deserialization, so config files may say
    /// "Neutral" or "centre" for the center model.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Some(Perspective::Left),
            "center" | "centre" | "neutral" => Some(Perspective::Center),
            "right" => Some(Perspective::Right),
            _ => None,
        }
    }
}

impl TryFrom<String> for Perspective {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Perspective::parse(&s).ok_or_else(|| format!("unknown perspective '{s}'"))
    }
}

impl fmt::Display for Perspective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Article as handed over by the ingestion side. Never mutated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: ArticleId,
    pub source: String,
    pub title: String,
    pub body: String,
    pub published_at: DateTime<Utc>,
}

impl Article {
    /// Text sent to the perspective models.
    pub fn scoring_text(&self) -> String {
        let title = self.title.trim();
        if title.is_empty() {
            self.body.trim().to_string()
        } else {
            format!("{title}\n\n{}", self.body.trim())
        }
    }
}

/// A stored score: a finite value in [-1, 1] or an explicit invalid marker.
/// Out-of-range values are never clamped into range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ScoreValue {
    Valid(f64),
    Invalid,
}

impl ScoreValue {
    pub const MIN: f64 = -1.0;
    pub const MAX: f64 = 1.0;

    pub fn from_raw(v: f64) -> Self {
        if is_valid_score(v) {
            ScoreValue::Valid(v)
        } else {
            ScoreValue::Invalid
        }
    }

    pub fn as_f64(self) -> Option<f64> {
        match self {
            ScoreValue::Valid(v) => Some(v),
            ScoreValue::Invalid => None,
        }
    }
}

pub fn is_valid_score(v: f64) -> bool {
    v.is_finite() && (ScoreValue::MIN..=ScoreValue::MAX).contains(&v)
}

pub fn is_valid_confidence(c: f64) -> bool {
    c.is_finite() && (0.0..=1.0).contains(&c)
}

/// Insert request for a perspective score; the store assigns `version` and `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPerspectiveScore {
    pub article_id: ArticleId,
    pub perspective: Perspective,
    pub score: ScoreValue,
    pub confidence: f64,
    pub raw_metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerspectiveScore {
    pub article_id: ArticleId,
    pub perspective: Perspective,
    pub score: ScoreValue,
    pub confidence: f64,
    pub raw_metadata: serde_json::Value,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

/// How a single perspective resolved during one analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakdownStatus {
    /// Parsed and passed the validity filter.
    Usable,
    /// Parsed, but the score or confidence cannot be trusted.
    Invalid,
    /// The upstream call itself failed.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerspectiveBreakdown {
    pub perspective: Perspective,
    pub status: BreakdownStatus,
    pub score: ScoreValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl PerspectiveBreakdown {
    pub fn is_usable(&self) -> bool {
        self.status == BreakdownStatus::Usable
    }
}

/// Aggregated result of one ensemble analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeResult {
    /// 1 - |weighted mean|, in [0, 1]; near 1 means balanced coverage.
    pub composite_score: f64,
    pub confidence: f64,
    pub uncertainty_flag: bool,
    pub weighted_mean: f64,
    pub variance: f64,
    pub spread: f64,
    pub usable_count: usize,
    pub breakdown: Vec<PerspectiveBreakdown>,
}

impl CompositeResult {
    pub fn perspective(&self, p: Perspective) -> Option<&PerspectiveBreakdown> {
        self.breakdown.iter().find(|b| b.perspective == p)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredComposite {
    pub article_id: ArticleId,
    pub version: u64,
    pub result: CompositeResult,
    /// Perspective score versions this composite was computed from.
    pub perspective_versions: BTreeMap<Perspective, u64>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_value_marks_non_finite_and_out_of_range_invalid() {
        assert_eq!(ScoreValue::from_raw(0.4), ScoreValue::Valid(0.4));
        assert_eq!(ScoreValue::from_raw(-1.0), ScoreValue::Valid(-1.0));
        assert_eq!(ScoreValue::from_raw(f64::NAN), ScoreValue::Invalid);
        assert_eq!(ScoreValue::from_raw(f64::INFINITY), ScoreValue::Invalid);
        assert_eq!(ScoreValue::from_raw(1.2), ScoreValue::Invalid);
    }

    #[test]
    fn score_value_serializes_with_explicit_marker() {
        let v = serde_json::to_value(ScoreValue::Invalid).unwrap();
        assert_eq!(v, serde_json::json!({"kind": "invalid"}));
        let v = serde_json::to_value(ScoreValue::Valid(0.25)).unwrap();
        assert_eq!(v, serde_json::json!({"kind": "valid", "value": 0.25}));
    }

    #[test]
    fn perspective_deserializes_legacy_labels() {
        let p: Perspective = serde_json::from_str(r#"" Neutral ""#).unwrap();
        assert_eq!(p, Perspective::Center);
        let p: Perspective = serde_json::from_str(r#""RIGHT""#).unwrap();
        assert_eq!(p, Perspective::Right);
        assert!(serde_json::from_str::<Perspective>(r#""libertarian""#).is_err());
        assert_eq!(serde_json::to_value(Perspective::Center).unwrap(), "center");

        let versions: BTreeMap<Perspective, u64> =
            serde_json::from_str(r#"{"left": 2, "center": 1}"#).unwrap();
        assert_eq!(versions[&Perspective::Left], 2);
    }
}
