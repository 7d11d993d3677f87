// src/config/scoring.rs
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::Perspective;

pub const ENV_SCORING_CONFIG_PATH: &str = "SCORING_CONFIG_PATH";
pub const ENV_PRIMARY_KEY: &str = "OPENROUTER_API_KEY";
pub const ENV_BACKUP_KEY: &str = "OPENROUTER_BACKUP_KEY";
/// `AI_TEST_MODE=mock` swaps every outbound transport for a deterministic mock.
pub const ENV_AI_TEST_MODE: &str = "AI_TEST_MODE";

const DEFAULT_JSON_PATH: &str = "config/scoring.json";
const DEFAULT_TOML_PATH: &str = "config/scoring.toml";
const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";

fn default_api_key() -> String {
    "ENV".to_string()
}

fn default_prompt_attempts() -> u32 {
    2
}

/// Alternate instruction tried when an earlier prompt got an unusable answer.
/// The scale and output-format instructions are appended to `instruction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptVariant {
    pub id: String,
    pub instruction: String,
}

/// One outbound scoring endpoint, bound to a single perspective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerspectiveEndpoint {
    pub perspective: Perspective,
    #[serde(default = "default_url")]
    pub url: String,
    pub model: String,
    /// "ENV" means: read from OPENROUTER_API_KEY
    #[serde(default = "default_api_key")]
    pub api_key: String,
    /// Secondary credential used when the primary is rate limited.
    /// "ENV" means: read from OPENROUTER_BACKUP_KEY (absent var = no backup)
    #[serde(default)]
    pub backup_api_key: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Tried in order after the perspective's own prompt. Empty means one
    /// built-in general prompt.
    #[serde(default)]
    pub prompt_variants: Vec<PromptVariant>,
    /// Upper bound on prompts tried per analysis, counting the first one.
    #[serde(default = "default_prompt_attempts")]
    pub max_prompt_attempts: u32,
}

fn default_url() -> String {
    DEFAULT_ENDPOINT.to_string()
}

impl PerspectiveEndpoint {
    fn openrouter(perspective: Perspective, model: &str) -> Self {
        Self {
            perspective,
            url: default_url(),
            model: model.to_string(),
            api_key: default_api_key(),
            backup_api_key: Some(default_api_key()),
            temperature: None,
            max_tokens: None,
            prompt_variants: Vec::new(),
            max_prompt_attempts: default_prompt_attempts(),
        }
    }
}

/// Retry, circuit breaker and cache knobs for every outbound client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 8_000,
            jitter_ms: 250,
            request_timeout_secs: 60,
            connect_timeout_secs: 10,
            failure_threshold: 5,
            cooldown_secs: 30,
            cache_enabled: true,
            cache_ttl_secs: 3_600,
        }
    }
}

impl ResilienceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Aggregation constants. The confidence weights are normalized by their sum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Aggregate confidence below this sets the uncertainty flag.
    pub min_confidence: f64,
    /// max - min of usable scores above this sets the uncertainty flag.
    pub spread_threshold: f64,
    pub confidence_weight: f64,
    pub agreement_weight: f64,
    pub coverage_weight: f64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            spread_threshold: 1.5,
            confidence_weight: 0.5,
            agreement_weight: 0.3,
            coverage_weight: 0.2,
        }
    }
}

impl EnsembleConfig {
    /// Out-of-range thresholds and unusable weight sets fall back to defaults.
    pub fn sanitized(mut self) -> Self {
        let d = EnsembleConfig::default();
        if !(0.0..=1.0).contains(&self.min_confidence) {
            self.min_confidence = d.min_confidence;
        }
        if !(self.spread_threshold.is_finite() && self.spread_threshold >= 0.0) {
            self.spread_threshold = d.spread_threshold;
        }
        let weights = [self.confidence_weight, self.agreement_weight, self.coverage_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) || weights.iter().sum::<f64>() <= 0.0
        {
            self.confidence_weight = d.confidence_weight;
            self.agreement_weight = d.agreement_weight;
            self.coverage_weight = d.coverage_weight;
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// How long a finished job stays visible to `subscribe`/`status`.
    pub grace_period_secs: u64,
    /// Per-subscriber progress buffer; the oldest snapshot is dropped on overflow.
    pub subscriber_buffer: usize,
    pub prune_interval_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 300,
            subscriber_buffer: 16,
            prune_interval_secs: 60,
        }
    }
}

impl JobConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub perspectives: Vec<PerspectiveEndpoint>,
    pub resilience: ResilienceConfig,
    pub ensemble: EnsembleConfig,
    pub jobs: JobConfig,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            perspectives: vec![
                PerspectiveEndpoint::openrouter(Perspective::Left, "meta-llama/llama-4-maverick"),
                PerspectiveEndpoint::openrouter(Perspective::Center, "google/gemini-2.0-flash-001"),
                PerspectiveEndpoint::openrouter(Perspective::Right, "openai/gpt-4.1-nano"),
            ],
            resilience: ResilienceConfig::default(),
            ensemble: EnsembleConfig::default(),
            jobs: JobConfig::default(),
        }
    }
}

impl ScoringConfig {
    /// Load from an explicit path. `.toml` is parsed as TOML, everything else as JSON.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading scoring config from {}", path.display()))?;
        let is_toml = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
        let cfg: ScoringConfig = if is_toml {
            toml::from_str(&data).with_context(|| format!("parsing {}", path.display()))?
        } else {
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?
        };
        cfg.finish()
    }

    /// Load using env var + fallbacks:
    /// 1) $SCORING_CONFIG_PATH
    /// 2) config/scoring.json
    /// 3) config/scoring.toml
    /// 4) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = env::var(ENV_SCORING_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                bail!("{ENV_SCORING_CONFIG_PATH} points to non-existent path");
            }
            return Self::load_from_file(&pb);
        }
        for candidate in [DEFAULT_JSON_PATH, DEFAULT_TOML_PATH] {
            let pb = PathBuf::from(candidate);
            if pb.exists() {
                return Self::load_from_file(&pb);
            }
        }
        Self::default().finish()
    }

    /// Resolve "ENV" credentials, sanitize numbers, check perspective coverage.
    pub fn finish(mut self) -> Result<Self> {
        self.sanitize();
        self.validate_perspectives()?;
        for ep in self.perspectives.iter_mut() {
            ep.api_key = resolve_key(&ep.api_key, ENV_PRIMARY_KEY).unwrap_or_default();
            ep.backup_api_key = ep
                .backup_api_key
                .as_deref()
                .and_then(|k| resolve_key(k, ENV_BACKUP_KEY))
                .filter(|k| !k.trim().is_empty());
        }
        Ok(self)
    }

    pub fn endpoint_for(&self, perspective: Perspective) -> Option<&PerspectiveEndpoint> {
        self.perspectives.iter().find(|e| e.perspective == perspective)
    }

    fn validate_perspectives(&self) -> Result<()> {
        for p in Perspective::ALL {
            let n = self.perspectives.iter().filter(|e| e.perspective == p).count();
            match n {
                1 => {}
                0 => return Err(anyhow!("no endpoint configured for perspective {p}")),
                _ => return Err(anyhow!("perspective {p} configured {n} times")),
            }
        }
        if let Some(ep) = self.perspectives.iter().find(|e| e.model.trim().is_empty()) {
            bail!("empty model name for perspective {}", ep.perspective);
        }
        Ok(())
    }

    fn sanitize(&mut self) {
        let d = ResilienceConfig::default();
        let r = &mut self.resilience;
        if r.max_attempts == 0 {
            r.max_attempts = d.max_attempts;
        }
        if !(r.multiplier.is_finite() && r.multiplier >= 1.0) {
            r.multiplier = d.multiplier;
        }
        if r.max_delay_ms < r.base_delay_ms {
            r.max_delay_ms = r.base_delay_ms;
        }
        if r.request_timeout_secs == 0 {
            r.request_timeout_secs = d.request_timeout_secs;
        }
        if r.connect_timeout_secs == 0 {
            r.connect_timeout_secs = d.connect_timeout_secs;
        }
        if r.failure_threshold == 0 {
            r.failure_threshold = d.failure_threshold;
        }

        self.ensemble = self.ensemble.clone().sanitized();
        for ep in self.perspectives.iter_mut() {
            if ep.max_prompt_attempts == 0 {
                ep.max_prompt_attempts = default_prompt_attempts();
            }
        }

        if self.jobs.subscriber_buffer == 0 {
            self.jobs.subscriber_buffer = JobConfig::default().subscriber_buffer;
        }
        if self.jobs.prune_interval_secs == 0 {
            self.jobs.prune_interval_secs = JobConfig::default().prune_interval_secs;
        }
    }
}

pub fn mock_mode_enabled() -> bool {
    env::var(ENV_AI_TEST_MODE).is_ok_and(|v| v.trim().eq_ignore_ascii_case("mock"))
}

fn resolve_key(raw: &str, env_name: &str) -> Option<String> {
    if raw.trim().eq_ignore_ascii_case("env") {
        env::var(env_name).ok()
    } else {
        Some(raw.to_string())
    }
}
