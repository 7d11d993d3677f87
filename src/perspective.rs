//! Perspective gateways: one scoring request per perspective, parsed into a
//! reading or an explicit invalid outcome.
//!
//! A gateway only returns `Err` when the upstream call itself failed (the
//! resilient client's taxonomy). Anything the model said that cannot be
//! trusted comes back as `PerspectiveOutcome::Invalid`, but only after every
//! configured prompt variant has been tried.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use regex::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::config::{PerspectiveEndpoint, PromptVariant, ResilienceConfig};
use crate::error::{Result, ScoringError};
use crate::model::{is_valid_confidence, is_valid_score, Perspective};
use crate::resilient::{
    CircuitSnapshot, CredentialSlot, ResilientClient, ScoringRequest, Transport,
};

const SCALE_FRAGMENT: &str = "on a scale from -1.0 (strongly left) to +1.0 (strongly right), \
where 0.0 is balanced or neutral reporting. Consider language, framing and sourcing.";

const FIELDS_FRAGMENT: &str = "Return a JSON object with the fields 'score' (number between -1.0 and 1.0), \
'explanation' (one short sentence) and 'confidence' (number between 0.0 and 1.0).\n\
Respond ONLY with a valid JSON object. Do not include any other text or formatting.";

const RAW_PREVIEW_CHARS: usize = 500;

/// Used when an endpoint configures no variants of its own.
const GENERAL_INSTRUCTION: &str = "Please analyze the political bias of the following article";
const GENERAL_VARIANT_ID: &str = "default";

/// Successfully parsed answer from one perspective model.
#[derive(Debug, Clone, PartialEq)]
pub struct PerspectiveReading {
    pub perspective: Perspective,
    pub score: f64,
    /// `None` when the model omitted it; the aggregator treats that as unusable.
    pub confidence: Option<f64>,
    pub explanation: String,
    pub raw_metadata: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PerspectiveOutcome {
    Scored(PerspectiveReading),
    Invalid {
        perspective: Perspective,
        /// Always `ScoringError::InvalidModelOutput`.
        error: ScoringError,
        raw_metadata: Value,
    },
}

impl PerspectiveOutcome {
    pub fn perspective(&self) -> Perspective {
        match self {
            PerspectiveOutcome::Scored(r) => r.perspective,
            PerspectiveOutcome::Invalid { perspective, .. } => *perspective,
        }
    }

    fn invalid(perspective: Perspective, detail: impl Into<String>, raw_metadata: Value) -> Self {
        PerspectiveOutcome::Invalid {
            perspective,
            error: ScoringError::InvalidModelOutput {
                perspective: perspective.to_string(),
                detail: detail.into(),
            },
            raw_metadata,
        }
    }
}

/// Anything that can score article text from one fixed perspective.
pub trait PerspectiveScorer: Send + Sync {
    fn perspective(&self) -> Perspective;

    fn score<'a>(
        &'a self,
        article_text: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<PerspectiveOutcome>> + Send + 'a>>;

    /// Breaker state of the underlying endpoint, when there is one.
    fn circuit(&self) -> Option<CircuitSnapshot> {
        None
    }
}

pub struct PerspectiveGateway {
    perspective: Perspective,
    url: String,
    model: String,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    /// (variant id, system prompt), in the order they are tried. Never empty.
    prompts: Vec<(String, String)>,
    client: ResilientClient,
}

impl PerspectiveGateway {
    pub fn new(endpoint: &PerspectiveEndpoint, client: ResilientClient) -> Self {
        Self {
            perspective: endpoint.perspective,
            url: endpoint.url.clone(),
            model: endpoint.model.clone(),
            temperature: endpoint.temperature,
            max_tokens: endpoint.max_tokens,
            prompts: prompt_chain(
                endpoint.perspective,
                &endpoint.prompt_variants,
                endpoint.max_prompt_attempts,
            ),
            client,
        }
    }

    /// Gateway with its own resilient client for `endpoint`.
    pub fn from_config(
        endpoint: &PerspectiveEndpoint,
        transport: Arc<dyn Transport>,
        resilience: &ResilienceConfig,
    ) -> Self {
        let client = ResilientClient::from_config(endpoint, transport, resilience);
        Self::new(endpoint, client)
    }

    pub fn client(&self) -> &ResilientClient {
        &self.client
    }

    /// Variant ids in the order they are tried.
    pub fn prompt_ids(&self) -> Vec<&str> {
        self.prompts.iter().map(|(id, _)| id.as_str()).collect()
    }

    /// Request for the first prompt in the chain.
    pub fn request_for(&self, article_text: &str) -> ScoringRequest {
        self.request_with(&self.prompts[0].1, article_text)
    }

    fn request_with(&self, system_prompt: &str, article_text: &str) -> ScoringRequest {
        let mut req = ScoringRequest::new(&self.url, &self.model, system_prompt, article_text);
        req.temperature = self.temperature;
        req.max_tokens = self.max_tokens;
        req
    }

    /// Walk the prompt chain until one answer validates. Upstream errors end
    /// the walk at once; the resilient client already retried them.
    async fn score_text(&self, article_text: &str) -> Result<PerspectiveOutcome> {
        let digest = content_digest(article_text);
        let mut last = None;

        for (n, (variant, prompt)) in self.prompts.iter().enumerate() {
            let request = self.request_with(prompt, article_text);
            let resp = self.client.execute(&request).await.inspect_err(|e| {
                tracing::warn!(
                    perspective = %self.perspective,
                    model = %self.model,
                    content = %digest,
                    variant = %variant,
                    error = %e,
                    "perspective call failed"
                );
            })?;

            let credential = match resp.credential {
                CredentialSlot::Primary => "primary",
                CredentialSlot::Secondary => "secondary",
            };
            let mut meta = json!({
                "model": self.model,
                "content_digest": digest,
                "from_cache": resp.from_cache,
                "attempts": resp.attempts,
                "credential": credential,
                "prompt_variant": variant,
                "prompt_attempts": n + 1,
            });

            let outcome = match parse_model_output(&resp.body) {
                Ok(parsed) => validate(self.perspective, parsed, meta),
                Err(detail) => {
                    meta["raw_preview"] =
                        Value::String(resp.body.chars().take(RAW_PREVIEW_CHARS).collect());
                    PerspectiveOutcome::invalid(self.perspective, detail, meta)
                }
            };

            match &outcome {
                PerspectiveOutcome::Scored(r) => {
                    tracing::info!(
                        perspective = %self.perspective,
                        model = %self.model,
                        content = %digest,
                        variant = %variant,
                        score = r.score,
                        confidence = ?r.confidence,
                        "perspective scored"
                    );
                    return Ok(outcome);
                }
                PerspectiveOutcome::Invalid { error, .. } => tracing::warn!(
                    perspective = %self.perspective,
                    model = %self.model,
                    content = %digest,
                    variant = %variant,
                    error = %error,
                    "perspective output rejected"
                ),
            }
            last = Some(outcome);
        }

        last.ok_or_else(|| {
            ScoringError::Internal(format!("no prompt configured for {}", self.perspective))
        })
    }
}

impl PerspectiveScorer for PerspectiveGateway {
    fn perspective(&self) -> Perspective {
        self.perspective
    }

    fn score<'a>(
        &'a self,
        article_text: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<PerspectiveOutcome>> + Send + 'a>> {
        Box::pin(self.score_text(article_text))
    }

    fn circuit(&self) -> Option<CircuitSnapshot> {
        Some(self.client.circuit())
    }
}

pub fn system_prompt(perspective: Perspective) -> String {
    let framing = match perspective {
        Perspective::Left => "From a progressive or left-leaning perspective",
        Perspective::Center => "From a centrist or neutral perspective",
        Perspective::Right => "From a conservative or right-leaning perspective",
    };
    compose_prompt(&format!(
        "{framing}, analyze the political bias of the following article"
    ))
}

fn compose_prompt(instruction: &str) -> String {
    format!("{} {SCALE_FRAGMENT}\n{FIELDS_FRAGMENT}", instruction.trim_end())
}

/// Perspective framing first, then the configured variants (or the general
/// prompt), capped at `max_attempts` and never shorter than one.
fn prompt_chain(
    perspective: Perspective,
    variants: &[PromptVariant],
    max_attempts: u32,
) -> Vec<(String, String)> {
    let mut chain = vec![(format!("{perspective}_focus"), system_prompt(perspective))];
    if variants.is_empty() {
        chain.push((GENERAL_VARIANT_ID.to_string(), compose_prompt(GENERAL_INSTRUCTION)));
    } else {
        chain.extend(
            variants
                .iter()
                .map(|v| (v.id.clone(), compose_prompt(&v.instruction))),
        );
    }
    chain.truncate(max_attempts.max(1) as usize);
    chain
}

/// Raw fields pulled out of a model answer, before range checks.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOutput {
    pub score: f64,
    pub confidence: Option<f64>,
    pub explanation: String,
}

/// Parse a chat-completion body.
///
/// Accepts `choices[0].message.content` holding a JSON object (optionally in
/// a Markdown code fence), falling back to `Score: x` / `Confidence: y` /
/// `Reasoning: ...` lines.
pub fn parse_model_output(body: &str) -> std::result::Result<ParsedOutput, String> {
    let envelope: Value =
        serde_json::from_str(body).map_err(|e| format!("response is not JSON: {e}"))?;
    let content = envelope
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| "no choices[0].message.content in response".to_string())?;

    let content = strip_code_fence(content);

    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(content) {
        let score = obj
            .get("score")
            .and_then(number_like)
            .ok_or_else(|| "missing numeric 'score' field".to_string())?;
        let confidence = obj.get("confidence").and_then(number_like);
        let explanation = obj
            .get("explanation")
            .or_else(|| obj.get("reasoning"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        return Ok(ParsedOutput {
            score,
            confidence,
            explanation: sanitize_explanation(explanation),
        });
    }

    parse_text_fallback(content)
}

fn parse_text_fallback(content: &str) -> std::result::Result<ParsedOutput, String> {
    static RE_SCORE: OnceCell<Regex> = OnceCell::new();
    static RE_CONF: OnceCell<Regex> = OnceCell::new();
    static RE_REASON: OnceCell<Regex> = OnceCell::new();
    let re_score = RE_SCORE.get_or_init(|| Regex::new(r"Score:\s*(-?\d+\.?\d*)").expect("score regex"));
    let re_conf =
        RE_CONF.get_or_init(|| Regex::new(r"Confidence:\s*(\d+\.?\d*)").expect("confidence regex"));
    let re_reason = RE_REASON.get_or_init(|| Regex::new(r"Reasoning:\s*(.+)").expect("reasoning regex"));

    let score = re_score
        .captures(content)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .ok_or_else(|| "no score found in model output".to_string())?;
    let confidence = re_conf
        .captures(content)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok());
    let explanation = re_reason
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or("Extracted from text response");

    Ok(ParsedOutput {
        score,
        confidence,
        explanation: sanitize_explanation(explanation),
    })
}

fn strip_code_fence(content: &str) -> &str {
    static RE_FENCE: OnceCell<Regex> = OnceCell::new();
    let re = RE_FENCE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("fence regex"));
    match re.captures(content).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().trim(),
        None => content.trim(),
    }
}

/// Numbers, and numeric strings some models insist on.
fn number_like(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn validate(perspective: Perspective, parsed: ParsedOutput, mut meta: Value) -> PerspectiveOutcome {
    meta["explanation"] = Value::String(parsed.explanation.clone());
    if !is_valid_score(parsed.score) {
        return PerspectiveOutcome::invalid(
            perspective,
            format!("score {} outside [-1, 1]", parsed.score),
            meta,
        );
    }
    if let Some(c) = parsed.confidence {
        if !is_valid_confidence(c) {
            return PerspectiveOutcome::invalid(
                perspective,
                format!("confidence {c} outside [0, 1]"),
                meta,
            );
        }
    }
    PerspectiveOutcome::Scored(PerspectiveReading {
        perspective,
        score: parsed.score,
        confidence: parsed.confidence,
        explanation: parsed.explanation,
        raw_metadata: meta,
    })
}

/// Single-line ASCII, collapsed whitespace, at most 160 chars.
pub fn sanitize_explanation(input: &str) -> String {
    let mut out = String::with_capacity(160);
    let mut prev_space = false;
    for ch in input.chars() {
        let c = match ch {
            '\r' | '\n' | '\t' => ' ',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => ' ',
        };
        if c == ' ' {
            if !prev_space && !out.is_empty() {
                out.push(' ');
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
        if out.len() >= 160 {
            break;
        }
    }
    out.trim().to_string()
}

/// Short digest used in logs instead of article text.
pub fn content_digest(text: &str) -> String {
    let d = Sha256::digest(text.as_bytes());
    d.iter().take(6).map(|b| format!("{b:02x}")).collect()
}
