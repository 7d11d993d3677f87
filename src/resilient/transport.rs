//! Wire-level request/response types and the transports that carry them.
//!
//! `ScoringRequest` is what callers build; `NormalizedRequest` is the same
//! request with every optional knob set to its explicit default, and is the
//! only shape that reaches a transport or the response cache.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::Perspective;

pub const DEFAULT_TEMPERATURE: f64 = 0.0;
pub const DEFAULT_MAX_TOKENS: u32 = 512;
pub const DEFAULT_TOP_P: f64 = 1.0;

const USER_AGENT: &str = "news-bias-scorer/0.1";

/// Outbound chat-completion style scoring request.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringRequest {
    pub url: String,
    pub model: String,
    pub system_prompt: String,
    pub user_content: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
}

impl ScoringRequest {
    pub fn new(
        url: impl Into<String>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        user_content: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            model: model.into(),
            system_prompt: system_prompt.into(),
            user_content: user_content.into(),
            temperature: None,
            max_tokens: None,
            top_p: None,
        }
    }

    pub fn normalized(&self) -> NormalizedRequest {
        NormalizedRequest {
            url: self.url.trim().trim_end_matches('/').to_string(),
            model: self.model.trim().to_string(),
            system_prompt: self.system_prompt.clone(),
            user_content: self.user_content.clone(),
            temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            top_p: self.top_p.unwrap_or(DEFAULT_TOP_P),
        }
    }
}

/// Request with all defaults applied. Field order is the hashing order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRequest {
    pub url: String,
    pub model: String,
    pub system_prompt: String,
    pub user_content: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
    pub retry_after: Option<Duration>,
}

impl RawResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    Timeout,
    /// Connection refused/reset, DNS, TLS, broken body stream.
    Connect(String),
    /// The request could not even be built (bad URL, bad header).
    Malformed(String),
}

/// Carries one request to one endpoint. No retries, no caching.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: &NormalizedRequest,
        api_key: &str,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError>;

    /// Short label attached to upstream failure logs.
    fn name(&self) -> &'static str;
}

/// OpenRouter/OpenAI-compatible chat completions over HTTPS.
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &NormalizedRequest,
        api_key: &str,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f64,
            max_tokens: u32,
            top_p: f64,
        }

        let body = Req {
            model: &request.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: &request.system_prompt,
                },
                Msg {
                    role: "user",
                    content: &request.user_content,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
        };

        let resp = self
            .http
            .post(&request.url)
            .bearer_auth(api_key)
            .header("X-Title", "NewsBiasScorer")
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = resp.text().await.map_err(map_reqwest_error)?;
        let status = reclassify_embedded_error(status, &text);

        Ok(RawResponse {
            status,
            body: text,
            retry_after,
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_builder() {
        TransportError::Malformed(e.to_string())
    } else {
        TransportError::Connect(e.to_string())
    }
}

/// Some providers answer 200 with `{"error": {"code": 429, ...}}`. Treat the
/// embedded code as the real status so the caller classifies it correctly.
pub fn reclassify_embedded_error(status: u16, body: &str) -> u16 {
    if !(200..300).contains(&status) {
        return status;
    }
    #[derive(Deserialize)]
    struct Envelope {
        error: Option<EmbeddedError>,
    }
    #[derive(Deserialize)]
    struct EmbeddedError {
        #[serde(default)]
        code: Option<serde_json::Value>,
        #[serde(default)]
        message: Option<String>,
    }

    let Ok(env) = serde_json::from_str::<Envelope>(body) else {
        return status;
    };
    let Some(err) = env.error else {
        return status;
    };
    let code = err.code.as_ref().and_then(|c| match c {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    });
    match code {
        Some(c) if (400..600).contains(&c) => c as u16,
        _ => {
            let rate_limited = err
                .message
                .as_deref()
                .is_some_and(|m| m.to_ascii_lowercase().contains("rate limit"));
            if rate_limited {
                429
            } else {
                502
            }
        }
    }
}

/// Deterministic transport for local runs (`AI_TEST_MODE=mock`).
#[derive(Debug, Clone)]
pub struct MockTransport {
    pub score: f64,
    pub confidence: f64,
}

impl MockTransport {
    pub fn new(score: f64, confidence: f64) -> Self {
        Self { score, confidence }
    }

    /// Mild lean matching each perspective's framing.
    pub fn for_perspective(perspective: Perspective) -> Self {
        match perspective {
            Perspective::Left => Self::new(-0.2, 0.8),
            Perspective::Center => Self::new(0.0, 0.9),
            Perspective::Right => Self::new(0.2, 0.8),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        _request: &NormalizedRequest,
        _api_key: &str,
        _timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        let content = serde_json::json!({
            "score": self.score,
            "confidence": self.confidence,
            "explanation": "Deterministic mock assessment",
        })
        .to_string();
        let body = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }]
        });
        Ok(RawResponse::ok(body.to_string()))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
