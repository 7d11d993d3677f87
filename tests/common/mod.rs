// tests/common/mod.rs
//
// Shared helpers: a scripted in-process transport that counts network
// attempts, plus builders for gateways, scorers and seeded stores.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use news_bias_scorer::config::{EnsembleConfig, PerspectiveEndpoint};
use news_bias_scorer::ensemble::EnsembleScorer;
use news_bias_scorer::model::{Article, ArticleId, Perspective};
use news_bias_scorer::perspective::{PerspectiveGateway, PerspectiveScorer};
use news_bias_scorer::resilient::{
    NormalizedRequest, RawResponse, ResilientClient, RetryPolicy, Transport, TransportError,
};
use news_bias_scorer::store::InMemoryScoreStore;

#[derive(Debug, Clone)]
pub enum Step {
    Respond(u16, String),
    RateLimited(Option<u64>),
    Timeout,
    Refused,
}

/// Chat-completion body whose content is the given JSON object.
pub fn chat_body(content: serde_json::Value) -> String {
    json!({
        "choices": [{ "message": { "role": "assistant", "content": content.to_string() } }]
    })
    .to_string()
}

pub fn score_body(score: f64, confidence: f64) -> String {
    chat_body(json!({ "score": score, "confidence": confidence, "explanation": "scripted" }))
}

pub fn ok(score: f64, confidence: f64) -> Step {
    Step::Respond(200, score_body(score, confidence))
}

pub struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    delay: Duration,
    calls: AtomicUsize,
    keys: Mutex<Vec<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Step>, fallback: Step) -> Arc<Self> {
        Self::with_delay(script, fallback, Duration::ZERO)
    }

    pub fn with_delay(script: Vec<Step>, fallback: Step, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            delay,
            calls: AtomicUsize::new(0),
            keys: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    /// Always answers with the same score.
    pub fn fixed(score: f64, confidence: f64) -> Arc<Self> {
        Self::new(Vec::new(), ok(score, confidence))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn keys_used(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }

    /// System prompts in the order they were sent.
    pub fn prompts_seen(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        request: &NormalizedRequest,
        api_key: &str,
        _timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.keys.lock().unwrap().push(api_key.to_string());
        self.prompts.lock().unwrap().push(request.system_prompt.clone());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match step {
            Step::Respond(status, body) => Ok(RawResponse::status(status, body)),
            Step::RateLimited(secs) => Ok(RawResponse {
                status: 429,
                body: r#"{"error":{"message":"rate limited"}}"#.to_string(),
                retry_after: secs.map(Duration::from_secs),
            }),
            Step::Timeout => Err(TransportError::Timeout),
            Step::Refused => Err(TransportError::Connect("connection refused".into())),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        multiplier: 2.0,
        max_delay: Duration::from_millis(5),
        jitter: Duration::ZERO,
    }
}

pub fn endpoint(p: Perspective) -> PerspectiveEndpoint {
    PerspectiveEndpoint {
        perspective: p,
        url: format!("https://scoring.test/{p}"),
        model: format!("model-{p}"),
        api_key: "primary".into(),
        backup_api_key: None,
        temperature: None,
        max_tokens: None,
        prompt_variants: Vec::new(),
        max_prompt_attempts: 2,
    }
}

/// Gateway over `transport` with fast retries and no cache.
pub fn gateway(p: Perspective, transport: Arc<ScriptedTransport>) -> Arc<dyn PerspectiveScorer> {
    Arc::new(gateway_for(&endpoint(p), transport))
}

pub fn gateway_for(ep: &PerspectiveEndpoint, transport: Arc<ScriptedTransport>) -> PerspectiveGateway {
    let client = ResilientClient::new(ep.perspective.as_str(), transport, "primary")
        .with_policy(fast_policy(2))
        .with_breaker(50, Duration::from_secs(30));
    PerspectiveGateway::new(ep, client)
}

pub struct Transports {
    pub left: Arc<ScriptedTransport>,
    pub center: Arc<ScriptedTransport>,
    pub right: Arc<ScriptedTransport>,
}

impl Transports {
    pub fn total_calls(&self) -> usize {
        self.left.calls() + self.center.calls() + self.right.calls()
    }
}

pub fn scorer(t: &Transports) -> Arc<EnsembleScorer> {
    let scorers = vec![
        gateway(Perspective::Left, t.left.clone()),
        gateway(Perspective::Center, t.center.clone()),
        gateway(Perspective::Right, t.right.clone()),
    ];
    Arc::new(EnsembleScorer::new(scorers, EnsembleConfig::default()).unwrap())
}

pub fn fixed_transports(delay: Duration) -> Transports {
    Transports {
        left: ScriptedTransport::with_delay(Vec::new(), ok(-0.6, 0.90), delay),
        center: ScriptedTransport::with_delay(Vec::new(), ok(0.10, 0.85), delay),
        right: ScriptedTransport::with_delay(Vec::new(), ok(0.70, 0.92), delay),
    }
}

pub fn article(id: ArticleId) -> Article {
    Article {
        id,
        source: "wire".into(),
        title: format!("Article {id}"),
        body: "Lawmakers debated the new transit budget on Tuesday.".into(),
        published_at: Utc::now(),
    }
}

pub fn seeded_store(ids: &[ArticleId]) -> Arc<InMemoryScoreStore> {
    let store = Arc::new(InMemoryScoreStore::new());
    for id in ids {
        store.insert_article(article(*id)).unwrap();
    }
    store
}
