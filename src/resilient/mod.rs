//! Resilient outbound client: retry with backoff, per-endpoint circuit
//! breaker, TTL response cache and secondary-credential fallback on 429.
//!
//! Order of checks for one `execute`:
//! 1. cache (a hit never touches the network or the breaker)
//! 2. breaker permit, taken before every attempt
//! 3. transport call, classified into success / rate limit / retryable / fatal

pub mod breaker;
pub mod cache;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use rand::Rng;
use tokio::time::Instant;

use crate::config::{PerspectiveEndpoint, ResilienceConfig};
use crate::error::{Result, ScoringError};
use crate::metrics::ensure_metrics_described;

pub use breaker::{BreakerPermit, CircuitBreaker, CircuitSnapshot, CircuitStatus};
pub use cache::{cache_key, TtlCache};
pub use transport::{
    HttpTransport, MockTransport, NormalizedRequest, RawResponse, ScoringRequest, Transport,
    TransportError,
};

/// Which credential produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSlot {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: String,
    pub from_cache: bool,
    pub credential: CredentialSlot,
    /// Network attempts made for this call (0 on a cache hit).
    pub attempts: u32,
}

#[derive(Debug, Clone)]
struct CachedResponse {
    status: u16,
    body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ResilienceConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &ResilienceConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            multiplier: cfg.multiplier,
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            jitter: Duration::from_millis(cfg.jitter_ms),
        }
    }

    /// `min(base * multiplier^(attempt-1), max_delay)`, attempt counted from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = ms.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

enum Failure {
    Timeout,
    Unavailable(String),
}

enum AttemptOutcome {
    Success(RawResponse),
    RateLimited(Option<Duration>),
    Retryable(Failure),
    Fatal(ScoringError),
}

pub struct ResilientClient {
    endpoint: String,
    transport: Arc<dyn Transport>,
    primary_key: String,
    secondary_key: Option<String>,
    policy: RetryPolicy,
    breaker: CircuitBreaker,
    cache: Option<TtlCache<CachedResponse>>,
    timeout: Duration,
}

impl ResilientClient {
    pub fn new(
        endpoint: impl Into<String>,
        transport: Arc<dyn Transport>,
        primary_key: impl Into<String>,
    ) -> Self {
        let endpoint = endpoint.into();
        let d = ResilienceConfig::default();
        Self {
            breaker: CircuitBreaker::new(endpoint.clone(), d.failure_threshold, d.cooldown()),
            endpoint,
            transport,
            primary_key: primary_key.into(),
            secondary_key: None,
            policy: RetryPolicy::from_config(&d),
            cache: None,
            timeout: d.request_timeout(),
        }
    }

    /// Client for one configured perspective endpoint.
    pub fn from_config(
        endpoint: &PerspectiveEndpoint,
        transport: Arc<dyn Transport>,
        cfg: &ResilienceConfig,
    ) -> Self {
        let client = Self::new(endpoint.perspective.as_str(), transport, endpoint.api_key.clone())
            .with_secondary(endpoint.backup_api_key.clone())
            .with_policy(RetryPolicy::from_config(cfg))
            .with_breaker(cfg.failure_threshold, cfg.cooldown())
            .with_timeout(cfg.request_timeout());
        if cfg.cache_enabled {
            client.with_cache(cfg.cache_ttl())
        } else {
            client
        }
    }

    pub fn with_secondary(mut self, key: Option<String>) -> Self {
        self.secondary_key = key.filter(|k| !k.trim().is_empty());
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_breaker(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.breaker = CircuitBreaker::new(self.endpoint.clone(), threshold, cooldown);
        self
    }

    pub fn with_cache(mut self, ttl: Duration) -> Self {
        self.cache = Some(TtlCache::new(ttl));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn circuit(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    pub async fn execute(&self, request: &ScoringRequest) -> Result<UpstreamResponse> {
        ensure_metrics_described();
        let normalized = request.normalized();

        let key = self.cache.as_ref().map(|_| cache_key(&normalized));
        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(hit) = cache.get(key) {
                counter!("resilient_cache_hits_total", "endpoint" => self.endpoint.clone())
                    .increment(1);
                tracing::debug!(endpoint = %self.endpoint, "cache hit");
                return Ok(UpstreamResponse {
                    status: hit.status,
                    body: hit.body,
                    from_cache: true,
                    credential: CredentialSlot::Primary,
                    attempts: 0,
                });
            }
            counter!("resilient_cache_misses_total", "endpoint" => self.endpoint.clone())
                .increment(1);
        }

        let started = Instant::now();
        let result = self.execute_uncached(&normalized).await;
        histogram!("resilient_call_ms", "endpoint" => self.endpoint.clone())
            .record(started.elapsed().as_secs_f64() * 1000.0);

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        counter!(
            "resilient_calls_total",
            "endpoint" => self.endpoint.clone(),
            "outcome" => outcome
        )
        .increment(1);

        if let (Ok(resp), Some(cache), Some(key)) = (&result, &self.cache, key) {
            cache.insert(
                key,
                CachedResponse {
                    status: resp.status,
                    body: resp.body.clone(),
                },
            );
        }
        result
    }

    async fn execute_uncached(&self, request: &NormalizedRequest) -> Result<UpstreamResponse> {
        let mut slot = CredentialSlot::Primary;
        let mut failures = 0u32;
        let mut calls = 0u32;

        loop {
            let permit = self
                .breaker
                .try_acquire()
                .map_err(|retry_in| ScoringError::CircuitOpen {
                    endpoint: self.endpoint.clone(),
                    retry_in,
                })?;

            let api_key = match (slot, &self.secondary_key) {
                (CredentialSlot::Secondary, Some(k)) => k.as_str(),
                _ => self.primary_key.as_str(),
            };
            calls += 1;
            let sent = self.transport.send(request, api_key, self.timeout).await;

            match self.classify(sent) {
                AttemptOutcome::Success(raw) => {
                    permit.success();
                    return Ok(UpstreamResponse {
                        status: raw.status,
                        body: raw.body,
                        from_cache: false,
                        credential: slot,
                        attempts: calls,
                    });
                }
                AttemptOutcome::RateLimited(retry_after) => {
                    permit.release();
                    if slot == CredentialSlot::Primary && self.secondary_key.is_some() {
                        tracing::warn!(
                            endpoint = %self.endpoint,
                            "rate limited on primary credential, switching to secondary"
                        );
                        slot = CredentialSlot::Secondary;
                        continue;
                    }
                    tracing::warn!(endpoint = %self.endpoint, ?retry_after, "rate limited");
                    return Err(ScoringError::UpstreamRateLimit {
                        endpoint: self.endpoint.clone(),
                        retry_after,
                    });
                }
                AttemptOutcome::Fatal(err) => {
                    permit.release();
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        transport = self.transport.name(),
                        error = %err,
                        "fatal upstream failure"
                    );
                    return Err(err);
                }
                AttemptOutcome::Retryable(failure) => {
                    permit.failure();
                    failures += 1;
                    if failures >= self.policy.max_attempts {
                        return Err(self.exhausted(failure, failures));
                    }
                    let delay = self.policy.jittered(failures);
                    counter!("resilient_retries_total", "endpoint" => self.endpoint.clone())
                        .increment(1);
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        transport = self.transport.name(),
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "retryable upstream failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn classify(&self, sent: std::result::Result<RawResponse, TransportError>) -> AttemptOutcome {
        let raw = match sent {
            Ok(raw) => raw,
            Err(TransportError::Timeout) => return AttemptOutcome::Retryable(Failure::Timeout),
            Err(TransportError::Connect(detail)) => {
                return AttemptOutcome::Retryable(Failure::Unavailable(detail))
            }
            Err(TransportError::Malformed(detail)) => {
                return AttemptOutcome::Fatal(ScoringError::UpstreamRejected {
                    endpoint: self.endpoint.clone(),
                    status: 0,
                    message: detail,
                })
            }
        };
        match raw.status {
            200..=299 => AttemptOutcome::Success(raw),
            429 => AttemptOutcome::RateLimited(raw.retry_after),
            408 => AttemptOutcome::Retryable(Failure::Timeout),
            500..=599 => AttemptOutcome::Retryable(Failure::Unavailable(format!(
                "status {}",
                raw.status
            ))),
            status => AttemptOutcome::Fatal(ScoringError::UpstreamRejected {
                endpoint: self.endpoint.clone(),
                status,
                message: error_message(&raw.body),
            }),
        }
    }

    fn exhausted(&self, last: Failure, attempts: u32) -> ScoringError {
        match last {
            Failure::Timeout => ScoringError::UpstreamTimeout {
                endpoint: self.endpoint.clone(),
                attempts,
            },
            Failure::Unavailable(detail) => ScoringError::UpstreamUnavailable {
                endpoint: self.endpoint.clone(),
                attempts,
                detail,
            },
        }
    }
}

/// Best-effort human message from an error body, bounded in length.
fn error_message(body: &str) -> String {
    let from_json = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        });
    let msg = from_json.unwrap_or_else(|| body.trim().to_string());
    msg.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(350),
            jitter: Duration::ZERO,
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(350));
        assert_eq!(p.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let p = RetryPolicy {
            jitter: Duration::from_millis(50),
            ..RetryPolicy::default()
        };
        for _ in 0..20 {
            let d = p.jittered(1);
            assert!(d >= p.delay_for(1) && d <= p.delay_for(1) + Duration::from_millis(50));
        }
    }

    #[test]
    fn error_message_prefers_structured_field() {
        assert_eq!(
            error_message(r#"{"error":{"message":"invalid api key"}}"#),
            "invalid api key"
        );
        assert_eq!(error_message("  plain text  "), "plain text");
        assert_eq!(error_message(&"x".repeat(500)).len(), 200);
    }
}
