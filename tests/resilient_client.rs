// tests/resilient_client.rs
//
// Retry, circuit breaker, rate-limit rotation and TTL cache behaviour of
// ResilientClient, driven through a scripted transport that counts calls.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_policy, ok, score_body, ScriptedTransport, Step};
use news_bias_scorer::error::ScoringError;
use news_bias_scorer::resilient::transport::DEFAULT_TEMPERATURE;
use news_bias_scorer::resilient::{CircuitStatus, CredentialSlot, ResilientClient, ScoringRequest};

fn request(text: &str) -> ScoringRequest {
    ScoringRequest::new("https://scoring.test/left", "model-left", "system", text)
}

fn client(transport: Arc<ScriptedTransport>, max_attempts: u32) -> ResilientClient {
    ResilientClient::new("left", transport, "primary")
        .with_policy(fast_policy(max_attempts))
        .with_breaker(5, Duration::from_secs(30))
}

#[tokio::test]
async fn retryable_failures_are_retried_until_success() {
    let t = ScriptedTransport::new(
        vec![Step::Respond(503, "busy".into()), Step::Refused],
        ok(0.1, 0.9),
    );
    let c = client(t.clone(), 3);

    let resp = c.execute(&request("a")).await.expect("third attempt succeeds");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.attempts, 3);
    assert!(!resp.from_cache);
    assert_eq!(t.calls(), 3);
    assert_eq!(c.circuit().failure_count, 0, "success resets the count");
}

#[tokio::test]
async fn exhausted_timeouts_surface_as_upstream_timeout() {
    let t = ScriptedTransport::new(Vec::new(), Step::Timeout);
    let c = client(t.clone(), 3);

    let err = c.execute(&request("a")).await.unwrap_err();
    assert_eq!(
        err,
        ScoringError::UpstreamTimeout {
            endpoint: "left".into(),
            attempts: 3
        }
    );
    assert_eq!(t.calls(), 3);
}

#[tokio::test]
async fn server_errors_exhaust_as_unavailable() {
    let t = ScriptedTransport::new(Vec::new(), Step::Respond(500, "boom".into()));
    let c = client(t.clone(), 2);
    let err = c.execute(&request("a")).await.unwrap_err();
    assert_eq!(err.code(), "upstream_unavailable");
    assert_eq!(t.calls(), 2);
}

#[tokio::test]
async fn fatal_client_errors_return_immediately() {
    let t = ScriptedTransport::new(
        Vec::new(),
        Step::Respond(401, r#"{"error":{"message":"invalid api key"}}"#.into()),
    );
    let c = client(t.clone(), 3);

    match c.execute(&request("a")).await.unwrap_err() {
        ScoringError::UpstreamRejected {
            status, message, ..
        } => {
            assert_eq!(status, 401);
            assert_eq!(message, "invalid api key");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(t.calls(), 1);
    assert_eq!(c.circuit().failure_count, 0);
}

#[tokio::test]
async fn five_consecutive_failures_open_the_circuit_and_fail_fast() {
    let t = ScriptedTransport::with_delay(
        vec![Step::Respond(503, String::new()); 5],
        ok(0.0, 0.9),
        Duration::from_millis(30),
    );
    let c = ResilientClient::new("left", t.clone(), "primary")
        .with_policy(fast_policy(1))
        .with_breaker(5, Duration::from_millis(150));

    for _ in 0..5 {
        let err = c.execute(&request("a")).await.unwrap_err();
        assert_eq!(err.code(), "upstream_unavailable");
    }
    assert_eq!(c.circuit().status, CircuitStatus::Open);

    let err = c.execute(&request("a")).await.unwrap_err();
    assert!(matches!(err, ScoringError::CircuitOpen { .. }), "{err:?}");
    assert_eq!(t.calls(), 5, "open circuit makes no network attempt");

    tokio::time::sleep(Duration::from_millis(200)).await;

    // Exactly one probe goes out; the concurrent caller is rejected.
    let (req_a, req_b) = (request("a"), request("b"));
    let (first, second) = tokio::join!(c.execute(&req_a), c.execute(&req_b));
    assert!(first.is_ok(), "{first:?}");
    assert!(matches!(second, Err(ScoringError::CircuitOpen { .. })), "{second:?}");
    assert_eq!(t.calls(), 6);
    assert_eq!(c.circuit().status, CircuitStatus::Closed);
}

#[tokio::test]
async fn failed_probe_reopens_the_circuit() {
    let t = ScriptedTransport::new(Vec::new(), Step::Timeout);
    let c = ResilientClient::new("left", t.clone(), "primary")
        .with_policy(fast_policy(1))
        .with_breaker(2, Duration::from_millis(50));

    for _ in 0..2 {
        let _ = c.execute(&request("a")).await;
    }
    assert_eq!(c.circuit().status, CircuitStatus::Open);
    tokio::time::sleep(Duration::from_millis(80)).await;

    let err = c.execute(&request("a")).await.unwrap_err();
    assert_eq!(err.code(), "upstream_timeout");
    assert_eq!(c.circuit().status, CircuitStatus::Open);
    assert_eq!(t.calls(), 3);
}

#[tokio::test]
async fn rate_limit_rotates_to_secondary_credential() {
    let t = ScriptedTransport::new(vec![Step::RateLimited(Some(3))], ok(0.2, 0.8));
    let c = client(t.clone(), 3).with_secondary(Some("backup".into()));

    let resp = c.execute(&request("a")).await.unwrap();
    assert_eq!(resp.credential, CredentialSlot::Secondary);
    assert_eq!(t.keys_used(), vec!["primary".to_string(), "backup".to_string()]);
    assert_eq!(c.circuit().failure_count, 0, "429 is not a service failure");
}

#[tokio::test]
async fn rate_limit_without_secondary_carries_retry_after() {
    let t = ScriptedTransport::new(Vec::new(), Step::RateLimited(Some(7)));
    let c = client(t.clone(), 3);

    let err = c.execute(&request("a")).await.unwrap_err();
    assert_eq!(
        err,
        ScoringError::UpstreamRateLimit {
            endpoint: "left".into(),
            retry_after: Some(Duration::from_secs(7)),
        }
    );
    assert_eq!(t.calls(), 1);
    assert_eq!(c.circuit().status, CircuitStatus::Closed);
}

#[tokio::test]
async fn both_credentials_limited_is_a_rate_limit_error() {
    let t = ScriptedTransport::new(Vec::new(), Step::RateLimited(None));
    let c = client(t.clone(), 3).with_secondary(Some("backup".into()));
    let err = c.execute(&request("a")).await.unwrap_err();
    assert_eq!(err.code(), "upstream_rate_limit");
    assert_eq!(t.calls(), 2);
}

#[tokio::test]
async fn identical_normalized_requests_hit_the_cache_until_ttl() {
    let t = ScriptedTransport::new(Vec::new(), Step::Respond(200, score_body(0.1, 0.9)));
    let c = client(t.clone(), 3).with_cache(Duration::from_millis(100));

    let first = c.execute(&request("same text")).await.unwrap();
    assert!(!first.from_cache);

    // Spelling out a default value normalizes to the same key.
    let mut explicit = request("same text");
    explicit.temperature = Some(DEFAULT_TEMPERATURE);
    let second = c.execute(&explicit).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.body, first.body);
    assert_eq!(t.calls(), 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let third = c.execute(&request("same text")).await.unwrap();
    assert!(!third.from_cache);
    assert_eq!(t.calls(), 2);
}

#[tokio::test]
async fn cache_key_distinguishes_models() {
    let t = ScriptedTransport::new(Vec::new(), ok(0.1, 0.9));
    let a = client(t.clone(), 1).with_cache(Duration::from_secs(60));
    a.execute(&request("x")).await.unwrap();
    let resp = a.execute(&request("x")).await.unwrap();
    assert!(resp.from_cache);

    let mut other_model = request("x");
    other_model.model = "another-model".into();
    assert!(!a.execute(&other_model).await.unwrap().from_cache);
    assert_eq!(t.calls(), 2);
}
