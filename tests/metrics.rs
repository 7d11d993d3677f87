// tests/metrics.rs
//
// One recorder per process, so everything that needs it lives in one test.
use std::sync::Arc;

use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use news_bias_scorer::config::ScoringConfig;
use news_bias_scorer::ensemble::EnsembleScorer;
use news_bias_scorer::metrics::Metrics;
use news_bias_scorer::resilient::{MockTransport, Transport};

#[tokio::test]
async fn metrics_endpoint_exposes_resilience_and_ensemble_series() {
    let mut cfg = ScoringConfig::default();
    cfg.resilience.cache_enabled = true;
    let metrics = Metrics::init(cfg.resilience.cache_ttl_secs).expect("install recorder");

    let scorer = EnsembleScorer::from_config(&cfg, |p| {
        Arc::new(MockTransport::for_perspective(p)) as Arc<dyn Transport>
    })
    .expect("scorer from default config");

    // Same text twice: misses first, hits second.
    let text = "Parliament extended the session to finish the housing bill.";
    scorer.analyze(text).await.expect("first analysis");
    scorer.analyze(text).await.expect("second analysis");

    let resp = metrics
        .router()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    // axum::body::to_bytes requires an explicit limit
    let body = body::to_bytes(resp.into_body(), 1_048_576).await.unwrap(); // 1 MiB
    let text = String::from_utf8(body.to_vec()).unwrap();

    for needle in [
        "resilient_cache_hits_total",
        "resilient_cache_misses_total",
        "resilient_calls_total",
        "resilient_call_ms",
        "resilient_cache_ttl_secs",
        "ensemble_analyses_total",
    ] {
        assert!(
            text.contains(needle),
            "metrics exposition missing '{needle}'\n{text}"
        );
    }
    assert!(text.contains(r#"endpoint="left""#), "per-endpoint label\n{text}");
}
