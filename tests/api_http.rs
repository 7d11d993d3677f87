// tests/api_http.rs
//
// HTTP-level tests for the public API Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot, with
// scripted transports standing in for the perspective services.
//
// Covered:
// - GET  /health, /api/scoring/health
// - POST /api/articles, GET /api/articles/{id}
// - POST /api/articles/{id}/reanalyze  (accepted / already in progress / 404 / 400)
// - GET  /api/articles/{id}/progress    (SSE until the terminal event)
// - GET  /api/articles/{id}/job, /api/articles/{id}/score

mod common;

use std::time::Duration;

use serde_json::json;
use serde_json::Value as Json;
use shuttle_axum::axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    response::IntoResponse,
    Router,
};
use tower::ServiceExt as _; // for `oneshot`

use common::{fixed_transports, scorer, seeded_store, Transports};
use news_bias_scorer::api::{self, AppState};
use news_bias_scorer::config::ScoringConfig;
use news_bias_scorer::model::Perspective;
use news_bias_scorer::ScoringError;

const BODY_LIMIT: usize = 1024 * 1024; // 1MB, safe for tests

/// Router over articles `ids`, scored by `t`.
fn test_router(t: &Transports, ids: &[i64]) -> Router {
    let store = seeded_store(ids);
    let mut state = AppState::new(scorer(t), store.clone(), &ScoringConfig::default());
    state.articles = Some(store);
    api::router(state)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Json>) -> (StatusCode, String) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(v) => builder
            .header("content-type", "application/json")
            .body(Body::from(v.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("build request");

    let resp = app.clone().oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body")
        .to_vec();
    (status, String::from_utf8(bytes).expect("utf8"))
}

fn json_of(body: &str) -> Json {
    serde_json::from_str(body).expect("valid JSON body")
}

#[tokio::test]
async fn api_health_returns_200_and_ok_body() {
    let app = test_router(&fixed_transports(Duration::ZERO), &[]);
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK, "health should be 200");
    assert_eq!(body.trim(), "OK");
}

#[tokio::test]
async fn scoring_health_lists_closed_circuits() {
    let app = test_router(&fixed_transports(Duration::ZERO), &[]);
    let (status, body) = send(&app, "GET", "/api/scoring/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let v = json_of(&body);
    assert_eq!(v["healthy"], true);
    let endpoints = v["endpoints"].as_array().unwrap();
    assert_eq!(endpoints.len(), 3);
    assert!(endpoints.iter().all(|e| e["circuit"] == "closed"));
}

#[tokio::test]
async fn reanalyze_rejects_bad_and_unknown_ids() {
    let app = test_router(&fixed_transports(Duration::ZERO), &[1]);

    let (status, body) = send(&app, "POST", "/api/articles/0/reanalyze", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_of(&body)["error"], "validation");

    let (status, body) = send(&app, "POST", "/api/articles/999/reanalyze", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json_of(&body)["error"], "not_found");
}

#[tokio::test]
async fn reanalyze_accepts_then_reports_already_in_progress() {
    let t = fixed_transports(Duration::from_millis(100));
    let app = test_router(&t, &[42]);

    let (status, body) = send(&app, "POST", "/api/articles/42/reanalyze", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let v = json_of(&body);
    assert_eq!(v["status"], "accepted");
    assert_eq!(v["article_id"], 42);
    assert_eq!(v["job"]["status"], "Queued");

    let (status, body) = send(&app, "POST", "/api/articles/42/reanalyze", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_of(&body)["status"], "already in progress");
}

#[tokio::test]
async fn progress_stream_ends_with_completed_event() {
    let t = fixed_transports(Duration::from_millis(10));
    let app = test_router(&t, &[8]);

    let (status, _) = send(&app, "POST", "/api/articles/8/reanalyze", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // The SSE body closes after the terminal event, so reading it to the end terminates.
    let (status, body) = send(&app, "GET", "/api/articles/8/progress", None).await;
    assert_eq!(status, StatusCode::OK);

    let events: Vec<Json> = body
        .lines()
        .filter_map(|l| l.strip_prefix("data:"))
        .map(|d| json_of(d.trim()))
        .collect();
    assert!(
        body.lines().any(|l| l.starts_with("event:") && l.trim_end().ends_with("progress")),
        "{body}"
    );
    let last = events.last().expect("at least one event");
    assert_eq!(last["status"], "Completed");
    assert_eq!(last["percent"], 100);
    assert!(last["final_score"].as_f64().is_some());
    assert_eq!(events.iter().filter(|e| e["status"] == "Completed").count(), 1);
}

#[tokio::test]
async fn progress_without_job_is_404() {
    let app = test_router(&fixed_transports(Duration::ZERO), &[3]);
    let (status, _) = send(&app, "GET", "/api/articles/3/progress", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, "GET", "/api/articles/3/job", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn score_endpoint_returns_latest_composite_after_completion() {
    let t = fixed_transports(Duration::ZERO);
    let app = test_router(&t, &[15]);

    let (_, body) = send(&app, "GET", "/api/articles/15/score", None).await;
    assert!(json_of(&body)["composite"].is_null(), "no score before analysis");

    send(&app, "POST", "/api/articles/15/reanalyze", None).await;
    let (_, _) = send(&app, "GET", "/api/articles/15/progress", None).await;

    let (status, body) = send(&app, "GET", "/api/articles/15/job", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_of(&body)["status"], "Completed");

    let (status, body) = send(&app, "GET", "/api/articles/15/score", None).await;
    assert_eq!(status, StatusCode::OK);
    let v = json_of(&body);
    let composite = v["composite"]["result"]["composite_score"].as_f64().unwrap();
    assert!((composite - 0.929).abs() < 1e-3, "{composite}");
    assert_eq!(v["composite"]["version"], 1);
    assert_eq!(v["perspectives"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn articles_can_be_registered_and_fetched() {
    let app = test_router(&fixed_transports(Duration::ZERO), &[]);

    let payload = json!({
        "id": 77,
        "source": "wire",
        "title": "Budget vote",
        "body": "The assembly passed the budget."
    });
    let (status, body) = send(&app, "POST", "/api/articles", Some(payload)).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(json_of(&body)["id"], 77);

    let (status, body) = send(&app, "GET", "/api/articles/77", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_of(&body)["title"], "Budget vote");

    let bad = json!({ "id": -1, "body": "x" });
    let (status, _) = send(&app, "POST", "/api/articles", Some(bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn all_upstreams_failed_maps_status_by_cause() {
    let rejected = ScoringError::AllUpstreamsFailed {
        causes: vec![(
            Perspective::Left,
            ScoringError::UpstreamRejected {
                endpoint: "left".into(),
                status: 401,
                message: "invalid api key".into(),
            },
        )],
    };
    let resp = rejected.into_response();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    let v: Json = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(v["error"], "all_upstreams_failed");
    assert!(v["message"].as_str().unwrap().contains("left: upstream_rejected"));

    let open = ScoringError::AllUpstreamsFailed {
        causes: vec![(
            Perspective::Right,
            ScoringError::CircuitOpen {
                endpoint: "right".into(),
                retry_in: None,
            },
        )],
    };
    assert_eq!(open.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
}
