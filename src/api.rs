use std::convert::Infallible;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use shuttle_axum::axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::config::{mock_mode_enabled, ScoringConfig};
use crate::ensemble::EnsembleScorer;
use crate::error::ScoringError;
use crate::jobs::{ReanalysisJobManager, TriggerOutcome};
use crate::model::{Article, ArticleId};
use crate::resilient::{CircuitStatus, HttpTransport, MockTransport, Transport};
use crate::store::{InMemoryScoreStore, ScoreStore};

#[derive(Clone)]
pub struct AppState {
    pub jobs: ReanalysisJobManager,
    pub scorer: Arc<EnsembleScorer>,
    pub store: Arc<dyn ScoreStore>,
    /// Present when articles can be registered over HTTP.
    pub articles: Option<Arc<InMemoryScoreStore>>,
}

impl AppState {
    pub fn new(scorer: Arc<EnsembleScorer>, store: Arc<dyn ScoreStore>, cfg: &ScoringConfig) -> Self {
        let jobs = ReanalysisJobManager::new(scorer.clone(), store.clone(), cfg.jobs.clone());
        Self {
            jobs,
            scorer,
            store,
            articles: None,
        }
    }

    /// Full wiring from config: real HTTP transport, or the mock when
    /// `AI_TEST_MODE=mock`. The in-memory store doubles as the article intake.
    pub fn from_config(cfg: &ScoringConfig, store: Arc<InMemoryScoreStore>) -> anyhow::Result<Self> {
        let http: Option<Arc<dyn Transport>> = if mock_mode_enabled() {
            tracing::warn!("AI_TEST_MODE=mock, perspective calls are answered locally");
            None
        } else {
            Some(Arc::new(HttpTransport::new(cfg.resilience.connect_timeout())?))
        };
        let scorer = EnsembleScorer::from_config(cfg, |p| match &http {
            Some(t) => t.clone(),
            None => Arc::new(MockTransport::for_perspective(p)),
        })?;
        let mut state = Self::new(Arc::new(scorer), store.clone(), cfg);
        state.articles = Some(store);
        Ok(state)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/scoring/health", get(scoring_health))
        .route("/api/articles", post(create_article))
        .route("/api/articles/{id}", get(get_article))
        .route("/api/articles/{id}/reanalyze", post(reanalyze))
        .route("/api/articles/{id}/progress", get(progress))
        .route("/api/articles/{id}/job", get(job_status))
        .route("/api/articles/{id}/score", get(latest_score))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

impl IntoResponse for ScoringError {
    fn into_response(self) -> Response {
        let status = match &self {
            ScoringError::Validation(_) => StatusCode::BAD_REQUEST,
            ScoringError::NotFound(_) => StatusCode::NOT_FOUND,
            ScoringError::UpstreamRateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            ScoringError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ScoringError::CircuitOpen { .. } | ScoringError::UpstreamUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ScoringError::UpstreamRejected { .. } => StatusCode::BAD_GATEWAY,
            ScoringError::AllUpstreamsFailed { .. } if self.is_transient() => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ScoringError::AllUpstreamsFailed { .. } => StatusCode::BAD_GATEWAY,
            ScoringError::InvalidModelOutput { .. }
            | ScoringError::AllPerspectivesInvalid
            | ScoringError::AllScoresZeroConfidence => StatusCode::UNPROCESSABLE_ENTITY,
            ScoringError::Storage(_) | ScoringError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = json!({ "error": self.code(), "message": self.user_message() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ScoringError>;

fn check_id(id: ArticleId) -> ApiResult<ArticleId> {
    if id <= 0 {
        return Err(ScoringError::Validation(format!("invalid article id {id}")));
    }
    Ok(id)
}

async fn reanalyze(
    State(state): State<AppState>,
    Path(id): Path<ArticleId>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let id = check_id(id)?;
    state.store.fetch_article(id).await?;
    match state.jobs.trigger(id)? {
        TriggerOutcome::Accepted(job) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "status": "accepted", "article_id": id, "job": job })),
        )),
        TriggerOutcome::AlreadyInProgress(job) => Ok((
            StatusCode::OK,
            Json(json!({ "status": "already in progress", "article_id": id, "job": job })),
        )),
    }
}

async fn progress(
    State(state): State<AppState>,
    Path(id): Path<ArticleId>,
) -> ApiResult<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let id = check_id(id)?;
    let sub = state.jobs.subscribe(id)?;
    let events = sub.into_stream().map(|ev| {
        let data = serde_json::to_string(&ev).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event("progress").data(data))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<ArticleId>,
) -> ApiResult<Json<Value>> {
    let id = check_id(id)?;
    let job = state
        .jobs
        .status(id)
        .ok_or_else(|| ScoringError::NotFound(format!("no re-analysis job for article {id}")))?;
    Ok(Json(json!(job)))
}

async fn latest_score(
    State(state): State<AppState>,
    Path(id): Path<ArticleId>,
) -> ApiResult<Json<Value>> {
    let id = check_id(id)?;
    state.store.fetch_article(id).await?;
    let composite = state.store.latest_composite_for(id).await?;
    let perspectives = state.store.latest_perspective_scores(id).await?;
    Ok(Json(json!({
        "article_id": id,
        "composite": composite,
        "perspectives": perspectives,
    })))
}

#[derive(Deserialize)]
struct NewArticle {
    id: ArticleId,
    #[serde(default)]
    source: String,
    #[serde(default)]
    title: String,
    body: String,
    #[serde(default)]
    published_at: Option<chrono::DateTime<chrono::Utc>>,
}

async fn create_article(
    State(state): State<AppState>,
    Json(req): Json<NewArticle>,
) -> ApiResult<(StatusCode, Json<Article>)> {
    let intake = state
        .articles
        .as_ref()
        .ok_or_else(|| ScoringError::Validation("article intake is disabled".into()))?;
    let article = Article {
        id: check_id(req.id)?,
        source: req.source,
        title: req.title,
        body: req.body,
        published_at: req.published_at.unwrap_or_else(chrono::Utc::now),
    };
    intake.insert_article(article.clone())?;
    Ok((StatusCode::CREATED, Json(article)))
}

async fn get_article(
    State(state): State<AppState>,
    Path(id): Path<ArticleId>,
) -> ApiResult<Json<Article>> {
    let id = check_id(id)?;
    Ok(Json(state.store.fetch_article(id).await?))
}

/// Breaker state per perspective endpoint; 503 while any circuit is open.
async fn scoring_health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let mut degraded = false;
    let endpoints: Vec<Value> = state
        .scorer
        .circuits()
        .into_iter()
        .map(|(p, snap)| match snap {
            Some(s) => {
                degraded |= s.status == CircuitStatus::Open;
                json!({ "perspective": p, "circuit": s.status, "failures": s.failure_count })
            }
            None => json!({ "perspective": p, "circuit": Value::Null }),
        })
        .collect();
    let status = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(json!({ "healthy": !degraded, "endpoints": endpoints })),
    )
}
