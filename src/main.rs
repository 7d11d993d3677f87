//! News Bias Scorer: Binary Entrypoint
//! Boots the Axum HTTP server: scoring config, score store, re-analysis
//! jobs with their pruner, and the Prometheus `/metrics` route.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use shuttle_axum::ShuttleAxum;

use news_bias_scorer::{
    api::{self, AppState},
    config::ScoringConfig,
    metrics::Metrics,
    store::InMemoryScoreStore,
    telemetry,
};

const ENV_SCORE_STORE_PATH: &str = "SCORE_STORE_PATH";

fn build() -> anyhow::Result<shuttle_axum::axum::Router> {
    let cfg = ScoringConfig::load_default().context("loading scoring config")?;

    let store = match std::env::var(ENV_SCORE_STORE_PATH) {
        Ok(path) => Arc::new(
            InMemoryScoreStore::with_snapshot(&path)
                .with_context(|| format!("opening score store at {path}"))?,
        ),
        Err(_) => Arc::new(InMemoryScoreStore::new()),
    };

    let metrics = Metrics::init(cfg.resilience.cache_ttl_secs).context("installing metrics recorder")?;

    let state = AppState::from_config(&cfg, store)?;
    state
        .jobs
        .spawn_pruner(Duration::from_secs(cfg.jobs.prune_interval_secs));

    tracing::info!(
        perspectives = cfg.perspectives.len(),
        max_attempts = cfg.resilience.max_attempts,
        cache = cfg.resilience.cache_enabled,
        "news bias scorer ready"
    );

    Ok(api::router(state).merge(metrics.router()))
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    telemetry::init_tracing();

    let router = build().map_err(shuttle_runtime::Error::Custom)?;
    Ok(router.into())
}
