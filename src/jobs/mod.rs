//! Re-analysis job manager.
//!
//! At most one queued or running job per article. `trigger` admits or
//! rejects under the job-table lock and returns without waiting; the worker
//! runs on its own task under a supervisor that turns panics into a `Failed`
//! job. Every state change is published to subscribers while the lock is
//! held, so a subscriber's initial snapshot and the live events never
//! interleave out of order.

pub mod progress;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::JobConfig;
use crate::ensemble::EnsembleScorer;
use crate::error::{Result, ScoringError};
use crate::metrics::ensure_metrics_described;
use crate::model::{ArticleId, NewPerspectiveScore, Perspective};
use crate::store::ScoreStore;

pub use progress::{JobSnapshot, JobStatus, ProgressEvent, Subscription};

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// A new job was queued and its worker spawned.
    Accepted(JobSnapshot),
    /// A job for this article is already queued or running; nothing was spawned.
    AlreadyInProgress(JobSnapshot),
}

impl TriggerOutcome {
    pub fn snapshot(&self) -> &JobSnapshot {
        match self {
            TriggerOutcome::Accepted(s) | TriggerOutcome::AlreadyInProgress(s) => s,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, TriggerOutcome::Accepted(_))
    }
}

struct JobEntry {
    snapshot: JobSnapshot,
    tx: broadcast::Sender<ProgressEvent>,
    finished: Option<Instant>,
}

struct Inner {
    jobs: Mutex<HashMap<ArticleId, JobEntry>>,
    scorer: Arc<EnsembleScorer>,
    store: Arc<dyn ScoreStore>,
    config: JobConfig,
}

#[derive(Clone)]
pub struct ReanalysisJobManager {
    inner: Arc<Inner>,
}

impl ReanalysisJobManager {
    pub fn new(scorer: Arc<EnsembleScorer>, store: Arc<dyn ScoreStore>, config: JobConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(HashMap::new()),
                scorer,
                store,
                config,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn ScoreStore> {
        &self.inner.store
    }

    /// Admit a re-analysis for `article_id`. Must be called inside a tokio runtime.
    pub fn trigger(&self, article_id: ArticleId) -> Result<TriggerOutcome> {
        ensure_metrics_described();
        if article_id <= 0 {
            return Err(ScoringError::Validation(format!("invalid article id {article_id}")));
        }

        let snapshot = {
            let mut jobs = self.lock();
            if let Some(existing) = jobs.get(&article_id) {
                if existing.snapshot.status.is_active() {
                    tracing::info!(article_id, "re-analysis already in progress");
                    return Ok(TriggerOutcome::AlreadyInProgress(existing.snapshot.clone()));
                }
            }
            let snapshot = JobSnapshot::queued(article_id);
            let (tx, _) = broadcast::channel(self.inner.config.subscriber_buffer.max(1));
            jobs.insert(
                article_id,
                JobEntry {
                    snapshot: snapshot.clone(),
                    tx,
                    finished: None,
                },
            );
            publish_active(&jobs);
            snapshot
        };

        tracing::info!(article_id, "re-analysis queued");
        self.spawn_worker(article_id);
        Ok(TriggerOutcome::Accepted(snapshot))
    }

    /// Live progress for a job that is active or finished within the grace period.
    pub fn subscribe(&self, article_id: ArticleId) -> Result<Subscription> {
        let jobs = self.lock();
        let entry = jobs
            .get(&article_id)
            .filter(|e| !self.expired(e))
            .ok_or_else(|| ScoringError::NotFound(format!("no re-analysis job for article {article_id}")))?;
        let rx = entry
            .snapshot
            .status
            .is_active()
            .then(|| entry.tx.subscribe());
        Ok(Subscription::new(article_id, entry.snapshot.event(), rx))
    }

    pub fn status(&self, article_id: ArticleId) -> Option<JobSnapshot> {
        self.lock()
            .get(&article_id)
            .filter(|e| !self.expired(e))
            .map(|e| e.snapshot.clone())
    }

    /// Drop terminal jobs older than the grace period. Returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, e| !self.expired(e));
        let removed = before - jobs.len();
        if removed > 0 {
            tracing::debug!(removed, "pruned finished re-analysis jobs");
        }
        removed
    }

    pub fn spawn_pruner(&self, interval: Duration) -> JoinHandle<()> {
        let mgr = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval.max(Duration::from_millis(10)));
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                mgr.prune_expired();
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ArticleId, JobEntry>> {
        self.inner.jobs.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn expired(&self, entry: &JobEntry) -> bool {
        entry
            .finished
            .is_some_and(|at| at.elapsed() >= self.inner.config.grace_period())
    }

    fn spawn_worker(&self, article_id: ArticleId) {
        let worker = {
            let mgr = self.clone();
            tokio::spawn(async move { mgr.run(article_id).await })
        };
        let mgr = self.clone();
        tokio::spawn(async move {
            let outcome = match worker.await {
                Ok(result) => result,
                Err(join_err) if join_err.is_panic() => {
                    tracing::error!(article_id, "re-analysis worker panicked");
                    Err(ScoringError::Internal("worker panicked".into()))
                }
                Err(_) => Err(ScoringError::Internal("worker cancelled".into())),
            };
            mgr.finish(article_id, outcome);
        });
    }

    async fn run(&self, article_id: ArticleId) -> Result<f64> {
        self.advance(article_id, "fetching-article", 5, "Fetching article");
        let article = self.inner.store.fetch_article(article_id).await?;
        if article.body.trim().is_empty() {
            return Err(ScoringError::Validation(format!("article {article_id} has no body text")));
        }

        self.advance(article_id, "scoring", 10, "Scoring perspectives");
        let mut resolved = 0u8;
        let result = self
            .inner
            .scorer
            .analyze_with_progress(&article.scoring_text(), |perspective, outcome| {
                resolved += 1;
                let message = match outcome {
                    Ok(_) => format!("Scored {perspective} perspective"),
                    Err(e) => format!("{perspective} perspective failed: {}", e.code()),
                };
                self.advance(
                    article_id,
                    &format!("scoring-{perspective}"),
                    10 + 25 * resolved.min(3),
                    &message,
                );
            })
            .await?;

        self.advance(article_id, "persisting", 90, "Saving scores");
        let scores: Vec<NewPerspectiveScore> = result
            .breakdown
            .iter()
            .map(|b| NewPerspectiveScore {
                article_id,
                perspective: b.perspective,
                score: b.score,
                confidence: b.confidence.unwrap_or(0.0),
                raw_metadata: json!({
                    "status": b.status,
                    "detail": b.detail,
                    "metadata": b.metadata,
                }),
            })
            .collect();
        debug_assert_eq!(scores.len(), Perspective::ALL.len());

        let final_score = result.composite_score;
        let stored = self
            .inner
            .store
            .record_analysis(article_id, scores, result)
            .await?;
        tracing::info!(
            article_id,
            composite_version = stored.version,
            composite = final_score,
            confidence = stored.result.confidence,
            uncertain = stored.result.uncertainty_flag,
            "re-analysis persisted"
        );
        Ok(final_score)
    }

    /// Publish a Running step. Percent never moves backwards.
    fn advance(&self, article_id: ArticleId, step: &str, percent: u8, message: &str) {
        let mut jobs = self.lock();
        let Some(entry) = jobs.get_mut(&article_id) else {
            return;
        };
        if entry.snapshot.status.is_terminal() {
            return;
        }
        let snap = &mut entry.snapshot;
        snap.status = JobStatus::Running;
        snap.step = step.to_string();
        snap.percent = percent.clamp(snap.percent, 100);
        snap.message = message.to_string();
        snap.last_updated = Utc::now();
        let _ = entry.tx.send(snap.event());
        publish_active(&jobs);
    }

    /// Move the job to its terminal state exactly once.
    fn finish(&self, article_id: ArticleId, outcome: Result<f64>) {
        let mut jobs = self.lock();
        let Some(entry) = jobs.get_mut(&article_id) else {
            return;
        };
        if entry.snapshot.status.is_terminal() {
            return;
        }
        let now = Utc::now();
        let snap = &mut entry.snapshot;
        match &outcome {
            Ok(score) => {
                snap.status = JobStatus::Completed;
                snap.step = "complete".to_string();
                snap.percent = 100;
                snap.message = "Re-analysis complete".to_string();
                snap.final_score = Some(*score);
                tracing::info!(article_id, final_score = score, "re-analysis completed");
            }
            Err(e) => {
                snap.status = JobStatus::Failed;
                snap.step = "error".to_string();
                snap.message = e.user_message();
                snap.error = Some(e.code().to_string());
                tracing::warn!(
                    article_id,
                    error = %e,
                    code = e.code(),
                    transient = e.is_transient(),
                    "re-analysis failed"
                );
            }
        }
        snap.finished_at = Some(now);
        snap.last_updated = now;
        entry.finished = Some(Instant::now());
        let _ = entry.tx.send(snap.event());
        counter!("reanalysis_jobs_total", "status" => snap.status.as_str()).increment(1);
        publish_active(&jobs);
    }
}

fn publish_active(jobs: &HashMap<ArticleId, JobEntry>) {
    let active = jobs.values().filter(|e| e.snapshot.status.is_active()).count();
    gauge!("reanalysis_jobs_active").set(active as f64);
}
