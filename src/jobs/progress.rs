// src/jobs/progress.rs
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::model::ArticleId;

/// Lifecycle of one re-analysis job. Wire names follow the progress API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    #[serde(rename = "InProgress")]
    Running,
    Completed,
    #[serde(rename = "Error")]
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// One progress update as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub status: JobStatus,
    pub step: String,
    pub percent: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_score: Option<f64>,
    /// Stable error code when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub last_updated: i64,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Immutable view of a job, handed out by the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub article_id: ArticleId,
    pub status: JobStatus,
    pub step: String,
    pub percent: u8,
    pub message: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn queued(article_id: ArticleId) -> Self {
        let now = Utc::now();
        Self {
            article_id,
            status: JobStatus::Queued,
            step: "queued".to_string(),
            percent: 0,
            message: "Re-analysis queued".to_string(),
            started_at: now,
            finished_at: None,
            final_score: None,
            error: None,
            last_updated: now,
        }
    }

    pub fn event(&self) -> ProgressEvent {
        ProgressEvent {
            status: self.status,
            step: self.step.clone(),
            percent: self.percent,
            message: self.message.clone(),
            final_score: self.final_score,
            error: self.error.clone(),
            last_updated: self.last_updated.timestamp(),
        }
    }
}

/// Ordered progress for one job, ending after exactly one terminal event.
///
/// Backed by a bounded broadcast receiver: a slow subscriber skips the
/// oldest buffered events. The terminal event is always the newest one sent,
/// so it survives any overflow.
#[derive(Debug)]
pub struct Subscription {
    article_id: ArticleId,
    initial: Option<ProgressEvent>,
    rx: Option<broadcast::Receiver<ProgressEvent>>,
    done: bool,
}

impl Subscription {
    pub(crate) fn new(
        article_id: ArticleId,
        initial: ProgressEvent,
        rx: Option<broadcast::Receiver<ProgressEvent>>,
    ) -> Self {
        Self {
            article_id,
            initial: Some(initial),
            rx,
            done: false,
        }
    }

    pub fn article_id(&self) -> ArticleId {
        self.article_id
    }

    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if self.done {
            return None;
        }
        if let Some(ev) = self.initial.take() {
            self.done = ev.is_terminal();
            return Some(ev);
        }
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    self.done = ev.is_terminal();
                    return Some(ev);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(article_id = self.article_id, skipped, "progress subscriber lagged");
                }
                Err(RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        async_stream::stream! {
            let mut sub = self;
            while let Some(ev) = sub.next().await {
                yield ev;
            }
        }
    }
}
