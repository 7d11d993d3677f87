//! Score store: append-only versioned perspective scores and composites,
//! plus read access to articles.
//!
//! `InMemoryScoreStore` is the shipped implementation. With a snapshot path it
//! persists the whole table as JSON after every write (tmp file + rename).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScoringError};
use crate::model::{
    Article, ArticleId, CompositeResult, NewPerspectiveScore, Perspective, PerspectiveScore,
    StoredComposite,
};

#[async_trait]
pub trait ScoreStore: Send + Sync {
    /// `NotFound` when the article does not exist.
    async fn fetch_article(&self, article_id: ArticleId) -> Result<Article>;

    /// Append a new version for `(article_id, perspective)`.
    async fn insert_perspective_score(&self, score: NewPerspectiveScore) -> Result<PerspectiveScore>;

    async fn insert_composite(
        &self,
        article_id: ArticleId,
        result: CompositeResult,
        perspective_versions: BTreeMap<Perspective, u64>,
    ) -> Result<StoredComposite>;

    /// Highest version per perspective, in perspective order.
    async fn latest_perspective_scores(&self, article_id: ArticleId) -> Result<Vec<PerspectiveScore>>;

    async fn latest_composite_for(&self, article_id: ArticleId) -> Result<Option<StoredComposite>>;

    /// Persist one finished analysis: a new version per perspective, then the
    /// composite referencing those versions. Implementations backed by a
    /// transactional store should override this to commit all-or-nothing.
    async fn record_analysis(
        &self,
        article_id: ArticleId,
        scores: Vec<NewPerspectiveScore>,
        result: CompositeResult,
    ) -> Result<StoredComposite> {
        let mut versions = BTreeMap::new();
        for score in scores {
            let stored = self.insert_perspective_score(score).await?;
            versions.insert(stored.perspective, stored.version);
        }
        self.insert_composite(article_id, result, versions).await
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    articles: BTreeMap<ArticleId, Article>,
    scores: Vec<PerspectiveScore>,
    composites: Vec<StoredComposite>,
}

#[derive(Debug, Default)]
pub struct InMemoryScoreStore {
    data: Mutex<StoreData>,
    snapshot_path: Option<PathBuf>,
}

impl InMemoryScoreStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store backed by a JSON snapshot file; loads it when it already exists.
    pub fn with_snapshot<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("reading score snapshot {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing score snapshot {}", path.display()))?
        } else {
            StoreData::default()
        };
        Ok(Self {
            data: Mutex::new(data),
            snapshot_path: Some(path),
        })
    }

    pub fn insert_article(&self, article: Article) -> Result<()> {
        if article.id <= 0 {
            return Err(ScoringError::Validation(format!("invalid article id {}", article.id)));
        }
        let mut data = self.lock();
        data.articles.insert(article.id, article);
        self.save(&data)
    }

    /// Every stored version for one perspective, oldest first.
    pub fn perspective_history(&self, article_id: ArticleId, perspective: Perspective) -> Vec<PerspectiveScore> {
        self.lock()
            .scores
            .iter()
            .filter(|s| s.article_id == article_id && s.perspective == perspective)
            .cloned()
            .collect()
    }

    pub fn composite_count(&self, article_id: ArticleId) -> usize {
        self.lock()
            .composites
            .iter()
            .filter(|c| c.article_id == article_id)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, StoreData> {
        self.data.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Write the snapshot while the caller still holds the lock, so files
    /// land in commit order.
    fn save(&self, data: &StoreData) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(data)
            .map_err(|e| ScoringError::Storage(format!("serializing snapshot: {e}")))?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| ScoringError::Storage(e.to_string()))?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)
            .and_then(|_| fs::rename(&tmp, path))
            .map_err(|e| ScoringError::Storage(format!("writing {}: {e}", path.display())))
    }
}

#[async_trait]
impl ScoreStore for InMemoryScoreStore {
    async fn fetch_article(&self, article_id: ArticleId) -> Result<Article> {
        self.lock()
            .articles
            .get(&article_id)
            .cloned()
            .ok_or_else(|| ScoringError::NotFound(format!("article {article_id}")))
    }

    async fn insert_perspective_score(&self, score: NewPerspectiveScore) -> Result<PerspectiveScore> {
        let mut data = self.lock();
        let version = next_score_version(&data, score.article_id, score.perspective);
        let stored = PerspectiveScore {
            article_id: score.article_id,
            perspective: score.perspective,
            score: score.score,
            confidence: score.confidence,
            raw_metadata: score.raw_metadata,
            version,
            created_at: Utc::now(),
        };
        data.scores.push(stored.clone());
        self.save(&data)?;
        Ok(stored)
    }

    async fn insert_composite(
        &self,
        article_id: ArticleId,
        result: CompositeResult,
        perspective_versions: BTreeMap<Perspective, u64>,
    ) -> Result<StoredComposite> {
        let mut data = self.lock();
        let version = next_composite_version(&data, article_id);
        let stored = StoredComposite {
            article_id,
            version,
            result,
            perspective_versions,
            created_at: Utc::now(),
        };
        data.composites.push(stored.clone());
        self.save(&data)?;
        Ok(stored)
    }

    async fn record_analysis(
        &self,
        article_id: ArticleId,
        scores: Vec<NewPerspectiveScore>,
        result: CompositeResult,
    ) -> Result<StoredComposite> {
        let mut data = self.lock();
        let now = Utc::now();
        let mut staged = Vec::with_capacity(scores.len());
        let mut versions = BTreeMap::new();
        for score in scores {
            if score.article_id != article_id {
                return Err(ScoringError::Validation(format!(
                    "score for article {} recorded under {article_id}",
                    score.article_id
                )));
            }
            let version = next_score_version(&data, article_id, score.perspective);
            versions.insert(score.perspective, version);
            staged.push(PerspectiveScore {
                article_id,
                perspective: score.perspective,
                score: score.score,
                confidence: score.confidence,
                raw_metadata: score.raw_metadata,
                version,
                created_at: now,
            });
        }
        let composite = StoredComposite {
            article_id,
            version: next_composite_version(&data, article_id),
            result,
            perspective_versions: versions,
            created_at: now,
        };

        let before = (data.scores.len(), data.composites.len());
        data.scores.extend(staged);
        data.composites.push(composite.clone());
        if let Err(e) = self.save(&data) {
            data.scores.truncate(before.0);
            data.composites.truncate(before.1);
            return Err(e);
        }
        Ok(composite)
    }

    async fn latest_perspective_scores(&self, article_id: ArticleId) -> Result<Vec<PerspectiveScore>> {
        let data = self.lock();
        let mut latest: BTreeMap<Perspective, &PerspectiveScore> = BTreeMap::new();
        for s in data.scores.iter().filter(|s| s.article_id == article_id) {
            let newer = latest
                .get(&s.perspective)
                .map_or(true, |cur| s.version > cur.version);
            if newer {
                latest.insert(s.perspective, s);
            }
        }
        Ok(latest.into_values().cloned().collect())
    }

    async fn latest_composite_for(&self, article_id: ArticleId) -> Result<Option<StoredComposite>> {
        Ok(self
            .lock()
            .composites
            .iter()
            .filter(|c| c.article_id == article_id)
            .max_by_key(|c| c.version)
            .cloned())
    }
}

fn next_score_version(data: &StoreData, article_id: ArticleId, perspective: Perspective) -> u64 {
    data.scores
        .iter()
        .filter(|s| s.article_id == article_id && s.perspective == perspective)
        .map(|s| s.version)
        .max()
        .unwrap_or(0)
        + 1
}

fn next_composite_version(data: &StoreData, article_id: ArticleId) -> u64 {
    data.composites
        .iter()
        .filter(|c| c.article_id == article_id)
        .map(|c| c.version)
        .max()
        .unwrap_or(0)
        + 1
}
