//! Vector similarity over stored email embeddings and label centroids
//!
//! Every comparison is restricted to vectors produced by the query's model.
//! Rows from another model never reach the distance function, and a row whose
//! dimension differs from the query is skipped as well.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::{Result, TriageError};
use crate::models::{Embedding, Label, LabelCentroid};
use crate::store::{self, SqliteStore};

/// Distance function; similarity is `1 - distance`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
}

impl DistanceMetric {
    /// `None` when the vectors cannot be compared
    pub fn distance(&self, a: &[f32], b: &[f32]) -> Option<f32> {
        if a.len() != b.len() || a.is_empty() {
            return None;
        }
        match self {
            DistanceMetric::Cosine => {
                let mut dot = 0.0f32;
                let mut norm_a = 0.0f32;
                let mut norm_b = 0.0f32;
                for (x, y) in a.iter().zip(b) {
                    dot += x * y;
                    norm_a += x * x;
                    norm_b += y * y;
                }
                if norm_a == 0.0 || norm_b == 0.0 {
                    return None;
                }
                Some(1.0 - dot / (norm_a.sqrt() * norm_b.sqrt()))
            }
            DistanceMetric::Euclidean => Some(
                a.iter()
                    .zip(b)
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum::<f32>()
                    .sqrt(),
            ),
        }
    }

    pub fn similarity(&self, a: &[f32], b: &[f32]) -> Option<f32> {
        self.distance(a, b).map(|d| 1.0 - d)
    }
}

impl FromStr for DistanceMetric {
    type Err = TriageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            other => Err(TriageError::ConfigError(format!(
                "unknown distance metric '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMetric::Cosine => f.write_str("cosine"),
            DistanceMetric::Euclidean => f.write_str("euclidean"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelMatch {
    pub label: Label,
    pub similarity: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmailMatch {
    pub email_id: i64,
    pub similarity: f32,
}

/// Fold one vector into a label's running mean.
///
/// Runs on whatever connection it is given so callers can include it in a
/// larger transaction. A stored centroid of another dimension is replaced.
pub fn apply_centroid_update(
    conn: &Connection,
    label_id: i64,
    embedding: &Embedding,
    now: DateTime<Utc>,
) -> Result<LabelCentroid> {
    let updated = match store::get_centroid(conn, label_id, &embedding.model)? {
        Some(existing) if existing.centroid.len() == embedding.vector.len() => {
            let n = existing.email_count as f32;
            let centroid = existing
                .centroid
                .iter()
                .zip(&embedding.vector)
                .map(|(mean, v)| (mean * n + v) / (n + 1.0))
                .collect();
            LabelCentroid {
                centroid,
                email_count: existing.email_count + 1,
                ..existing
            }
        }
        existing => {
            if let Some(stale) = existing {
                warn!(
                    label_id,
                    model = %embedding.model,
                    stored_dim = stale.centroid.len(),
                    new_dim = embedding.vector.len(),
                    "Centroid dimension changed, restarting mean"
                );
            }
            LabelCentroid {
                label_id,
                model: embedding.model.clone(),
                centroid: embedding.vector.clone(),
                email_count: 1,
            }
        }
    };

    store::put_centroid(conn, &updated, now)?;
    Ok(updated)
}

/// Similarity search over centroids and stored email embeddings
#[derive(Clone)]
pub struct SimilarityIndex {
    store: SqliteStore,
    metric: DistanceMetric,
}

impl SimilarityIndex {
    pub fn new(store: SqliteStore, metric: DistanceMetric) -> Self {
        Self { store, metric }
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Labels whose centroid is within `min_similarity`, best first
    pub async fn find_similar(
        &self,
        embedding: &[f32],
        model: &str,
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<LabelMatch>> {
        let model_owned = model.to_string();
        let centroids = self
            .store
            .with_conn(move |conn| store::centroids_for_model(conn, &model_owned))
            .await?;

        let mut matches: Vec<LabelMatch> = centroids
            .into_iter()
            .filter(|(centroid, _)| centroid.model == model)
            .filter_map(|(centroid, label)| {
                let similarity = self.metric.similarity(embedding, &centroid.centroid)?;
                (similarity >= min_similarity).then_some(LabelMatch { label, similarity })
            })
            .collect();

        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(k);
        debug!(model, candidates = matches.len(), "Centroid search");
        Ok(matches)
    }

    /// Previously embedded emails within `min_similarity`, best first
    pub async fn find_similar_emails(
        &self,
        embedding: &[f32],
        model: &str,
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<EmailMatch>> {
        let model_owned = model.to_string();
        let rows = self
            .store
            .with_conn(move |conn| store::email_embeddings_for_model(conn, &model_owned))
            .await?;

        let mut matches: Vec<EmailMatch> = rows
            .into_iter()
            .filter_map(|(email_id, vector)| {
                let similarity = self.metric.similarity(embedding, &vector)?;
                (similarity >= min_similarity).then_some(EmailMatch { email_id, similarity })
            })
            .collect();

        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(k);
        Ok(matches)
    }

    /// Atomic running-mean update for one label under the embedding's model
    pub async fn update_centroid(&self, label_id: i64, embedding: &Embedding) -> Result<LabelCentroid> {
        let embedding = embedding.clone();
        self.store
            .transaction(move |tx| apply_centroid_update(tx, label_id, &embedding, Utc::now()))
            .await
    }
}
