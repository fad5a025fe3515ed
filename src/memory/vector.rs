//! Vector index abstraction backing semantic recall (spec 4.5).
//!
//! No vector-database client crate is part of the dependency stack, so
//! the HTTP-backed implementation speaks a small subset of a Qdrant-style
//! REST collection API (`points/upsert`, `points/search`,
//! `points/delete`) directly over `reqwest`. An in-memory implementation
//! (cosine similarity over a guarded `Vec`) is the default and test
//! backend, mirroring the donor codebase's posture of always providing a
//! local fallback when an external embedding/vector service is absent.

use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::errors::ErrorKind;

/// Errors the vector index can produce (spec 7).
#[derive(Debug, Error)]
pub enum VectorError {
    /// The embedding's dimension did not match the collection's.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension the collection is configured for.
        expected: usize,
        /// Dimension of the embedding that was provided.
        actual: usize,
    },
    /// The HTTP-backed index returned a transport or protocol error.
    #[error("vector store request failed: {0}")]
    Transport(String),
}

impl VectorError {
    /// Classify this error per spec 7's abstract kinds.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DimensionMismatch { .. } => ErrorKind::Permanent,
            Self::Transport(_) => ErrorKind::Transient,
        }
    }
}

/// Payload filter fields carried alongside a vector point (spec 4.5:
/// `{userId, kind, tags}`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorPayload {
    /// Owning user, for filtering.
    pub user_id: String,
    /// Memory kind, for filtering.
    pub kind: String,
    /// Tags, for any-of filtering.
    pub tags: Vec<String>,
}

/// Filter applied to a vector search (spec 4.5).
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    /// Restrict to this user.
    pub user_id: Option<String>,
    /// Restrict to this kind.
    pub kind: Option<String>,
    /// Restrict to points carrying any of these tags.
    pub tags: Vec<String>,
}

impl VectorFilter {
    fn matches(&self, payload: &VectorPayload) -> bool {
        if let Some(user_id) = &self.user_id {
            if &payload.user_id != user_id {
                return false;
            }
        }
        if let Some(kind) = &self.kind {
            if &payload.kind != kind {
                return false;
            }
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| payload.tags.contains(t)) {
            return false;
        }
        true
    }
}

/// A scored hit from `search` (spec 4.5).
#[derive(Debug, Clone)]
pub struct VectorHit {
    /// Id of the matching point (== the row's id).
    pub id: String,
    /// Cosine similarity score, higher is more similar.
    pub score: f32,
    /// The payload stored alongside the point.
    pub payload: VectorPayload,
}

/// Dual-store coherence partner for the row store (spec 4.5).
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the point at `id`.
    ///
    /// # Errors
    ///
    /// Returns [`VectorError::DimensionMismatch`] if `embedding.len()`
    /// does not match the collection's configured dimension.
    async fn upsert(
        &self,
        id: &str,
        embedding: Vec<f32>,
        payload: VectorPayload,
    ) -> Result<(), VectorError>;

    /// Delete the point at `id`, if present. Deleting a missing point is
    /// not an error (spec 4.5's orphan sweep relies on this).
    async fn delete(&self, id: &str) -> Result<(), VectorError>;

    /// Top-`limit` points by cosine similarity to `embedding`, filtered.
    async fn search(
        &self,
        embedding: &[f32],
        filter: VectorFilter,
        limit: usize,
    ) -> Result<Vec<VectorHit>, VectorError>;

    /// Ids of every point currently stored, for the orphan-vector sweep.
    async fn list_ids(&self) -> Result<Vec<String>, VectorError>;
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

struct StoredPoint {
    id: String,
    embedding: Vec<f32>,
    payload: VectorPayload,
}

/// In-process, in-memory vector index. Default backend when no
/// `vector_endpoint` is configured, and the backend used by tests.
pub struct InMemoryVectorIndex {
    dimension: usize,
    points: RwLock<Vec<StoredPoint>>,
}

impl InMemoryVectorIndex {
    /// Build an index that accepts embeddings of exactly `dimension`.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self { dimension, points: RwLock::new(Vec::new()) }
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, id: &str, embedding: Vec<f32>, payload: VectorPayload) -> Result<(), VectorError> {
        if embedding.len() != self.dimension {
            return Err(VectorError::DimensionMismatch { expected: self.dimension, actual: embedding.len() });
        }
        let mut points = self.points.write().expect("lock poisoned");
        points.retain(|p| p.id != id);
        points.push(StoredPoint { id: id.to_owned(), embedding, payload });
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), VectorError> {
        let mut points = self.points.write().expect("lock poisoned");
        points.retain(|p| p.id != id);
        Ok(())
    }

    async fn search(
        &self,
        embedding: &[f32],
        filter: VectorFilter,
        limit: usize,
    ) -> Result<Vec<VectorHit>, VectorError> {
        let points = self.points.read().expect("lock poisoned");
        let mut scored: Vec<VectorHit> = points
            .iter()
            .filter(|p| filter.matches(&p.payload))
            .map(|p| VectorHit {
                id: p.id.clone(),
                score: cosine_similarity(embedding, &p.embedding),
                payload: p.payload.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn list_ids(&self) -> Result<Vec<String>, VectorError> {
        Ok(self.points.read().expect("lock poisoned").iter().map(|p| p.id.clone()).collect())
    }
}

/// HTTP-backed vector index speaking a Qdrant-style REST collection API.
pub struct HttpVectorIndex {
    client: reqwest::Client,
    base_url: String,
    collection: String,
}

impl HttpVectorIndex {
    /// Point the index at `base_url`'s `collection`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, collection: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into(), collection: collection.into() }
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!("{}/collections/{}/{}", self.base_url.trim_end_matches('/'), self.collection, suffix)
    }
}

#[async_trait]
impl VectorIndex for HttpVectorIndex {
    async fn upsert(&self, id: &str, embedding: Vec<f32>, payload: VectorPayload) -> Result<(), VectorError> {
        let body = json!({
            "points": [{
                "id": id,
                "vector": embedding,
                "payload": payload,
            }]
        });
        self.client
            .put(self.collection_url("points"))
            .json(&body)
            .send()
            .await
            .map_err(|e| VectorError::Transport(e.to_string()))?
            .error_for_status()
            .map_err(|e| VectorError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), VectorError> {
        let body = json!({ "points": [id] });
        self.client
            .post(self.collection_url("points/delete"))
            .json(&body)
            .send()
            .await
            .map_err(|e| VectorError::Transport(e.to_string()))?
            .error_for_status()
            .map_err(|e| VectorError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn search(
        &self,
        embedding: &[f32],
        filter: VectorFilter,
        limit: usize,
    ) -> Result<Vec<VectorHit>, VectorError> {
        let mut must = Vec::new();
        if let Some(user_id) = &filter.user_id {
            must.push(json!({ "key": "user_id", "match": { "value": user_id } }));
        }
        if let Some(kind) = &filter.kind {
            must.push(json!({ "key": "kind", "match": { "value": kind } }));
        }
        if !filter.tags.is_empty() {
            must.push(json!({ "key": "tags", "match": { "any": filter.tags } }));
        }

        let body = json!({
            "vector": embedding,
            "limit": limit,
            "with_payload": true,
            "filter": { "must": must },
        });

        let response: serde_json::Value = self
            .client
            .post(self.collection_url("points/search"))
            .json(&body)
            .send()
            .await
            .map_err(|e| VectorError::Transport(e.to_string()))?
            .error_for_status()
            .map_err(|e| VectorError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| VectorError::Transport(e.to_string()))?;

        let hits = response["result"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| {
                let id = entry["id"].as_str()?.to_owned();
                let score = entry["score"].as_f64().unwrap_or(0.0);
                let payload: VectorPayload = serde_json::from_value(entry["payload"].clone()).ok()?;
                Some(VectorHit { id, score: score as f32, payload })
            })
            .collect();

        Ok(hits)
    }

    async fn list_ids(&self) -> Result<Vec<String>, VectorError> {
        let body = json!({ "limit": 10_000, "with_payload": false, "with_vector": false });
        let response: serde_json::Value = self
            .client
            .post(self.collection_url("points/scroll"))
            .json(&body)
            .send()
            .await
            .map_err(|e| VectorError::Transport(e.to_string()))?
            .error_for_status()
            .map_err(|e| VectorError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| VectorError::Transport(e.to_string()))?;

        Ok(response["result"]["points"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| entry["id"].as_str().map(str::to_owned))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(user: &str, tags: &[&str]) -> VectorPayload {
        VectorPayload { user_id: user.to_owned(), kind: "fact".to_owned(), tags: tags.iter().map(|s| (*s).to_owned()).collect() }
    }

    #[tokio::test]
    async fn upsert_rejects_wrong_dimension() {
        let index = InMemoryVectorIndex::new(3);
        let result = index.upsert("mem-1", vec![1.0, 0.0], payload("u1", &[])).await;
        assert!(matches!(result, Err(VectorError::DimensionMismatch { expected: 3, actual: 2 })));
    }

    #[tokio::test]
    async fn search_ranks_by_cosine_similarity() {
        let index = InMemoryVectorIndex::new(2);
        index.upsert("close", vec![1.0, 0.0], payload("u1", &[])).await.expect("upsert");
        index.upsert("far", vec![0.0, 1.0], payload("u1", &[])).await.expect("upsert");

        let hits = index.search(&[0.9, 0.1], VectorFilter::default(), 2).await.expect("search");
        assert_eq!(hits[0].id, "close");
    }

    #[tokio::test]
    async fn search_respects_user_filter() {
        let index = InMemoryVectorIndex::new(2);
        index.upsert("mine", vec![1.0, 0.0], payload("u1", &[])).await.expect("upsert");
        index.upsert("theirs", vec![1.0, 0.0], payload("u2", &[])).await.expect("upsert");

        let filter = VectorFilter { user_id: Some("u1".to_owned()), ..Default::default() };
        let hits = index.search(&[1.0, 0.0], filter, 10).await.expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "mine");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let index = InMemoryVectorIndex::new(2);
        index.upsert("mem-1", vec![1.0, 0.0], payload("u1", &[])).await.expect("upsert");
        index.delete("mem-1").await.expect("delete");
        index.delete("mem-1").await.expect("delete again");
        assert!(index.list_ids().await.expect("list").is_empty());
    }
}
