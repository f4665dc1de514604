//! Vector Store
//!
//! Each chunk becomes a point `<memory id, chunk index> → (vector[D],
//! payload)` in a cosine-distance collection. The payload carries the chunk
//! ciphertext envelope, never plaintext, plus its coordinates. The
//! collection dimension is fixed at creation; mismatched vectors are
//! rejected. Two implementations: an in-process store (single-node default
//! and tests) and an HTTP client for an external collection service.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::embed::cosine_similarity;
use crate::error::{CoreError, Result};
use crate::shield::Envelope;

// ============================================================================
// TYPES
// ============================================================================

/// Payload stored beside each vector. The envelope round-trips through the
/// envelope layer; the vector store never sees chunk plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPayload {
    pub memory_id: String,
    pub chunk_index: u32,
    pub envelope: Envelope,
}

/// A point to upsert
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub memory_id: String,
    pub chunk_index: u32,
    pub vector: Vec<f32>,
    pub payload: ChunkPayload,
}

/// A retrieval hit, cosine similarity in [-1, 1]
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub memory_id: String,
    pub chunk_index: u32,
    pub score: f32,
    pub payload: ChunkPayload,
}

/// The vector collection contract
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Collection dimension D
    fn dimension(&self) -> usize;

    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<()>;

    /// Top-k by cosine similarity, optionally excluding one memory
    /// (self-exclusion in connection synthesis)
    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        exclude_memory: Option<&str>,
    ) -> Result<Vec<ScoredPoint>>;

    /// Drop every point belonging to a memory
    async fn delete_memory(&self, memory_id: &str) -> Result<()>;
}

fn check_dimension(expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(CoreError::PreconditionFailed(format!(
            "vector dimension {got} != collection dimension {expected}"
        )));
    }
    Ok(())
}

// ============================================================================
// IN-PROCESS STORE
// ============================================================================

/// Brute-force cosine store. Exact, dependency-free, and plenty for a
/// single-owner corpus; the HTTP store takes over at larger scale.
pub struct MemoryVectorStore {
    dimension: usize,
    points: RwLock<HashMap<(String, u32), VectorPoint>>,
}

impl MemoryVectorStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            points: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.points.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<()> {
        for point in &points {
            check_dimension(self.dimension, point.vector.len())?;
        }
        let mut map = self
            .points
            .write()
            .map_err(|_| CoreError::internal("vector store lock poisoned"))?;
        for point in points {
            map.insert((point.memory_id.clone(), point.chunk_index), point);
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        exclude_memory: Option<&str>,
    ) -> Result<Vec<ScoredPoint>> {
        check_dimension(self.dimension, vector.len())?;
        let map = self
            .points
            .read()
            .map_err(|_| CoreError::internal("vector store lock poisoned"))?;
        let mut scored: Vec<ScoredPoint> = map
            .values()
            .filter(|p| exclude_memory != Some(p.memory_id.as_str()))
            .map(|p| ScoredPoint {
                memory_id: p.memory_id.clone(),
                chunk_index: p.chunk_index,
                score: cosine_similarity(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn delete_memory(&self, memory_id: &str) -> Result<()> {
        let mut map = self
            .points
            .write()
            .map_err(|_| CoreError::internal("vector store lock poisoned"))?;
        map.retain(|(mem, _), _| mem != memory_id);
        Ok(())
    }
}

// ============================================================================
// HTTP STORE
// ============================================================================

/// Client for an external collection service speaking the qdrant REST shape.
/// The collection is created on first use with cosine distance and the
/// declared dimension.
pub struct HttpVectorStore {
    client: reqwest::Client,
    base_url: String,
    collection: String,
    dimension: usize,
}

impl HttpVectorStore {
    pub fn new(base_url: &str, collection: &str, dimension: usize) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .map_err(CoreError::internal)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            dimension,
        })
    }

    /// Schema-on-boot: create the collection if absent
    pub async fn ensure_collection(&self) -> Result<()> {
        let info = self
            .client
            .get(format!("{}/collections/{}", self.base_url, self.collection))
            .send()
            .await
            .map_err(|e| CoreError::ModelUnavailable(format!("vector store: {e}")))?;
        if info.status().is_success() {
            return Ok(());
        }
        let created = self
            .client
            .put(format!("{}/collections/{}", self.base_url, self.collection))
            .json(&serde_json::json!({
                "vectors": { "size": self.dimension, "distance": "Cosine" }
            }))
            .send()
            .await
            .map_err(|e| CoreError::ModelUnavailable(format!("vector store: {e}")))?;
        if !created.status().is_success() {
            return Err(CoreError::ModelUnavailable(format!(
                "collection create returned {}",
                created.status()
            )));
        }
        tracing::info!(
            collection = %self.collection,
            dimension = self.dimension,
            "vector collection ready"
        );
        Ok(())
    }

    /// Stable numeric point id from the chunk coordinates
    fn point_id(memory_id: &str, chunk_index: u32) -> u64 {
        let digest = blake3::hash(format!("{memory_id}:{chunk_index}").as_bytes());
        u64::from_le_bytes(digest.as_bytes()[..8].try_into().expect("8 bytes"))
    }
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        for point in &points {
            check_dimension(self.dimension, point.vector.len())?;
        }
        let body: Vec<serde_json::Value> = points
            .iter()
            .map(|p| {
                Ok(serde_json::json!({
                    "id": Self::point_id(&p.memory_id, p.chunk_index),
                    "vector": p.vector,
                    "payload": serde_json::to_value(&p.payload)?,
                }))
            })
            .collect::<Result<_>>()?;
        let response = self
            .client
            .put(format!(
                "{}/collections/{}/points?wait=true",
                self.base_url, self.collection
            ))
            .json(&serde_json::json!({ "points": body }))
            .send()
            .await
            .map_err(|e| CoreError::ModelUnavailable(format!("vector upsert: {e}")))?;
        if !response.status().is_success() {
            return Err(CoreError::ModelUnavailable(format!(
                "vector upsert returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        exclude_memory: Option<&str>,
    ) -> Result<Vec<ScoredPoint>> {
        check_dimension(self.dimension, vector.len())?;
        let mut request = serde_json::json!({
            "vector": vector,
            "limit": top_k,
            "with_payload": true,
        });
        if let Some(exclude) = exclude_memory {
            request["filter"] = serde_json::json!({
                "must_not": [{ "key": "memoryId", "match": { "value": exclude } }]
            });
        }
        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points/search",
                self.base_url, self.collection
            ))
            .json(&request)
            .send()
            .await
            .map_err(|e| CoreError::ModelUnavailable(format!("vector search: {e}")))?;
        if !response.status().is_success() {
            return Err(CoreError::ModelUnavailable(format!(
                "vector search returned {}",
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct SearchHit {
            score: f32,
            payload: ChunkPayload,
        }
        #[derive(Deserialize)]
        struct SearchResponse {
            result: Vec<SearchHit>,
        }
        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| CoreError::ModelUnavailable(format!("vector search body: {e}")))?;
        Ok(parsed
            .result
            .into_iter()
            .map(|hit| ScoredPoint {
                memory_id: hit.payload.memory_id.clone(),
                chunk_index: hit.payload.chunk_index,
                score: hit.score,
                payload: hit.payload,
            })
            .collect())
    }

    async fn delete_memory(&self, memory_id: &str) -> Result<()> {
        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points/delete?wait=true",
                self.base_url, self.collection
            ))
            .json(&serde_json::json!({
                "filter": { "must": [{ "key": "memoryId", "match": { "value": memory_id } }] }
            }))
            .send()
            .await
            .map_err(|e| CoreError::ModelUnavailable(format!("vector delete: {e}")))?;
        if !response.status().is_success() {
            return Err(CoreError::ModelUnavailable(format!(
                "vector delete returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(memory: &str, index: u32, vector: Vec<f32>) -> VectorPoint {
        VectorPoint {
            memory_id: memory.to_string(),
            chunk_index: index,
            payload: ChunkPayload {
                memory_id: memory.to_string(),
                chunk_index: index,
                envelope: Envelope::encrypt(&[1u8; 32], b"chunk").unwrap(),
            },
            vector,
        }
    }

    #[tokio::test]
    async fn search_ranks_by_cosine() {
        let store = MemoryVectorStore::new(2);
        store
            .upsert(vec![
                point("a", 0, vec![1.0, 0.0]),
                point("b", 0, vec![0.0, 1.0]),
                point("c", 0, vec![0.7, 0.7]),
            ])
            .await
            .unwrap();

        let hits = store.search(&[1.0, 0.0], 2, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].memory_id, "a");
        assert_eq!(hits[1].memory_id, "c");
    }

    #[tokio::test]
    async fn self_exclusion_filter() {
        let store = MemoryVectorStore::new(2);
        store
            .upsert(vec![
                point("a", 0, vec![1.0, 0.0]),
                point("b", 0, vec![0.9, 0.1]),
            ])
            .await
            .unwrap();

        let hits = store.search(&[1.0, 0.0], 5, Some("a")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory_id, "b");
    }

    #[tokio::test]
    async fn dimension_mismatch_rejected() {
        let store = MemoryVectorStore::new(3);
        assert!(matches!(
            store.upsert(vec![point("a", 0, vec![1.0, 0.0])]).await,
            Err(CoreError::PreconditionFailed(_))
        ));
        assert!(matches!(
            store.search(&[1.0], 5, None).await,
            Err(CoreError::PreconditionFailed(_))
        ));
    }

    #[tokio::test]
    async fn delete_memory_drops_all_chunks() {
        let store = MemoryVectorStore::new(2);
        store
            .upsert(vec![
                point("a", 0, vec![1.0, 0.0]),
                point("a", 1, vec![0.9, 0.1]),
                point("b", 0, vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        store.delete_memory("a").await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn upsert_replaces_same_coordinates() {
        let store = MemoryVectorStore::new(2);
        store.upsert(vec![point("a", 0, vec![1.0, 0.0])]).await.unwrap();
        store.upsert(vec![point("a", 0, vec![0.0, 1.0])]).await.unwrap();
        assert_eq!(store.len(), 1);

        let hits = store.search(&[0.0, 1.0], 1, None).await.unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn point_ids_are_stable_and_distinct() {
        let a = HttpVectorStore::point_id("mem-1", 0);
        assert_eq!(a, HttpVectorStore::point_id("mem-1", 0));
        assert_ne!(a, HttpVectorStore::point_id("mem-1", 1));
        assert_ne!(a, HttpVectorStore::point_id("mem-2", 0));
    }
}
