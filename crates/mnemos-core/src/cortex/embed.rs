//! Embedding Providers
//!
//! Chunks are embedded through an external model whose output dimension is
//! declared at collection creation. Requests retry with jittered exponential
//! backoff on transient errors; a configured secondary provider takes over
//! when the primary fails permanently. The model identifier is persisted per
//! chunk so mixed-model queries are rejected rather than silently fused.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;

use crate::config::ModelEndpoint;
use crate::error::{CoreError, Result};

/// Retry attempts for one provider
pub const MAX_ATTEMPTS: u32 = 3;
/// Base delay for the exponential backoff
const BACKOFF_BASE: Duration = Duration::from_millis(400);

/// An external embedding model
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Identifier persisted per chunk
    fn model_id(&self) -> &str;
    /// Output dimension D
    fn dimension(&self) -> usize;
    /// Embed a batch of texts, one vector per input
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Jittered exponential backoff, local to external-service calls
pub async fn backoff_delay(attempt: u32) {
    let exp = BACKOFF_BASE * 2u32.saturating_pow(attempt);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    tokio::time::sleep(exp + jitter).await;
}

// ============================================================================
// HTTP PROVIDER
// ============================================================================

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Talks to an embedding endpoint (`POST {model, input} → {embeddings}`)
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: ModelEndpoint,
    dimension: usize,
}

impl HttpEmbedder {
    pub fn new(endpoint: ModelEndpoint, dimension: usize, budget: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(budget)
            .build()
            .map_err(CoreError::internal)?;
        Ok(Self {
            client,
            endpoint,
            dimension,
        })
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let response = self
            .client
            .post(&self.endpoint.url)
            .json(&serde_json::json!({
                "model": self.endpoint.model,
                "input": texts,
            }))
            .send()
            .await
            .map_err(|e| CoreError::ModelUnavailable(format!("embed: {e}")))?;
        if !response.status().is_success() {
            return Err(CoreError::ModelUnavailable(format!(
                "embed endpoint returned {}",
                response.status()
            )));
        }
        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| CoreError::ModelUnavailable(format!("embed body: {e}")))?;
        if parsed.embeddings.len() != texts.len() {
            return Err(CoreError::ModelUnavailable(format!(
                "embed returned {} vectors for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            )));
        }
        for vector in &parsed.embeddings {
            if vector.len() != self.dimension {
                return Err(CoreError::internal(format!(
                    "embed dimension {} != declared {}",
                    vector.len(),
                    self.dimension
                )));
            }
        }
        Ok(parsed.embeddings)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    fn model_id(&self) -> &str {
        &self.endpoint.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            match self.request(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_transient() => {
                    tracing::warn!(attempt, "embedding attempt failed: {e}");
                    last_err = Some(e);
                    if attempt + 1 < MAX_ATTEMPTS {
                        backoff_delay(attempt).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| CoreError::ModelUnavailable("embed".to_string())))
    }
}

// ============================================================================
// FALLBACK CHAIN
// ============================================================================

/// Primary provider with a configured secondary. The fallback only engages on
/// `ModelUnavailable`; its model id is what gets persisted for those chunks.
pub struct FallbackEmbedder {
    primary: Arc<dyn EmbeddingProvider>,
    secondary: Arc<dyn EmbeddingProvider>,
}

impl FallbackEmbedder {
    pub fn new(
        primary: Arc<dyn EmbeddingProvider>,
        secondary: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl EmbeddingProvider for FallbackEmbedder {
    fn model_id(&self) -> &str {
        self.primary.model_id()
    }

    fn dimension(&self) -> usize {
        self.primary.dimension()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match self.primary.embed(texts).await {
            Ok(vectors) => Ok(vectors),
            Err(CoreError::ModelUnavailable(reason)) => {
                tracing::warn!("primary embedder unavailable ({reason}), using fallback");
                self.secondary.embed(texts).await
            }
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// SIMILARITY
// ============================================================================

/// Cosine similarity in [-1, 1]; zero vectors score 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Map cosine similarity onto [0, 1] for score fusion
pub fn normalize_cosine(cos: f32) -> f32 {
    ((cos + 1.0) / 2.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn normalization_bounds() {
        assert_eq!(normalize_cosine(1.0), 1.0);
        assert_eq!(normalize_cosine(-1.0), 0.0);
        assert_eq!(normalize_cosine(0.0), 0.5);
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        fn model_id(&self) -> &str {
            "down"
        }
        fn dimension(&self) -> usize {
            4
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(CoreError::ModelUnavailable("down".to_string()))
        }
    }

    struct ConstEmbedder;

    #[async_trait]
    impl EmbeddingProvider for ConstEmbedder {
        fn model_id(&self) -> &str {
            "const"
        }
        fn dimension(&self) -> usize {
            4
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
        }
    }

    #[tokio::test]
    async fn fallback_engages_on_unavailable() {
        let chain = FallbackEmbedder::new(Arc::new(FailingEmbedder), Arc::new(ConstEmbedder));
        let vectors = chain.embed(&["x".to_string()]).await.unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0], vec![1.0, 0.0, 0.0, 0.0]);
    }
}
