//! Hybrid Search
//!
//! Three modes. Keyword matches blind-index tokens and sums per-matched-token
//! weights through a saturating curve so keyword stuffing cannot run a score
//! to infinity. Semantic returns top-k chunks with cosine scores normalized
//! to [0, 1], folded per memory. Hybrid fuses both rankings per memory with
//! reciprocal-rank fusion (c = 60), tie-breaking on most recent captured
//! time. Every hit carries its explainability fields.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde::{Deserialize, Serialize};

use super::embed::{EmbeddingProvider, normalize_cosine};
use super::vector::VectorStore;
use crate::error::{CoreError, Result};
use crate::model::ContentType;
use crate::shield::{Session, TokenType, blind_index};
use crate::storage::{MemoryListFilter, Storage};

/// RRF dampening constant
pub const RRF_C: f32 = 60.0;

/// Per-token-type weights for the keyword score
const fn token_weight(token_type: TokenType) -> f32 {
    match token_type {
        TokenType::Title => 2.0,
        TokenType::Tag | TokenType::Person => 1.5,
        TokenType::Location => 1.25,
        TokenType::Body | TokenType::Date => 1.0,
    }
}

/// Saturating curve: monotonic in the raw weight sum, asymptote at 1
fn saturate(raw: f32) -> f32 {
    raw / (raw + 1.0)
}

// ============================================================================
// TYPES
// ============================================================================

/// Search mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Keyword,
    Semantic,
    #[default]
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Keyword => "keyword",
            SearchMode::Semantic => "semantic",
            SearchMode::Hybrid => "hybrid",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "keyword" => SearchMode::Keyword,
            "semantic" => SearchMode::Semantic,
            _ => SearchMode::Hybrid,
        }
    }
}

/// Optional candidate restriction
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub content_type: Option<ContentType>,
    pub tag_ids: Vec<i64>,
    pub person_ids: Vec<String>,
}

impl SearchFilters {
    fn is_empty(&self) -> bool {
        self.content_type.is_none() && self.tag_ids.is_empty() && self.person_ids.is_empty()
    }
}

/// One scored memory with explainability fields
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub memory_id: String,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_tokens: Option<u32>,
}

/// A full search response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub total: usize,
    pub query_tokens_generated: usize,
    pub mode: SearchMode,
}

// ============================================================================
// FUSION
// ============================================================================

/// Reciprocal-rank fusion across ranked lists:
/// `score(m) = Σ 1/(c + rank_i(m))` with 1-based ranks.
pub fn reciprocal_rank_fusion(lists: &[Vec<(String, f32)>], c: f32) -> Vec<(String, f32)> {
    let mut scores: HashMap<String, f32> = HashMap::new();
    for list in lists {
        for (rank, (id, _)) in list.iter().enumerate() {
            *scores.entry(id.clone()).or_default() += 1.0 / (c + (rank + 1) as f32);
        }
    }
    let mut fused: Vec<(String, f32)> = scores.into_iter().collect();
    fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    fused
}

// ============================================================================
// SEARCHER
// ============================================================================

/// Keyword + semantic retrieval over encrypted content
pub struct HybridSearcher {
    storage: Arc<Storage>,
    session: Arc<Session>,
    embedder: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorStore>,
    /// Repeated queries skip the embedding round-trip
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

struct KeywordCandidates {
    /// memory id → saturated score
    scores: Vec<(String, f32)>,
    /// memory id → distinct matched token count
    matched: HashMap<String, u32>,
    query_tokens_generated: usize,
}

impl HybridSearcher {
    pub fn new(
        storage: Arc<Storage>,
        session: Arc<Session>,
        embedder: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            storage,
            session,
            embedder,
            vectors,
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(100).expect("100 is non-zero"),
            )),
        }
    }

    /// Tokenize the query under every matchable scope. The server only ever
    /// sees these HMAC values, never the terms.
    fn generate_query_tokens(&self, query: &str) -> Result<Vec<(String, TokenType)>> {
        self.session.with_keys(|keys| {
            let key = keys.search();
            let mut out: Vec<(String, TokenType)> = Vec::new();
            for token_type in [TokenType::Title, TokenType::Body] {
                for token in blind_index::tokenize_text(key, query, token_type, false) {
                    out.push((token, token_type));
                }
            }
            // Whole-value scopes so a query can hit tags, persons, places
            for token_type in [TokenType::Tag, TokenType::Person, TokenType::Location] {
                if let Some(token) = blind_index::tokenize_whole(key, query, token_type) {
                    out.push((token, token_type));
                }
            }
            Ok(out)
        })
    }

    fn keyword_candidates(&self, query: &str) -> Result<KeywordCandidates> {
        let query_tokens = self.generate_query_tokens(query)?;
        let type_by_token: HashMap<&str, TokenType> = query_tokens
            .iter()
            .map(|(token, token_type)| (token.as_str(), *token_type))
            .collect();
        let values: Vec<String> = query_tokens.iter().map(|(t, _)| t.clone()).collect();

        let matches = self.storage.match_tokens(&values)?;
        let mut raw: HashMap<String, f32> = HashMap::new();
        let mut matched_tokens: HashMap<String, std::collections::HashSet<String>> =
            HashMap::new();
        for m in matches {
            let weight = type_by_token
                .get(m.token.as_str())
                .copied()
                .map(token_weight)
                .unwrap_or(1.0);
            let seen = matched_tokens.entry(m.memory_id.clone()).or_default();
            // A token indexed twice for one memory still counts once
            if seen.insert(m.token) {
                *raw.entry(m.memory_id).or_default() += weight;
            }
        }

        let mut scores: Vec<(String, f32)> = raw
            .into_iter()
            .map(|(id, sum)| (id, saturate(sum)))
            .collect();
        // Deterministic rank order: ties fall back to the time-ordered id
        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        Ok(KeywordCandidates {
            scores,
            matched: matched_tokens
                .into_iter()
                .map(|(id, set)| (id, set.len() as u32))
                .collect(),
            query_tokens_generated: values.len(),
        })
    }

    /// Reject queries against an index built by a different model
    fn check_model(&self) -> Result<()> {
        let queried = self.embedder.model_id();
        for indexed in self.storage.chunk_models()? {
            if indexed != queried {
                return Err(CoreError::ModelMismatch {
                    indexed,
                    queried: queried.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn query_vector(&self, query: &str) -> Result<Vec<f32>> {
        if let Ok(mut cache) = self.query_cache.lock() {
            if let Some(hit) = cache.get(query) {
                return Ok(hit.clone());
            }
        }
        let mut vectors = self.embedder.embed(&[query.to_string()]).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| CoreError::ModelUnavailable("empty embedding".to_string()))?;
        if let Ok(mut cache) = self.query_cache.lock() {
            cache.put(query.to_string(), vector.clone());
        }
        Ok(vector)
    }

    /// Per-memory semantic scores: best chunk cosine, normalized to [0, 1]
    async fn semantic_candidates(&self, query: &str, top_k: usize) -> Result<Vec<(String, f32)>> {
        self.check_model()?;
        let vector = self.query_vector(query).await?;
        let points = self.vectors.search(&vector, top_k * 4, None).await?;

        let mut best: HashMap<String, f32> = HashMap::new();
        for point in points {
            let score = normalize_cosine(point.score);
            let entry = best.entry(point.memory_id).or_insert(score);
            if score > *entry {
                *entry = score;
            }
        }
        let mut scores: Vec<(String, f32)> = best.into_iter().collect();
        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scores.truncate(top_k);
        Ok(scores)
    }

    /// Memory ids admitted by the filters, or None for unrestricted
    fn allowed_ids(
        &self,
        filters: &SearchFilters,
    ) -> Result<Option<std::collections::HashSet<String>>> {
        if filters.is_empty() {
            return Ok(None);
        }
        let list = self.storage.list_memories(&MemoryListFilter {
            limit: 10_000,
            content_type: filters.content_type,
            tag_ids: filters.tag_ids.clone(),
            person_ids: filters.person_ids.clone(),
            ..Default::default()
        })?;
        Ok(Some(list.into_iter().map(|m| m.id).collect()))
    }

    /// Run a search. Requires an unlocked session for token generation.
    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<SearchResponse> {
        let top_k = top_k.clamp(1, 100);
        let allowed = self.allowed_ids(filters)?;
        let admit = |id: &str| allowed.as_ref().is_none_or(|set| set.contains(id));

        let keyword = match mode {
            SearchMode::Semantic => None,
            _ => Some(self.keyword_candidates(query)?),
        };
        let semantic = match mode {
            SearchMode::Keyword => None,
            _ => Some(self.semantic_candidates(query, top_k).await?),
        };

        let keyword_scores: HashMap<String, f32> = keyword
            .as_ref()
            .map(|k| k.scores.iter().cloned().collect())
            .unwrap_or_default();
        let semantic_scores: HashMap<String, f32> = semantic
            .as_ref()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();

        let mut ranked: Vec<(String, f32)> = match (&keyword, &semantic) {
            (Some(k), Some(s)) => {
                reciprocal_rank_fusion(&[k.scores.clone(), s.clone()], RRF_C)
            }
            (Some(k), None) => k.scores.clone(),
            (None, Some(s)) => s.clone(),
            (None, None) => Vec::new(),
        };
        ranked.retain(|(id, _)| admit(id));

        // Ties break on most recent captured time
        let ids: Vec<String> = ranked.iter().map(|(id, _)| id.clone()).collect();
        let captured: HashMap<String, chrono::DateTime<chrono::Utc>> =
            self.storage.captured_at_for(&ids)?.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    captured
                        .get(&b.0)
                        .cmp(&captured.get(&a.0))
                })
        });
        // Soft-deleted or purged candidates have no captured stamp
        ranked.retain(|(id, _)| captured.contains_key(id));

        let total = ranked.len();
        ranked.truncate(top_k);

        let hits = ranked
            .into_iter()
            .map(|(memory_id, score)| SearchHit {
                keyword_score: keyword_scores.get(&memory_id).copied(),
                vector_score: semantic_scores.get(&memory_id).copied(),
                matched_tokens: keyword
                    .as_ref()
                    .map(|k| k.matched.get(&memory_id).copied().unwrap_or(0)),
                memory_id,
                score,
            })
            .collect();

        Ok(SearchResponse {
            hits,
            total,
            query_tokens_generated: keyword
                .as_ref()
                .map(|k| k.query_tokens_generated)
                .unwrap_or(0),
            mode,
        })
    }
}
