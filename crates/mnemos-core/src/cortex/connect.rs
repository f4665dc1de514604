//! Connection Synthesis
//!
//! When a memory is added or materially updated, its text is embedded and the
//! nearest neighbors (self excluded) above a similarity threshold each get a
//! directional typed edge: an LLM explains the relationship, the explanation
//! is parsed into a relationship kind, and the edge is recorded with
//! strength = similarity and provenance `model:<identifier>`. Recording is
//! idempotent on (source, target, kind, provenance).

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use super::embed::{EmbeddingProvider, normalize_cosine};
use super::llm::LlmProvider;
use super::vector::VectorStore;
use crate::error::Result;
use crate::model::{Provenance, RelationKind};
use crate::shield::{Envelope, Session};
use crate::storage::Storage;

/// Neighbors considered per synthesis run
pub const NEIGHBOR_COUNT: usize = 10;
/// Minimum normalized similarity for an edge
pub const SIMILARITY_THRESHOLD: f32 = 0.75;

const EXPLAIN_SYSTEM: &str = "You relate two personal memories. Reply with JSON only: \
{\"kind\": one of related|caused_by|contradicts|supports|references|extends|summarizes, \
\"explanation\": one sentence}";

/// Background connection discovery over encrypted content
pub struct ConnectionSynthesizer {
    storage: Arc<Storage>,
    session: Arc<Session>,
    embedder: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorStore>,
    llm: Arc<dyn LlmProvider>,
}

#[derive(Debug, Deserialize)]
struct Explanation {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    explanation: String,
}

/// Parse the model's reply into a relationship kind. JSON first, then a
/// keyword scan; anything unparseable lands on Related.
pub fn parse_relation(reply: &str) -> (RelationKind, String) {
    let trimmed = reply.trim();
    let json_slice = trimmed
        .find('{')
        .and_then(|start| trimmed.rfind('}').map(|end| &trimmed[start..=end]))
        .unwrap_or(trimmed);
    if let Ok(parsed) = serde_json::from_str::<Explanation>(json_slice) {
        if let Some(kind) = RelationKind::parse_name(parsed.kind.trim()) {
            return (kind, parsed.explanation);
        }
    }
    let lowered = trimmed.to_lowercase();
    for kind in RelationKind::ALL {
        if lowered.contains(kind.as_str()) {
            return (kind, trimmed.to_string());
        }
    }
    (RelationKind::Related, trimmed.to_string())
}

impl ConnectionSynthesizer {
    pub fn new(
        storage: Arc<Storage>,
        session: Arc<Session>,
        embedder: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorStore>,
        llm: Arc<dyn LlmProvider>,
    ) -> Self {
        Self {
            storage,
            session,
            embedder,
            vectors,
            llm,
        }
    }

    fn decrypt_text(&self, memory_id: &str) -> Result<String> {
        let memory = self.storage.require_memory(memory_id)?;
        self.session.with_keys(|keys| {
            let mut parts = Vec::new();
            for envelope in [&memory.title_envelope, &memory.content_envelope]
                .into_iter()
                .flatten()
            {
                parts.push(String::from_utf8_lossy(&envelope.decrypt(keys.kek())?).into_owned());
            }
            Ok(parts.join("\n"))
        })
    }

    /// Synthesize connections for one memory. Returns the number of edges
    /// this run recorded (existing edges count as zero).
    pub async fn synthesize(&self, memory_id: &str) -> Result<usize> {
        let text = self.decrypt_text(memory_id)?;
        if text.trim().is_empty() {
            return Ok(0);
        }

        let mut vectors = self.embedder.embed(&[text.clone()]).await?;
        let vector = match vectors.pop() {
            Some(v) => v,
            None => return Ok(0),
        };
        let points = self
            .vectors
            .search(&vector, NEIGHBOR_COUNT * 4, Some(memory_id))
            .await?;

        // Fold chunks per neighbor, best similarity wins
        let mut neighbors: HashMap<String, f32> = HashMap::new();
        for point in points {
            let score = normalize_cosine(point.score);
            let entry = neighbors.entry(point.memory_id).or_insert(score);
            if score > *entry {
                *entry = score;
            }
        }
        let mut neighbors: Vec<(String, f32)> = neighbors.into_iter().collect();
        neighbors.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        neighbors.truncate(NEIGHBOR_COUNT);

        let provenance = Provenance::Model(self.llm.model_id().to_string());
        let mut recorded = 0;
        for (neighbor_id, similarity) in neighbors {
            if similarity < SIMILARITY_THRESHOLD {
                continue;
            }
            let neighbor_text = match self.decrypt_text(&neighbor_id) {
                Ok(text) => text,
                // A neighbor deleted mid-run is not an error
                Err(crate::error::CoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };

            let prompt = format!("Memory A:\n{text}\n\nMemory B:\n{neighbor_text}");
            let reply = self.llm.complete(EXPLAIN_SYSTEM, &prompt).await?;
            let (kind, explanation) = parse_relation(&reply);

            let envelope = if explanation.is_empty() {
                None
            } else {
                Some(self.session.with_keys(|keys| {
                    Envelope::encrypt(keys.kek(), explanation.as_bytes())
                })?)
            };
            let inserted = self.storage.upsert_connection(
                memory_id,
                &neighbor_id,
                kind,
                similarity as f64,
                &provenance,
                envelope.as_ref(),
            )?;
            if inserted {
                recorded += 1;
            }
        }
        tracing::debug!(memory_id, recorded, "connection synthesis finished");
        Ok(recorded)
    }
}
