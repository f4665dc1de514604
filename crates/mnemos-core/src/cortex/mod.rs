//! The Cortex
//!
//! The retrieval-augmented generation pipeline: chunking, embedding through
//! external models, vector retrieval with encrypted payloads, hybrid
//! keyword+vector fusion, connection discovery, and the chat stream. All of
//! it is rebuildable from the Vault and the database.

pub mod chat;
pub mod chunker;
pub mod connect;
pub mod embed;
pub mod llm;
pub mod search;
pub mod vector;

pub use chat::{ChatEngine, ChatFrame, RETRIEVAL_TOP_K};
pub use chunker::{CHUNK_OVERLAP, CHUNK_TOKENS, Chunk, chunk_text};
pub use connect::{
    ConnectionSynthesizer, NEIGHBOR_COUNT, SIMILARITY_THRESHOLD, parse_relation,
};
pub use embed::{
    EmbeddingProvider, FallbackEmbedder, HttpEmbedder, cosine_similarity, normalize_cosine,
};
pub use llm::{HttpLlm, LlmProvider};
pub use search::{
    HybridSearcher, RRF_C, SearchFilters, SearchHit, SearchMode, SearchResponse,
    reciprocal_rank_fusion,
};
pub use vector::{
    ChunkPayload, HttpVectorStore, MemoryVectorStore, ScoredPoint, VectorPoint, VectorStore,
};
