//! # Mnemos Core
//!
//! Single-user, self-hosted, encrypted second-brain engine with a
//! multi-decadal design horizon:
//!
//! - **The Shield**: Argon2id → master → sub-key hierarchy, envelope
//!   encryption with crypto-agility tags, blind-index search tokens, session
//!   unlock/lock with idle auto-lock and key zeroization
//! - **The Vault**: content-addressed encrypted file storage, archival-format
//!   preservation (PNG/FLAC/FFV1/PDF), and a periodic integrity audit
//! - **The Cortex**: chunking, external-model embeddings, cosine retrieval
//!   over encrypted chunk payloads, hybrid keyword+vector fusion (RRF),
//!   connection synthesis, and streaming RAG chat
//! - **The Testament**: k-of-n mnemonic secret shares, challenge-response
//!   liveness, the escalation state machine, and read-only heir mode
//! - **Pipeline & Scheduler**: transactional ingest with post-commit job
//!   fan-out, and named background loops with claim-based mutual exclusion
//!
//! Plaintext exists only transiently in process memory. There is no password
//! recovery: losing the passphrase and the shares is irreversible.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mnemos_core::shield::{MasterKey, Session, SessionMode};
//! use mnemos_core::storage::Storage;
//!
//! let storage = Storage::new(None)?;
//! let session = Session::new(15);
//!
//! // Unlock with the passphrase-derived master key
//! let kdf = storage.kdf_config()?.expect("setup completed");
//! let master = MasterKey::from_b64(&master_key_b64)?;
//! session.unlock(master, &kdf.verifier, SessionMode::Owner)?;
//! ```

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod cortex;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod model;
pub mod rekey;
pub mod scheduler;
pub mod shield;
pub mod storage;
pub mod testament;
pub mod vault;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use config::Config;
pub use error::{CoreError, Result};

pub use shield::{
    AlgoTag, Envelope, KdfParams, MasterKey, Session, SessionMode, SubKeys, TokenType,
};

pub use model::{
    AlertLevel, Connection, ContentType, Conversation, ConversationMessage, Heir, Memory,
    MemoryMetadata, MessageRole, OwnerProfile, Person, Provenance, RelationKind, SearchToken,
    Source, SourceClass, Suggestion, SuggestionStatus, Tag, TestamentConfig, Visibility,
};

pub use storage::{KdfConfig, MemoryListFilter, MemoryUpdate, Storage, VisibilityFilter};

pub use vault::{AuditReport, Converter, Discrepancy, SubprocessTransducer, Vault};

pub use cortex::{
    ChatEngine, ChatFrame, ConnectionSynthesizer, EmbeddingProvider, HybridSearcher, LlmProvider,
    SearchFilters, SearchMode, SearchResponse, VectorStore,
};

pub use ingest::{FileIngest, IngestOutcome, MemoryPatch, Orchestrator, TextCapture};
pub use jobs::{JobKind, JobQueue, JobWorker};
pub use rekey::{RekeyService, RekeySummary};
pub use scheduler::Scheduler;
pub use testament::{HeartbeatService, HeartbeatStatus, TestamentService};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
