//! Data Model
//!
//! The record types the engine persists. Envelope-bearing fields hold
//! ciphertext only; enums are closed and round-trip through their stored
//! string names.

mod convo;
mod graph;
mod memory;
mod testament;

pub use convo::{
    Conversation, ConversationMessage, MessageRole, Suggestion, SuggestionStatus,
};
pub use graph::{
    Connection, LinkProvenance, MemoryPerson, OwnerProfile, OwnerRelationship, Person,
    Provenance, RelationKind, Tag,
};
pub use memory::{
    ContentType, Memory, MemoryMetadata, SearchToken, Source, SourceClass, Visibility,
};
pub use testament::{
    AlertLevel, AuditLogEntry, Heir, HeartbeatAlert, HeartbeatChallenge, HeartbeatCheckin,
    LoopState, TestamentConfig,
};
