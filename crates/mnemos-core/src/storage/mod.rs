//! Storage Module
//!
//! SQLite-based storage layer with:
//! - WAL journaling, foreign keys enforced
//! - Separate writer/reader connections (audits never block writers)
//! - Unique-key collisions translated to `Conflict`
//! - Versioned migrations

mod migrations;
mod sqlite;

pub use migrations::MIGRATIONS;
pub use sqlite::{
    KdfConfig, MemoryListFilter, MemoryUpdate, RetryCursor, Storage, TokenMatch,
    VisibilityFilter,
};
