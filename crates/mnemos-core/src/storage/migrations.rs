//! Database Migrations
//!
//! Schema migration definitions for the storage layer.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: memories, vault manifest, blind tokens, graph, testament",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Reliability: retry cursors and re-key progress",
        up: MIGRATION_V2_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Initial schema
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL,
    applied_at TEXT NOT NULL
);

-- ============================================================================
-- KEY HIERARCHY
-- ============================================================================

-- Singleton: salt, Argon2id parameters, and the keyed-hash verifier.
-- No key material is ever stored; the verifier is HMAC(master, 'auth_check').
CREATE TABLE IF NOT EXISTS kdf_config (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    salt TEXT NOT NULL,
    params TEXT NOT NULL,
    verifier TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- ============================================================================
-- MEMORIES
-- ============================================================================

-- source_id is not a foreign key: the ingest transaction inserts the memory
-- before its source row and SQLite enforces foreign keys immediately.
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    captured_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    content_type TEXT NOT NULL DEFAULT 'text',
    source_class TEXT NOT NULL DEFAULT 'manual',
    title_envelope TEXT,
    content_envelope TEXT,
    metadata_envelope TEXT,
    integrity_hash TEXT NOT NULL,
    parent_id TEXT REFERENCES memories(id) ON DELETE SET NULL,
    source_id TEXT,
    visibility TEXT NOT NULL DEFAULT 'private',
    has_location INTEGER NOT NULL DEFAULT 0,
    deleted_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_memories_captured ON memories(captured_at);
CREATE INDEX IF NOT EXISTS idx_memories_digest ON memories(integrity_hash);
CREATE INDEX IF NOT EXISTS idx_memories_content_type ON memories(content_type);
CREATE INDEX IF NOT EXISTS idx_memories_deleted ON memories(deleted_at);

-- ============================================================================
-- VAULT MANIFEST
-- ============================================================================

CREATE TABLE IF NOT EXISTS sources (
    id TEXT PRIMARY KEY,
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    vault_path TEXT NOT NULL UNIQUE,
    original_vault_path TEXT,
    original_size INTEGER NOT NULL,
    encrypted_size INTEGER NOT NULL,
    mime TEXT NOT NULL,
    preservation_format TEXT NOT NULL,
    integrity_hash TEXT NOT NULL,
    cipher_digest TEXT NOT NULL,
    original_cipher_digest TEXT,
    filename_envelope TEXT,
    dek_envelope TEXT NOT NULL,
    serve_archival INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sources_memory ON sources(memory_id);

-- ============================================================================
-- BLIND-INDEX TOKENS
-- ============================================================================

-- Token values are HMAC outputs; equality lookup is the only operation.
CREATE TABLE IF NOT EXISTS search_tokens (
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    token_type TEXT NOT NULL,
    token TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tokens_value ON search_tokens(token);
CREATE INDEX IF NOT EXISTS idx_tokens_memory ON search_tokens(memory_id);

-- ============================================================================
-- CONNECTION GRAPH
-- ============================================================================

CREATE TABLE IF NOT EXISTS connections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    target_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    strength REAL NOT NULL CHECK (strength >= 0.0 AND strength <= 1.0),
    provenance TEXT NOT NULL,
    explanation_envelope TEXT,
    user_promoted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    CHECK (source_id <> target_id),
    UNIQUE (source_id, target_id, kind, provenance)
);

CREATE INDEX IF NOT EXISTS idx_connections_source ON connections(source_id);
CREATE INDEX IF NOT EXISTS idx_connections_target ON connections(target_id);

-- ============================================================================
-- TAGS AND PERSONS
-- ============================================================================

CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    color TEXT NOT NULL DEFAULT '#8b8b8b'
);

CREATE TABLE IF NOT EXISTS memory_tags (
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (memory_id, tag_id)
);

CREATE TABLE IF NOT EXISTS persons (
    id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    name_envelope TEXT,
    external_id TEXT,
    relationship TEXT,
    deceased INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

-- Provenance is part of the key: a manual link and an inferred link to the
-- same person coexist.
CREATE TABLE IF NOT EXISTS memory_persons (
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    person_id TEXT NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
    provenance TEXT NOT NULL DEFAULT 'manual',
    confidence REAL,
    PRIMARY KEY (memory_id, person_id, provenance)
);

CREATE TABLE IF NOT EXISTS owner_profile (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    display_name TEXT NOT NULL,
    birthdate TEXT,
    bio TEXT,
    self_person_id TEXT REFERENCES persons(id) ON DELETE SET NULL
);

-- ============================================================================
-- SUGGESTIONS AND CONVERSATIONS
-- ============================================================================

CREATE TABLE IF NOT EXISTS suggestions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    memory_id TEXT REFERENCES memories(id) ON DELETE CASCADE,
    payload_envelope TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    resolved_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_suggestions_status ON suggestions(status);

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    title TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversation_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    content_envelope TEXT NOT NULL,
    cited_memory_ids TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON conversation_messages(conversation_id);

-- ============================================================================
-- HEARTBEAT AND TESTAMENT
-- ============================================================================

CREATE TABLE IF NOT EXISTS heartbeat_challenges (
    challenge TEXT PRIMARY KEY,
    issued_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    used INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS heartbeat_checkins (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    at TEXT NOT NULL
);

-- idempotency_key is '(level):(trigger-day)'; the unique index makes the
-- daily tick safe to run concurrently across processes.
CREATE TABLE IF NOT EXISTS heartbeat_alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    level TEXT NOT NULL,
    idempotency_key TEXT NOT NULL UNIQUE,
    dispatched_at TEXT NOT NULL,
    detail TEXT
);

CREATE TABLE IF NOT EXISTS testament_config (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    threshold_k INTEGER NOT NULL DEFAULT 3,
    total_n INTEGER NOT NULL DEFAULT 5,
    shares_generated INTEGER NOT NULL DEFAULT 0,
    heir_mode_active INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS heirs (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT NOT NULL,
    phone TEXT,
    share_index INTEGER,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action TEXT NOT NULL,
    detail TEXT,
    at TEXT NOT NULL
);

-- ============================================================================
-- BACKGROUND LOOPS AND SESSIONS
-- ============================================================================

CREATE TABLE IF NOT EXISTS loop_state (
    name TEXT PRIMARY KEY,
    last_run_at TEXT,
    next_run_at TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    consecutive_failures INTEGER NOT NULL DEFAULT 0
);

-- Bearer tokens are stored hashed; a stolen database leaks no credentials.
CREATE TABLE IF NOT EXISTS auth_tokens (
    token_hash TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    revoked INTEGER NOT NULL DEFAULT 0
);

-- ============================================================================
-- CHUNK BOOKKEEPING
-- ============================================================================

-- Chunk vectors live in the vector collection; this mirror tracks which
-- model embedded each chunk so mixed-model queries are rejected, and which
-- content digest the chunks belong to so re-chunking is detectable.
CREATE TABLE IF NOT EXISTS chunk_index (
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL,
    embedding_model TEXT NOT NULL,
    content_digest TEXT NOT NULL,
    PRIMARY KEY (memory_id, chunk_index)
);

INSERT INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: retry cursors for parked background work + per-object re-key progress
const MIGRATION_V2_UP: &str = r#"
-- Permanent background-job failures park the memory here instead of hot-looping.
CREATE TABLE IF NOT EXISTS retry_cursors (
    memory_id TEXT NOT NULL,
    job_kind TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_attempt_at TEXT NOT NULL,
    PRIMARY KEY (memory_id, job_kind)
);

-- Re-key is idempotent on restart: every rewrapped object is recorded.
CREATE TABLE IF NOT EXISTS rekey_progress (
    object_kind TEXT NOT NULL,
    object_id TEXT NOT NULL,
    completed_at TEXT NOT NULL,
    PRIMARY KEY (object_kind, object_id)
);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}
