//! SQLite Storage Implementation
//!
//! Single structured database file with WAL journaling and foreign keys
//! enforced. Separate writer/reader connections behind mutexes give interior
//! mutability: all methods take `&self`, so the server holds `Arc<Storage>`.
//! Long-running scans (audit, rebuild) use the reader connection only and
//! never block the writer. Unique-key collisions translate to `Conflict`.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{CoreError, Result};
use crate::model::{
    AlertLevel, AuditLogEntry, Connection as MemoryConnection, ContentType, Conversation,
    ConversationMessage, Heir, HeartbeatAlert, LinkProvenance, LoopState, Memory,
    MemoryPerson, MessageRole, OwnerProfile, OwnerRelationship, Person, Provenance,
    RelationKind, SearchToken, Source, SourceClass, Suggestion, SuggestionStatus, Tag,
    TestamentConfig, Visibility,
};
use crate::shield::{Envelope, KdfParams, TokenType};

// ============================================================================
// SUPPORT TYPES
// ============================================================================

/// Persisted KDF bootstrap material: salt, parameters, verifier.
/// Never contains key material.
#[derive(Debug, Clone)]
pub struct KdfConfig {
    pub salt: Vec<u8>,
    pub params: KdfParams,
    pub verifier: Vec<u8>,
}

/// Visibility filter on the list surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VisibilityFilter {
    Public,
    Private,
    #[default]
    All,
}

impl VisibilityFilter {
    pub fn parse_name(s: &str) -> Self {
        match s {
            "public" => VisibilityFilter::Public,
            "private" => VisibilityFilter::Private,
            _ => VisibilityFilter::All,
        }
    }
}

/// Filters for the memory list surface. `near` is not here: radius math needs
/// decrypted coordinates, so the caller narrows on `has_location` and filters
/// after decryption.
#[derive(Debug, Clone, Default)]
pub struct MemoryListFilter {
    pub skip: i64,
    pub limit: i64,
    pub content_type: Option<ContentType>,
    pub tag_ids: Vec<i64>,
    pub person_ids: Vec<String>,
    pub year: Option<i32>,
    pub visibility: VisibilityFilter,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    /// `Some(true)` restricts to memories with both coordinates set.
    /// `Some(false)` is a no-op and returns all memories.
    pub has_location: Option<bool>,
    pub include_deleted: bool,
}

/// A blind-token equality match
#[derive(Debug, Clone)]
pub struct TokenMatch {
    pub memory_id: String,
    pub token_type: TokenType,
    pub token: String,
}

/// A field-wise memory update. Each field swaps plaintext-derived state and
/// its envelope together; the storage layer applies the whole struct in one
/// transaction so no field can diverge from its envelope.
#[derive(Debug, Clone, Default)]
pub struct MemoryUpdate {
    pub title_envelope: Option<Option<Envelope>>,
    /// Content swaps together with its recomputed integrity hash
    pub content: Option<(Envelope, String)>,
    /// Metadata swaps together with its recomputed has_location flag
    pub metadata: Option<(Envelope, bool)>,
    pub visibility: Option<Visibility>,
    pub captured_at: Option<DateTime<Utc>>,
    /// Replace the blind tokens for the re-encrypted fields
    pub tokens: Option<Vec<SearchToken>>,
}

/// A parked background job awaiting retry
#[derive(Debug, Clone)]
pub struct RetryCursor {
    pub memory_id: String,
    pub job_kind: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
}

// ============================================================================
// STORAGE
// ============================================================================

/// Main storage struct
///
/// Uses separate reader/writer connections for interior mutability.
/// All methods take `&self` (not `&mut self`), making Storage `Send + Sync`
/// so the server can use `Arc<Storage>` instead of `Arc<Mutex<Storage>>`.
pub struct Storage {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl Storage {
    /// Apply PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Create new storage instance
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let proj_dirs = ProjectDirs::from("org", "mnemos", "core").ok_or_else(|| {
                    CoreError::internal("could not determine project directories")
                })?;
                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let perms = std::fs::Permissions::from_mode(0o700);
                    let _ = std::fs::set_permissions(data_dir, perms);
                }
                data_dir.join("mnemos.db")
            }
        };

        let writer_conn = Connection::open(&path)?;

        #[cfg(unix)]
        if path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&path, perms);
        }

        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
        })
    }

    fn writer(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| CoreError::internal("writer lock poisoned"))
    }

    fn reader(&self) -> Result<MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| CoreError::internal("reader lock poisoned"))
    }

    // ========================================================================
    // KDF CONFIG
    // ========================================================================

    /// Persist the setup bundle. Re-running setup is a conflict; re-key goes
    /// through [`Storage::replace_kdf_config`].
    pub fn save_kdf_config(&self, config: &KdfConfig) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let writer = self.writer()?;
        let existing: i64 =
            writer.query_row("SELECT COUNT(*) FROM kdf_config", [], |r| r.get(0))?;
        if existing > 0 {
            return Err(CoreError::Conflict("setup already completed".to_string()));
        }
        writer.execute(
            "INSERT INTO kdf_config (id, salt, params, verifier, created_at, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?4)",
            params![
                hex::encode(&config.salt),
                serde_json::to_string(&config.params)?,
                hex::encode(&config.verifier),
                now,
            ],
        )?;
        Ok(())
    }

    /// Swap in a new salt/params/verifier (passphrase change)
    pub fn replace_kdf_config(&self, config: &KdfConfig) -> Result<()> {
        let changed = self.writer()?.execute(
            "UPDATE kdf_config
             SET salt = ?1, params = ?2, verifier = ?3, updated_at = ?4
             WHERE id = 1",
            params![
                hex::encode(&config.salt),
                serde_json::to_string(&config.params)?,
                hex::encode(&config.verifier),
                Utc::now().to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(CoreError::PreconditionFailed("setup not completed".to_string()));
        }
        Ok(())
    }

    pub fn kdf_config(&self) -> Result<Option<KdfConfig>> {
        let reader = self.reader()?;
        reader
            .query_row(
                "SELECT salt, params, verifier FROM kdf_config WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?
            .map(|(salt, params, verifier)| {
                Ok(KdfConfig {
                    salt: hex::decode(salt).map_err(CoreError::internal)?,
                    params: serde_json::from_str(&params)?,
                    verifier: hex::decode(verifier).map_err(CoreError::internal)?,
                })
            })
            .transpose()
    }

    /// Whether initial setup has run
    pub fn is_setup(&self) -> Result<bool> {
        Ok(self.kdf_config()?.is_some())
    }

    /// When setup first completed; anchors the heartbeat ladder before the
    /// first check-in
    pub fn setup_created_at(&self) -> Result<Option<DateTime<Utc>>> {
        let reader = self.reader()?;
        reader
            .query_row("SELECT created_at FROM kdf_config WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(CoreError::from)
    }

    // ========================================================================
    // AUTH TOKENS
    // ========================================================================

    pub fn insert_auth_token(
        &self,
        token_hash: &str,
        kind: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.writer()?.execute(
            "INSERT INTO auth_tokens (token_hash, kind, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![token_hash, kind, expires_at.to_rfc3339(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Look up a live token; expired or revoked rows report `AuthRequired`
    pub fn verify_auth_token(&self, token_hash: &str, kind: &str) -> Result<()> {
        let reader = self.reader()?;
        let row = reader
            .query_row(
                "SELECT expires_at, revoked FROM auth_tokens
                 WHERE token_hash = ?1 AND kind = ?2",
                params![token_hash, kind],
                |row| Ok((row.get::<_, DateTime<Utc>>(0)?, row.get::<_, bool>(1)?)),
            )
            .optional()?;
        match row {
            Some((expires_at, false)) if expires_at > Utc::now() => Ok(()),
            _ => Err(CoreError::AuthRequired),
        }
    }

    pub fn revoke_auth_token(&self, token_hash: &str) -> Result<()> {
        self.writer()?.execute(
            "UPDATE auth_tokens SET revoked = 1 WHERE token_hash = ?1",
            params![token_hash],
        )?;
        Ok(())
    }

    pub fn revoke_all_tokens(&self) -> Result<()> {
        self.writer()?.execute("UPDATE auth_tokens SET revoked = 1", [])?;
        Ok(())
    }

    pub fn purge_expired_tokens(&self) -> Result<usize> {
        let n = self.writer()?.execute(
            "DELETE FROM auth_tokens WHERE expires_at < ?1 OR revoked = 1",
            params![Utc::now().to_rfc3339()],
        )?;
        Ok(n)
    }

    // ========================================================================
    // MEMORIES
    // ========================================================================

    fn map_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
        let title: Option<String> = row.get("title_envelope")?;
        let content: Option<String> = row.get("content_envelope")?;
        let metadata: Option<String> = row.get("metadata_envelope")?;
        let content_type: String = row.get("content_type")?;
        let source_class: String = row.get("source_class")?;
        let visibility: String = row.get("visibility")?;
        Ok(Memory {
            id: row.get("id")?,
            captured_at: row.get("captured_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            content_type: ContentType::parse_name(&content_type),
            source_class: SourceClass::parse_name(&source_class),
            title_envelope: title.as_deref().and_then(|j| Envelope::from_json(j).ok()),
            content_envelope: content.as_deref().and_then(|j| Envelope::from_json(j).ok()),
            metadata_envelope: metadata.as_deref().and_then(|j| Envelope::from_json(j).ok()),
            integrity_hash: row.get("integrity_hash")?,
            parent_id: row.get("parent_id")?,
            source_id: row.get("source_id")?,
            visibility: Visibility::parse_name(&visibility),
            has_location: row.get("has_location")?,
            deleted_at: row.get("deleted_at")?,
        })
    }

    fn insert_memory_tx(tx: &rusqlite::Transaction<'_>, memory: &Memory) -> Result<()> {
        tx.execute(
            "INSERT INTO memories (
                id, captured_at, created_at, updated_at, content_type, source_class,
                title_envelope, content_envelope, metadata_envelope, integrity_hash,
                parent_id, source_id, visibility, has_location, deleted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                memory.id,
                memory.captured_at.to_rfc3339(),
                memory.created_at.to_rfc3339(),
                memory.updated_at.to_rfc3339(),
                memory.content_type.as_str(),
                memory.source_class.as_str(),
                memory.title_envelope.as_ref().map(|e| e.to_json()).transpose()?,
                memory.content_envelope.as_ref().map(|e| e.to_json()).transpose()?,
                memory.metadata_envelope.as_ref().map(|e| e.to_json()).transpose()?,
                memory.integrity_hash,
                memory.parent_id,
                memory.source_id,
                memory.visibility.as_str(),
                memory.has_location,
                memory.deleted_at.map(|d| d.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn insert_source_tx(tx: &rusqlite::Transaction<'_>, source: &Source) -> Result<()> {
        tx.execute(
            "INSERT INTO sources (
                id, memory_id, vault_path, original_vault_path, original_size,
                encrypted_size, mime, preservation_format, integrity_hash,
                cipher_digest, original_cipher_digest, filename_envelope,
                dek_envelope, serve_archival, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                source.id,
                source.memory_id,
                source.vault_path,
                source.original_vault_path,
                source.original_size,
                source.encrypted_size,
                source.mime,
                source.preservation_format,
                source.integrity_hash,
                source.cipher_digest,
                source.original_cipher_digest,
                source.filename_envelope.as_ref().map(|e| e.to_json()).transpose()?,
                source.dek_envelope.to_json()?,
                source.serve_archival,
                source.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn insert_tokens_tx(tx: &rusqlite::Transaction<'_>, tokens: &[SearchToken]) -> Result<()> {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO search_tokens (memory_id, token_type, token) VALUES (?1, ?2, ?3)",
        )?;
        for t in tokens {
            stmt.execute(params![t.memory_id, t.token_type.as_str(), t.token])?;
        }
        Ok(())
    }

    /// The ingestion commit: Memory + Source + tokens in a single transaction.
    /// External observers see the memory fully populated or not at all.
    pub fn commit_ingest(
        &self,
        memory: &Memory,
        source: Option<&Source>,
        tokens: &[SearchToken],
    ) -> Result<()> {
        let mut writer = self.writer()?;
        let tx = writer.transaction().map_err(CoreError::from)?;
        Self::insert_memory_tx(&tx, memory)?;
        if let Some(source) = source {
            Self::insert_source_tx(&tx, source)?;
        }
        Self::insert_tokens_tx(&tx, tokens)?;
        tx.commit().map_err(CoreError::from)
    }

    pub fn memory(&self, id: &str, include_deleted: bool) -> Result<Option<Memory>> {
        let reader = self.reader()?;
        let found = reader
            .query_row("SELECT * FROM memories WHERE id = ?1", params![id], |row| {
                Self::map_memory(row)
            })
            .optional()?;
        Ok(found.filter(|m| include_deleted || !m.is_deleted()))
    }

    /// Fetch a memory or fail `NotFound`
    pub fn require_memory(&self, id: &str) -> Result<Memory> {
        self.memory(id, false)?
            .ok_or_else(|| CoreError::NotFound(format!("memory {id}")))
    }

    /// Dedup probe: any non-deleted memory with this plaintext digest
    pub fn memory_by_digest(&self, digest: &str) -> Result<Option<Memory>> {
        let reader = self.reader()?;
        reader
            .query_row(
                "SELECT * FROM memories
                 WHERE integrity_hash = ?1 AND deleted_at IS NULL
                 ORDER BY created_at LIMIT 1",
                params![digest],
                |row| Self::map_memory(row),
            )
            .optional()
            .map_err(CoreError::from)
    }

    /// List with the §6 filters. `has_location = Some(false)` is a no-op.
    pub fn list_memories(&self, filter: &MemoryListFilter) -> Result<Vec<Memory>> {
        let mut sql = String::from("SELECT DISTINCT m.* FROM memories m");
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if !filter.tag_ids.is_empty() {
            sql.push_str(" JOIN memory_tags mt ON mt.memory_id = m.id");
            let marks = vec!["?"; filter.tag_ids.len()].join(", ");
            clauses.push(format!("mt.tag_id IN ({marks})"));
            for id in &filter.tag_ids {
                args.push(Box::new(*id));
            }
        }
        if !filter.person_ids.is_empty() {
            sql.push_str(" JOIN memory_persons mp ON mp.memory_id = m.id");
            let marks = vec!["?"; filter.person_ids.len()].join(", ");
            clauses.push(format!("mp.person_id IN ({marks})"));
            for id in &filter.person_ids {
                args.push(Box::new(id.clone()));
            }
        }
        if !filter.include_deleted {
            clauses.push("m.deleted_at IS NULL".to_string());
        }
        if let Some(ct) = filter.content_type {
            clauses.push("m.content_type = ?".to_string());
            args.push(Box::new(ct.as_str().to_string()));
        }
        match filter.visibility {
            VisibilityFilter::Public => clauses.push("m.visibility = 'public'".to_string()),
            VisibilityFilter::Private => clauses.push("m.visibility = 'private'".to_string()),
            VisibilityFilter::All => {}
        }
        if let Some(year) = filter.year {
            clauses.push("strftime('%Y', m.captured_at) = ?".to_string());
            args.push(Box::new(format!("{year:04}")));
        }
        if let Some(from) = filter.date_from {
            clauses.push("m.captured_at >= ?".to_string());
            args.push(Box::new(from.to_rfc3339()));
        }
        if let Some(to) = filter.date_to {
            clauses.push("m.captured_at <= ?".to_string());
            args.push(Box::new(to.to_rfc3339()));
        }
        if filter.has_location == Some(true) {
            clauses.push("m.has_location = 1".to_string());
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY m.captured_at DESC LIMIT ? OFFSET ?");
        args.push(Box::new(filter.limit.max(1)));
        args.push(Box::new(filter.skip.max(0)));

        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| Self::map_memory(row),
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Captured-at stamps for a candidate set (search tie-breaking)
    pub fn captured_at_for(&self, ids: &[String]) -> Result<Vec<(String, DateTime<Utc>)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let marks = vec!["?"; ids.len()].join(", ");
        let sql =
            format!("SELECT id, captured_at FROM memories WHERE id IN ({marks}) AND deleted_at IS NULL");
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Apply a field-wise update atomically. Every field present in the
    /// update swaps plaintext-derived state and envelope together.
    pub fn update_memory(&self, id: &str, update: &MemoryUpdate) -> Result<Memory> {
        let mut writer = self.writer()?;
        let tx = writer.transaction().map_err(CoreError::from)?;

        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM memories WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !exists {
            return Err(CoreError::NotFound(format!("memory {id}")));
        }

        let now = Utc::now().to_rfc3339();
        if let Some(title) = &update.title_envelope {
            tx.execute(
                "UPDATE memories SET title_envelope = ?1, updated_at = ?2 WHERE id = ?3",
                params![title.as_ref().map(|e| e.to_json()).transpose()?, now, id],
            )?;
        }
        if let Some((envelope, digest)) = &update.content {
            tx.execute(
                "UPDATE memories
                 SET content_envelope = ?1, integrity_hash = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![envelope.to_json()?, digest, now, id],
            )?;
        }
        if let Some((envelope, has_location)) = &update.metadata {
            tx.execute(
                "UPDATE memories
                 SET metadata_envelope = ?1, has_location = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![envelope.to_json()?, has_location, now, id],
            )?;
        }
        if let Some(visibility) = update.visibility {
            tx.execute(
                "UPDATE memories SET visibility = ?1, updated_at = ?2 WHERE id = ?3",
                params![visibility.as_str(), now, id],
            )?;
        }
        if let Some(captured_at) = update.captured_at {
            tx.execute(
                "UPDATE memories SET captured_at = ?1, updated_at = ?2 WHERE id = ?3",
                params![captured_at.to_rfc3339(), now, id],
            )?;
        }
        if let Some(tokens) = &update.tokens {
            tx.execute("DELETE FROM search_tokens WHERE memory_id = ?1", params![id])?;
            Self::insert_tokens_tx(&tx, tokens)?;
        }
        tx.commit().map_err(CoreError::from)?;
        drop(writer);

        self.require_memory(id)
    }

    pub fn soft_delete_memory(&self, id: &str) -> Result<()> {
        let changed = self.writer()?.execute(
            "UPDATE memories SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!("memory {id}")));
        }
        Ok(())
    }

    /// Hard delete. Returns the vault paths the caller must unlink; tokens,
    /// connections, joins, and chunk bookkeeping cascade via foreign keys.
    pub fn purge_memory(&self, id: &str) -> Result<Vec<String>> {
        let mut writer = self.writer()?;
        let tx = writer.transaction().map_err(CoreError::from)?;

        let mut paths = Vec::new();
        let source: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT vault_path, original_vault_path FROM sources WHERE memory_id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((archival, original)) = source {
            paths.push(archival);
            if let Some(original) = original {
                paths.push(original);
            }
        }

        let deleted = tx.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(CoreError::NotFound(format!("memory {id}")));
        }
        tx.commit().map_err(CoreError::from)?;
        Ok(paths)
    }

    // ========================================================================
    // SOURCES
    // ========================================================================

    fn map_source(row: &rusqlite::Row<'_>) -> rusqlite::Result<Source> {
        let filename: Option<String> = row.get("filename_envelope")?;
        let dek: String = row.get("dek_envelope")?;
        Ok(Source {
            id: row.get("id")?,
            memory_id: row.get("memory_id")?,
            vault_path: row.get("vault_path")?,
            original_vault_path: row.get("original_vault_path")?,
            original_size: row.get("original_size")?,
            encrypted_size: row.get("encrypted_size")?,
            mime: row.get("mime")?,
            preservation_format: row.get("preservation_format")?,
            integrity_hash: row.get("integrity_hash")?,
            cipher_digest: row.get("cipher_digest")?,
            original_cipher_digest: row.get("original_cipher_digest")?,
            filename_envelope: filename.as_deref().and_then(|j| Envelope::from_json(j).ok()),
            // Malformed manifests surface on decrypt, not here
            dek_envelope: Envelope::from_json(&dek).unwrap_or(Envelope {
                ciphertext: Vec::new(),
                wrapped_dek: Vec::new(),
                algo: crate::shield::AlgoTag::CURRENT,
                version: crate::shield::ENVELOPE_VERSION,
            }),
            serve_archival: row.get("serve_archival")?,
            created_at: row.get("created_at")?,
        })
    }

    pub fn source(&self, id: &str) -> Result<Option<Source>> {
        let reader = self.reader()?;
        reader
            .query_row("SELECT * FROM sources WHERE id = ?1", params![id], |row| {
                Self::map_source(row)
            })
            .optional()
            .map_err(CoreError::from)
    }

    pub fn require_source(&self, id: &str) -> Result<Source> {
        self.source(id)?
            .ok_or_else(|| CoreError::NotFound(format!("source {id}")))
    }

    pub fn source_for_memory(&self, memory_id: &str) -> Result<Option<Source>> {
        let reader = self.reader()?;
        reader
            .query_row(
                "SELECT * FROM sources WHERE memory_id = ?1",
                params![memory_id],
                |row| Self::map_source(row),
            )
            .optional()
            .map_err(CoreError::from)
    }

    /// Full manifest scan (integrity audit). Reader connection only.
    pub fn all_sources(&self) -> Result<Vec<Source>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare("SELECT * FROM sources ORDER BY created_at")?;
        let rows = stmt.query_map([], |row| Self::map_source(row))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Rewrap a source's file DEK and filename envelope (re-key)
    pub fn update_source_envelopes(
        &self,
        id: &str,
        dek_envelope: &Envelope,
        filename_envelope: Option<&Envelope>,
    ) -> Result<()> {
        let changed = self.writer()?.execute(
            "UPDATE sources SET dek_envelope = ?1, filename_envelope = ?2 WHERE id = ?3",
            params![
                dek_envelope.to_json()?,
                filename_envelope.map(|e| e.to_json()).transpose()?,
                id
            ],
        )?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!("source {id}")));
        }
        Ok(())
    }

    // ========================================================================
    // BLIND TOKENS
    // ========================================================================

    /// Replace a memory's token set (rebuild / re-key window)
    pub fn replace_tokens(&self, memory_id: &str, tokens: &[SearchToken]) -> Result<()> {
        let mut writer = self.writer()?;
        let tx = writer.transaction().map_err(CoreError::from)?;
        tx.execute(
            "DELETE FROM search_tokens WHERE memory_id = ?1",
            params![memory_id],
        )?;
        Self::insert_tokens_tx(&tx, tokens)?;
        tx.commit().map_err(CoreError::from)
    }

    /// Equality match against the token table, soft-deleted memories excluded
    pub fn match_tokens(&self, tokens: &[String]) -> Result<Vec<TokenMatch>> {
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let marks = vec!["?"; tokens.len()].join(", ");
        let sql = format!(
            "SELECT st.memory_id, st.token_type, st.token
             FROM search_tokens st
             JOIN memories m ON m.id = st.memory_id
             WHERE st.token IN ({marks}) AND m.deleted_at IS NULL"
        );
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(tokens.iter()), |row| {
            let token_type: String = row.get(1)?;
            Ok((row.get::<_, String>(0)?, token_type, row.get::<_, String>(2)?))
        })?;
        Ok(rows
            .filter_map(|r| r.ok())
            .filter_map(|(memory_id, tt, token)| {
                TokenType::parse_name(&tt).map(|token_type| TokenMatch {
                    memory_id,
                    token_type,
                    token,
                })
            })
            .collect())
    }

    /// Page of live memory ids (token rebuild, re-key sweeps)
    pub fn memory_ids_page(&self, offset: i64, limit: i64) -> Result<Vec<String>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id FROM memories WHERE deleted_at IS NULL
             ORDER BY id LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit, offset], |row| row.get(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ========================================================================
    // CONNECTIONS
    // ========================================================================

    fn map_connection(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryConnection> {
        let kind: String = row.get("kind")?;
        let provenance: String = row.get("provenance")?;
        let explanation: Option<String> = row.get("explanation_envelope")?;
        Ok(MemoryConnection {
            id: row.get("id")?,
            source_id: row.get("source_id")?,
            target_id: row.get("target_id")?,
            kind: RelationKind::parse_name(&kind).unwrap_or_default(),
            strength: row.get("strength")?,
            provenance: Provenance::parse_name(&provenance),
            explanation_envelope: explanation
                .as_deref()
                .and_then(|j| Envelope::from_json(j).ok()),
            user_promoted: row.get("user_promoted")?,
            created_at: row.get("created_at")?,
        })
    }

    /// Idempotent on (source, target, kind, provenance): an existing edge is
    /// left untouched and reported as not inserted.
    pub fn upsert_connection(
        &self,
        source_id: &str,
        target_id: &str,
        kind: RelationKind,
        strength: f64,
        provenance: &Provenance,
        explanation_envelope: Option<&Envelope>,
    ) -> Result<bool> {
        if source_id == target_id {
            return Err(CoreError::PreconditionFailed(
                "connection cannot self-loop".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&strength) {
            return Err(CoreError::PreconditionFailed(format!(
                "strength {strength} outside [0,1]"
            )));
        }
        let inserted = self.writer()?.execute(
            "INSERT INTO connections
                 (source_id, target_id, kind, strength, provenance,
                  explanation_envelope, user_promoted, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
             ON CONFLICT (source_id, target_id, kind, provenance) DO NOTHING",
            params![
                source_id,
                target_id,
                kind.as_str(),
                strength,
                provenance.as_string(),
                explanation_envelope.map(|e| e.to_json()).transpose()?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Edges touching a memory in either direction
    pub fn connections_for_memory(&self, memory_id: &str) -> Result<Vec<MemoryConnection>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM connections
             WHERE source_id = ?1 OR target_id = ?1
             ORDER BY strength DESC",
        )?;
        let rows = stmt.query_map(params![memory_id], |row| Self::map_connection(row))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Promotion strips provenance to `user` and sets the flag
    pub fn promote_connection(&self, id: i64) -> Result<()> {
        let changed = self.writer()?.execute(
            "UPDATE connections SET provenance = 'user', user_promoted = 1 WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!("connection {id}")));
        }
        Ok(())
    }

    /// Every edge (re-key sweep). Reader connection only.
    pub fn all_connections(&self) -> Result<Vec<MemoryConnection>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare("SELECT * FROM connections ORDER BY id")?;
        let rows = stmt.query_map([], |row| Self::map_connection(row))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Swap an edge's explanation envelope (re-key)
    pub fn update_connection_envelope(
        &self,
        id: i64,
        explanation_envelope: Option<&Envelope>,
    ) -> Result<()> {
        self.writer()?.execute(
            "UPDATE connections SET explanation_envelope = ?1 WHERE id = ?2",
            params![explanation_envelope.map(|e| e.to_json()).transpose()?, id],
        )?;
        Ok(())
    }

    pub fn delete_connection(&self, id: i64) -> Result<()> {
        let changed = self
            .writer()?
            .execute("DELETE FROM connections WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!("connection {id}")));
        }
        Ok(())
    }

    // ========================================================================
    // TAGS
    // ========================================================================

    /// Case-normalized get-or-create
    pub fn ensure_tag(&self, name: &str, color: Option<&str>) -> Result<Tag> {
        let normalized = name.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(CoreError::PreconditionFailed("empty tag name".to_string()));
        }
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO tags (name, color) VALUES (?1, ?2)
             ON CONFLICT (name) DO NOTHING",
            params![normalized, color.unwrap_or("#8b8b8b")],
        )?;
        writer
            .query_row(
                "SELECT id, name, color FROM tags WHERE name = ?1",
                params![normalized],
                |row| {
                    Ok(Tag {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        color: row.get(2)?,
                    })
                },
            )
            .map_err(CoreError::from)
    }

    pub fn list_tags(&self) -> Result<Vec<Tag>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare("SELECT id, name, color FROM tags ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok(Tag {
                id: row.get(0)?,
                name: row.get(1)?,
                color: row.get(2)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Returns whether a new link was created (false: already linked)
    pub fn tag_memory(&self, memory_id: &str, tag_id: i64) -> Result<bool> {
        let inserted = self.writer()?.execute(
            "INSERT INTO memory_tags (memory_id, tag_id) VALUES (?1, ?2)
             ON CONFLICT DO NOTHING",
            params![memory_id, tag_id],
        )?;
        Ok(inserted > 0)
    }

    pub fn untag_memory(&self, memory_id: &str, tag_id: i64) -> Result<()> {
        self.writer()?.execute(
            "DELETE FROM memory_tags WHERE memory_id = ?1 AND tag_id = ?2",
            params![memory_id, tag_id],
        )?;
        Ok(())
    }

    pub fn tags_for_memory(&self, memory_id: &str) -> Result<Vec<Tag>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT t.id, t.name, t.color FROM tags t
             JOIN memory_tags mt ON mt.tag_id = t.id
             WHERE mt.memory_id = ?1 ORDER BY t.name",
        )?;
        let rows = stmt.query_map(params![memory_id], |row| {
            Ok(Tag {
                id: row.get(0)?,
                name: row.get(1)?,
                color: row.get(2)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ========================================================================
    // PERSONS
    // ========================================================================

    fn map_person(row: &rusqlite::Row<'_>) -> rusqlite::Result<Person> {
        let name_envelope: Option<String> = row.get("name_envelope")?;
        let relationship: Option<String> = row.get("relationship")?;
        Ok(Person {
            id: row.get("id")?,
            display_name: row.get("display_name")?,
            name_envelope: name_envelope
                .as_deref()
                .and_then(|j| Envelope::from_json(j).ok()),
            external_id: row.get("external_id")?,
            relationship: relationship.as_deref().and_then(OwnerRelationship::parse_name),
            deceased: row.get("deceased")?,
            created_at: row.get("created_at")?,
        })
    }

    pub fn insert_person(&self, person: &Person) -> Result<()> {
        self.writer()?.execute(
            "INSERT INTO persons
                 (id, display_name, name_envelope, external_id, relationship,
                  deceased, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                person.id,
                person.display_name,
                person.name_envelope.as_ref().map(|e| e.to_json()).transpose()?,
                person.external_id,
                person.relationship.map(|r| r.as_str()),
                person.deceased,
                person.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn person(&self, id: &str) -> Result<Option<Person>> {
        let reader = self.reader()?;
        reader
            .query_row("SELECT * FROM persons WHERE id = ?1", params![id], |row| {
                Self::map_person(row)
            })
            .optional()
            .map_err(CoreError::from)
    }

    pub fn list_persons(&self) -> Result<Vec<Person>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare("SELECT * FROM persons ORDER BY display_name")?;
        let rows = stmt.query_map([], |row| Self::map_person(row))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn update_person(&self, person: &Person) -> Result<()> {
        let changed = self.writer()?.execute(
            "UPDATE persons
             SET display_name = ?1, name_envelope = ?2, external_id = ?3,
                 relationship = ?4, deceased = ?5
             WHERE id = ?6",
            params![
                person.display_name,
                person.name_envelope.as_ref().map(|e| e.to_json()).transpose()?,
                person.external_id,
                person.relationship.map(|r| r.as_str()),
                person.deceased,
                person.id,
            ],
        )?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!("person {}", person.id)));
        }
        Ok(())
    }

    /// Link a person to a memory. A duplicate (memory, person, provenance)
    /// reports "already linked" success rather than Created.
    pub fn link_person(&self, link: &MemoryPerson) -> Result<bool> {
        let inserted = self.writer()?.execute(
            "INSERT INTO memory_persons (memory_id, person_id, provenance, confidence)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT DO NOTHING",
            params![
                link.memory_id,
                link.person_id,
                link.provenance.as_str(),
                link.confidence,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn unlink_person(&self, memory_id: &str, person_id: &str) -> Result<()> {
        self.writer()?.execute(
            "DELETE FROM memory_persons WHERE memory_id = ?1 AND person_id = ?2",
            params![memory_id, person_id],
        )?;
        Ok(())
    }

    pub fn persons_for_memory(&self, memory_id: &str) -> Result<Vec<MemoryPerson>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT memory_id, person_id, provenance, confidence
             FROM memory_persons WHERE memory_id = ?1",
        )?;
        let rows = stmt.query_map(params![memory_id], |row| {
            let provenance: String = row.get(2)?;
            Ok(MemoryPerson {
                memory_id: row.get(0)?,
                person_id: row.get(1)?,
                provenance: LinkProvenance::parse_name(&provenance),
                confidence: row.get(3)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ========================================================================
    // OWNER PROFILE
    // ========================================================================

    /// Upsert the singleton. Linking a self-person stamps that person's
    /// relationship as "self" in the same transaction; this is the only
    /// path that creates the self relationship.
    pub fn set_owner_profile(&self, profile: &OwnerProfile) -> Result<()> {
        let mut writer = self.writer()?;
        let tx = writer.transaction().map_err(CoreError::from)?;
        tx.execute(
            "INSERT INTO owner_profile (id, display_name, birthdate, bio, self_person_id)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT (id) DO UPDATE SET
                 display_name = excluded.display_name,
                 birthdate = excluded.birthdate,
                 bio = excluded.bio,
                 self_person_id = excluded.self_person_id",
            params![
                profile.display_name,
                profile.birthdate.map(|d| d.to_string()),
                profile.bio,
                profile.self_person_id,
            ],
        )?;
        if let Some(self_id) = &profile.self_person_id {
            let stamped = tx.execute(
                "UPDATE persons SET relationship = 'self' WHERE id = ?1",
                params![self_id],
            )?;
            if stamped == 0 {
                return Err(CoreError::NotFound(format!("person {self_id}")));
            }
        }
        tx.commit().map_err(CoreError::from)
    }

    pub fn owner_profile(&self) -> Result<Option<OwnerProfile>> {
        let reader = self.reader()?;
        reader
            .query_row(
                "SELECT display_name, birthdate, bio, self_person_id
                 FROM owner_profile WHERE id = 1",
                [],
                |row| {
                    let birthdate: Option<String> = row.get(1)?;
                    Ok(OwnerProfile {
                        display_name: row.get(0)?,
                        birthdate: birthdate.and_then(|d| d.parse().ok()),
                        bio: row.get(2)?,
                        self_person_id: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(CoreError::from)
    }

    // ========================================================================
    // SUGGESTIONS
    // ========================================================================

    fn map_suggestion(row: &rusqlite::Row<'_>) -> rusqlite::Result<Suggestion> {
        let payload: String = row.get("payload_envelope")?;
        let status: String = row.get("status")?;
        Ok(Suggestion {
            id: row.get("id")?,
            kind: row.get("kind")?,
            memory_id: row.get("memory_id")?,
            payload_envelope: Envelope::from_json(&payload).unwrap_or(Envelope {
                ciphertext: Vec::new(),
                wrapped_dek: Vec::new(),
                algo: crate::shield::AlgoTag::CURRENT,
                version: crate::shield::ENVELOPE_VERSION,
            }),
            status: SuggestionStatus::parse_name(&status),
            created_at: row.get("created_at")?,
            resolved_at: row.get("resolved_at")?,
        })
    }

    pub fn insert_suggestion(
        &self,
        kind: &str,
        memory_id: Option<&str>,
        payload_envelope: &Envelope,
    ) -> Result<i64> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO suggestions (kind, memory_id, payload_envelope, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![kind, memory_id, payload_envelope.to_json()?, Utc::now().to_rfc3339()],
        )?;
        Ok(writer.last_insert_rowid())
    }

    pub fn list_suggestions(&self, status: Option<SuggestionStatus>) -> Result<Vec<Suggestion>> {
        let reader = self.reader()?;
        let mut out = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = reader.prepare(
                    "SELECT * FROM suggestions WHERE status = ?1 ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map(params![status.as_str()], |row| {
                    Self::map_suggestion(row)
                })?;
                out.extend(rows.filter_map(|r| r.ok()));
            }
            None => {
                let mut stmt =
                    reader.prepare("SELECT * FROM suggestions ORDER BY created_at DESC")?;
                let rows = stmt.query_map([], |row| Self::map_suggestion(row))?;
                out.extend(rows.filter_map(|r| r.ok()));
            }
        }
        Ok(out)
    }

    /// Transition a suggestion. Terminal states are irreversible; a second
    /// transition (accept-after-dismiss and the like) is a `Conflict`.
    pub fn resolve_suggestion(&self, id: i64, status: SuggestionStatus) -> Result<Suggestion> {
        if !status.is_terminal() {
            return Err(CoreError::PreconditionFailed(
                "suggestions only transition to terminal states".to_string(),
            ));
        }
        let changed = self.writer()?.execute(
            "UPDATE suggestions SET status = ?1, resolved_at = ?2
             WHERE id = ?3 AND status = 'pending'",
            params![status.as_str(), Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            let exists = self
                .reader()?
                .query_row("SELECT 1 FROM suggestions WHERE id = ?1", params![id], |_| {
                    Ok(())
                })
                .optional()?;
            return match exists {
                Some(()) => Err(CoreError::Conflict(format!(
                    "suggestion {id} already resolved"
                ))),
                None => Err(CoreError::NotFound(format!("suggestion {id}"))),
            };
        }
        let reader = self.reader()?;
        reader
            .query_row("SELECT * FROM suggestions WHERE id = ?1", params![id], |row| {
                Self::map_suggestion(row)
            })
            .map_err(CoreError::from)
    }

    /// Swap a suggestion's payload envelope (re-key)
    pub fn update_suggestion_envelope(&self, id: i64, envelope: &Envelope) -> Result<()> {
        self.writer()?.execute(
            "UPDATE suggestions SET payload_envelope = ?1 WHERE id = ?2",
            params![envelope.to_json()?, id],
        )?;
        Ok(())
    }

    // ========================================================================
    // CONVERSATIONS
    // ========================================================================

    pub fn create_conversation(&self) -> Result<Conversation> {
        let now = Utc::now();
        let convo = Conversation {
            id: uuid::Uuid::now_v7().to_string(),
            title: None,
            created_at: now,
            updated_at: now,
        };
        self.writer()?.execute(
            "INSERT INTO conversations (id, title, created_at, updated_at)
             VALUES (?1, NULL, ?2, ?2)",
            params![convo.id, now.to_rfc3339()],
        )?;
        Ok(convo)
    }

    pub fn conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let reader = self.reader()?;
        reader
            .query_row(
                "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Conversation {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        created_at: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(CoreError::from)
    }

    pub fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, title, created_at, updated_at FROM conversations
             ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Conversation {
                id: row.get(0)?,
                title: row.get(1)?,
                created_at: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn set_conversation_title(&self, id: &str, title: &str) -> Result<()> {
        let changed = self.writer()?.execute(
            "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!("conversation {id}")));
        }
        Ok(())
    }

    pub fn append_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content_envelope: &Envelope,
        cited_memory_ids: &[String],
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO conversation_messages
                 (conversation_id, role, content_envelope, cited_memory_ids, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                conversation_id,
                role.as_str(),
                content_envelope.to_json()?,
                serde_json::to_string(cited_memory_ids)?,
                now,
            ],
        )?;
        let id = writer.last_insert_rowid();
        writer.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now, conversation_id],
        )?;
        Ok(id)
    }

    pub fn messages(&self, conversation_id: &str) -> Result<Vec<ConversationMessage>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, conversation_id, role, content_envelope, cited_memory_ids, created_at
             FROM conversation_messages WHERE conversation_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            let role: String = row.get(2)?;
            let envelope: String = row.get(3)?;
            let cited: String = row.get(4)?;
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                role,
                envelope,
                cited,
                row.get::<_, DateTime<Utc>>(5)?,
            ))
        })?;
        Ok(rows
            .filter_map(|r| r.ok())
            .filter_map(|(id, conversation_id, role, envelope, cited, created_at)| {
                Some(ConversationMessage {
                    id,
                    conversation_id,
                    role: MessageRole::parse_name(&role),
                    content_envelope: Envelope::from_json(&envelope).ok()?,
                    cited_memory_ids: serde_json::from_str(&cited).unwrap_or_default(),
                    created_at,
                })
            })
            .collect())
    }

    /// Every message row as (id, envelope) for the re-key sweep
    pub fn all_message_envelopes(&self) -> Result<Vec<(i64, Envelope)>> {
        let reader = self.reader()?;
        let mut stmt =
            reader.prepare("SELECT id, content_envelope FROM conversation_messages ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        Ok(rows
            .filter_map(|r| r.ok())
            .filter_map(|(id, json)| Envelope::from_json(&json).ok().map(|e| (id, e)))
            .collect())
    }

    /// Swap a message's content envelope (re-key)
    pub fn update_message_envelope(&self, id: i64, envelope: &Envelope) -> Result<()> {
        self.writer()?.execute(
            "UPDATE conversation_messages SET content_envelope = ?1 WHERE id = ?2",
            params![envelope.to_json()?, id],
        )?;
        Ok(())
    }

    // ========================================================================
    // HEARTBEAT
    // ========================================================================

    pub fn insert_challenge(
        &self,
        challenge: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.writer()?.execute(
            "INSERT INTO heartbeat_challenges (challenge, issued_at, expires_at, used)
             VALUES (?1, ?2, ?3, 0)",
            params![challenge, issued_at.to_rfc3339(), expires_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Single-use consumption: unknown → NotFound, replayed → Conflict,
    /// expired → PreconditionFailed.
    pub fn consume_challenge(&self, challenge: &str, now: DateTime<Utc>) -> Result<()> {
        let mut writer = self.writer()?;
        let tx = writer.transaction().map_err(CoreError::from)?;
        let row: Option<(DateTime<Utc>, bool)> = tx
            .query_row(
                "SELECT expires_at, used FROM heartbeat_challenges WHERE challenge = ?1",
                params![challenge],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            None => Err(CoreError::NotFound("challenge".to_string())),
            Some((_, true)) => Err(CoreError::Conflict("challenge already used".to_string())),
            Some((expires_at, false)) if expires_at < now => Err(
                CoreError::PreconditionFailed("challenge expired".to_string()),
            ),
            Some(_) => {
                tx.execute(
                    "UPDATE heartbeat_challenges SET used = 1 WHERE challenge = ?1",
                    params![challenge],
                )?;
                tx.commit().map_err(CoreError::from)
            }
        }
    }

    pub fn record_checkin(&self, at: DateTime<Utc>) -> Result<()> {
        self.writer()?.execute(
            "INSERT INTO heartbeat_checkins (at) VALUES (?1)",
            params![at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn last_checkin(&self) -> Result<Option<DateTime<Utc>>> {
        let reader = self.reader()?;
        reader
            .query_row("SELECT MAX(at) FROM heartbeat_checkins", [], |row| {
                row.get::<_, Option<DateTime<Utc>>>(0)
            })
            .map_err(CoreError::from)
    }

    /// Insert an escalation alert, idempotent on its key.
    /// Returns whether this call inserted the row.
    pub fn insert_alert(
        &self,
        level: AlertLevel,
        idempotency_key: &str,
        detail: Option<&str>,
    ) -> Result<bool> {
        let inserted = self.writer()?.execute(
            "INSERT INTO heartbeat_alerts (level, idempotency_key, dispatched_at, detail)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (idempotency_key) DO NOTHING",
            params![
                level.as_str(),
                idempotency_key,
                Utc::now().to_rfc3339(),
                detail,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn alerts(&self, limit: i64) -> Result<Vec<HeartbeatAlert>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, level, idempotency_key, dispatched_at, detail
             FROM heartbeat_alerts ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            let level: String = row.get(1)?;
            Ok(HeartbeatAlert {
                id: row.get(0)?,
                level: AlertLevel::parse_name(&level),
                idempotency_key: row.get(2)?,
                dispatched_at: row.get(3)?,
                detail: row.get(4)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ========================================================================
    // TESTAMENT
    // ========================================================================

    /// Singleton config; the default row is created on first read
    pub fn testament_config(&self) -> Result<TestamentConfig> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO testament_config (id) VALUES (1) ON CONFLICT DO NOTHING",
            [],
        )?;
        writer
            .query_row(
                "SELECT threshold_k, total_n, shares_generated, heir_mode_active
                 FROM testament_config WHERE id = 1",
                [],
                |row| {
                    Ok(TestamentConfig {
                        threshold_k: row.get(0)?,
                        total_n: row.get(1)?,
                        shares_generated: row.get(2)?,
                        heir_mode_active: row.get(3)?,
                    })
                },
            )
            .map_err(CoreError::from)
    }

    /// Change the scheme. Resets the shares-generated flag: old shares no
    /// longer match the recorded k/n.
    pub fn put_testament_config(&self, threshold_k: u8, total_n: u8) -> Result<TestamentConfig> {
        if threshold_k == 0 || threshold_k > total_n {
            return Err(CoreError::PreconditionFailed(format!(
                "invalid share scheme {threshold_k}-of-{total_n}"
            )));
        }
        self.testament_config()?;
        self.writer()?.execute(
            "UPDATE testament_config
             SET threshold_k = ?1, total_n = ?2, shares_generated = 0
             WHERE id = 1",
            params![threshold_k, total_n],
        )?;
        self.testament_config()
    }

    pub fn mark_shares_generated(&self) -> Result<()> {
        self.testament_config()?;
        self.writer()?.execute(
            "UPDATE testament_config SET shares_generated = 1 WHERE id = 1",
            [],
        )?;
        Ok(())
    }

    pub fn set_heir_mode(&self, active: bool) -> Result<()> {
        self.testament_config()?;
        self.writer()?.execute(
            "UPDATE testament_config SET heir_mode_active = ?1 WHERE id = 1",
            params![active],
        )?;
        Ok(())
    }

    pub fn upsert_heir(&self, heir: &Heir) -> Result<()> {
        self.writer()?.execute(
            "INSERT INTO heirs (id, name, email, phone, share_index, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (id) DO UPDATE SET
                 name = excluded.name,
                 email = excluded.email,
                 phone = excluded.phone,
                 share_index = excluded.share_index",
            params![
                heir.id,
                heir.name,
                heir.email,
                heir.phone,
                heir.share_index,
                heir.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_heirs(&self) -> Result<Vec<Heir>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, name, email, phone, share_index, created_at
             FROM heirs ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Heir {
                id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
                phone: row.get(3)?,
                share_index: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn delete_heir(&self, id: &str) -> Result<()> {
        let changed = self
            .writer()?
            .execute("DELETE FROM heirs WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!("heir {id}")));
        }
        Ok(())
    }

    /// Append-only; there is deliberately no update or delete path
    pub fn append_audit(&self, action: &str, detail: Option<&str>) -> Result<()> {
        self.writer()?.execute(
            "INSERT INTO audit_log (action, detail, at) VALUES (?1, ?2, ?3)",
            params![action, detail, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn audit_log(&self, limit: i64, offset: i64) -> Result<Vec<AuditLogEntry>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, action, detail, at FROM audit_log
             ORDER BY id DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit, offset], |row| {
            Ok(AuditLogEntry {
                id: row.get(0)?,
                action: row.get(1)?,
                detail: row.get(2)?,
                at: row.get(3)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ========================================================================
    // BACKGROUND LOOPS
    // ========================================================================

    fn map_loop(row: &rusqlite::Row<'_>) -> rusqlite::Result<LoopState> {
        Ok(LoopState {
            name: row.get(0)?,
            last_run_at: row.get(1)?,
            next_run_at: row.get(2)?,
            enabled: row.get(3)?,
            consecutive_failures: row.get(4)?,
        })
    }

    /// Register a loop if unseen; existing state is preserved across restarts
    pub fn ensure_loop(&self, name: &str, first_run_at: DateTime<Utc>) -> Result<()> {
        self.writer()?.execute(
            "INSERT INTO loop_state (name, last_run_at, next_run_at, enabled)
             VALUES (?1, NULL, ?2, 1)
             ON CONFLICT (name) DO NOTHING",
            params![name, first_run_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn loop_states(&self) -> Result<Vec<LoopState>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT name, last_run_at, next_run_at, enabled, consecutive_failures
             FROM loop_state ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| Self::map_loop(row))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn due_loops(&self, now: DateTime<Utc>) -> Result<Vec<LoopState>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT name, last_run_at, next_run_at, enabled, consecutive_failures
             FROM loop_state WHERE enabled = 1 AND next_run_at <= ?1",
        )?;
        let rows = stmt.query_map(params![now.to_rfc3339()], |row| Self::map_loop(row))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Compare-and-swap claim on next_run_at. At-most-one-in-flight: exactly
    /// one concurrent claimer sees a row change.
    pub fn claim_loop(
        &self,
        name: &str,
        expected_next: DateTime<Utc>,
        new_next: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self.writer()?.execute(
            "UPDATE loop_state SET next_run_at = ?1
             WHERE name = ?2 AND next_run_at = ?3 AND enabled = 1",
            params![new_next.to_rfc3339(), name, expected_next.to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    /// Successful run: stamp last_run_at, reset the failure counter
    pub fn finish_loop(
        &self,
        name: &str,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> Result<()> {
        self.writer()?.execute(
            "UPDATE loop_state
             SET last_run_at = ?1, next_run_at = ?2, consecutive_failures = 0
             WHERE name = ?3",
            params![last_run.to_rfc3339(), next_run.to_rfc3339(), name],
        )?;
        Ok(())
    }

    /// Failed run: last_run_at stays put, next_run_at still advances, and the
    /// loop auto-disables at the failure limit. Returns the new count.
    pub fn fail_loop(
        &self,
        name: &str,
        next_run: DateTime<Utc>,
        failure_limit: u32,
    ) -> Result<u32> {
        let mut writer = self.writer()?;
        let tx = writer.transaction().map_err(CoreError::from)?;
        tx.execute(
            "UPDATE loop_state
             SET next_run_at = ?1, consecutive_failures = consecutive_failures + 1
             WHERE name = ?2",
            params![next_run.to_rfc3339(), name],
        )?;
        let failures: u32 = tx.query_row(
            "SELECT consecutive_failures FROM loop_state WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        if failures >= failure_limit {
            tx.execute(
                "UPDATE loop_state SET enabled = 0 WHERE name = ?1",
                params![name],
            )?;
        }
        tx.commit().map_err(CoreError::from)?;
        Ok(failures)
    }

    pub fn set_loop_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let changed = self.writer()?.execute(
            "UPDATE loop_state
             SET enabled = ?1,
                 consecutive_failures = CASE WHEN ?1 THEN 0 ELSE consecutive_failures END
             WHERE name = ?2",
            params![enabled, name],
        )?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!("loop {name}")));
        }
        Ok(())
    }

    // ========================================================================
    // CHUNK BOOKKEEPING
    // ========================================================================

    /// Record which model embedded a memory's chunks and for which digest
    pub fn record_chunks(
        &self,
        memory_id: &str,
        model: &str,
        content_digest: &str,
        count: u32,
    ) -> Result<()> {
        let mut writer = self.writer()?;
        let tx = writer.transaction().map_err(CoreError::from)?;
        tx.execute(
            "DELETE FROM chunk_index WHERE memory_id = ?1",
            params![memory_id],
        )?;
        let mut stmt = tx.prepare_cached(
            "INSERT INTO chunk_index (memory_id, chunk_index, embedding_model, content_digest)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for i in 0..count {
            stmt.execute(params![memory_id, i, model, content_digest])?;
        }
        drop(stmt);
        tx.commit().map_err(CoreError::from)
    }

    /// Every model present in the chunk index (ModelMismatch detection)
    pub fn chunk_models(&self) -> Result<Vec<String>> {
        let reader = self.reader()?;
        let mut stmt =
            reader.prepare("SELECT DISTINCT embedding_model FROM chunk_index")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// The content digest a memory's chunks were built from, if any
    pub fn chunk_digest(&self, memory_id: &str) -> Result<Option<String>> {
        let reader = self.reader()?;
        reader
            .query_row(
                "SELECT content_digest FROM chunk_index WHERE memory_id = ?1 LIMIT 1",
                params![memory_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(CoreError::from)
    }

    pub fn delete_chunks(&self, memory_id: &str) -> Result<()> {
        self.writer()?.execute(
            "DELETE FROM chunk_index WHERE memory_id = ?1",
            params![memory_id],
        )?;
        Ok(())
    }

    // ========================================================================
    // RETRY CURSORS
    // ========================================================================

    /// Park a memory after a permanent background failure
    pub fn park_retry(
        &self,
        memory_id: &str,
        job_kind: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        self.writer()?.execute(
            "INSERT INTO retry_cursors (memory_id, job_kind, attempts, last_error, next_attempt_at)
             VALUES (?1, ?2, 1, ?3, ?4)
             ON CONFLICT (memory_id, job_kind) DO UPDATE SET
                 attempts = attempts + 1,
                 last_error = excluded.last_error,
                 next_attempt_at = excluded.next_attempt_at",
            params![memory_id, job_kind, error, next_attempt_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn due_retries(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<RetryCursor>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT memory_id, job_kind, attempts, last_error, next_attempt_at
             FROM retry_cursors WHERE next_attempt_at <= ?1
             ORDER BY next_attempt_at LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now.to_rfc3339(), limit], |row| {
            Ok(RetryCursor {
                memory_id: row.get(0)?,
                job_kind: row.get(1)?,
                attempts: row.get(2)?,
                last_error: row.get(3)?,
                next_attempt_at: row.get(4)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn clear_retry(&self, memory_id: &str, job_kind: &str) -> Result<()> {
        self.writer()?.execute(
            "DELETE FROM retry_cursors WHERE memory_id = ?1 AND job_kind = ?2",
            params![memory_id, job_kind],
        )?;
        Ok(())
    }

    // ========================================================================
    // RE-KEY PROGRESS
    // ========================================================================

    pub fn rekey_done(&self, object_kind: &str, object_id: &str) -> Result<bool> {
        let reader = self.reader()?;
        let found = reader
            .query_row(
                "SELECT 1 FROM rekey_progress WHERE object_kind = ?1 AND object_id = ?2",
                params![object_kind, object_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn mark_rekey(&self, object_kind: &str, object_id: &str) -> Result<()> {
        self.writer()?.execute(
            "INSERT INTO rekey_progress (object_kind, object_id, completed_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT DO NOTHING",
            params![object_kind, object_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Clear after a completed re-key so the next one starts fresh
    pub fn clear_rekey_progress(&self) -> Result<()> {
        self.writer()?.execute("DELETE FROM rekey_progress", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentType, SourceClass};

    fn test_storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(Some(dir.path().join("test.db"))).unwrap();
        (dir, storage)
    }

    fn envelope() -> Envelope {
        Envelope::encrypt(&[1u8; 32], b"fixture").unwrap()
    }

    fn test_memory() -> Memory {
        let mut m = Memory::new(ContentType::Text, SourceClass::Manual);
        m.integrity_hash = blake3::hash(b"fixture").to_hex().to_string();
        m.content_envelope = Some(envelope());
        m
    }

    #[test]
    fn kdf_config_round_trip_and_single_setup() {
        let (_dir, storage) = test_storage();
        assert!(!storage.is_setup().unwrap());

        let config = KdfConfig {
            salt: vec![7u8; 32],
            params: KdfParams::default(),
            verifier: vec![9u8; 32],
        };
        storage.save_kdf_config(&config).unwrap();
        assert!(storage.is_setup().unwrap());

        let loaded = storage.kdf_config().unwrap().unwrap();
        assert_eq!(loaded.salt, config.salt);
        assert_eq!(loaded.params, config.params);

        assert!(matches!(
            storage.save_kdf_config(&config),
            Err(CoreError::Conflict(_))
        ));
    }

    #[test]
    fn ingest_commit_is_atomic() {
        let (_dir, storage) = test_storage();
        let memory = test_memory();
        let tokens = vec![SearchToken {
            memory_id: memory.id.clone(),
            token_type: TokenType::Body,
            token: "ab".repeat(32),
        }];
        storage.commit_ingest(&memory, None, &tokens).unwrap();

        let loaded = storage.require_memory(&memory.id).unwrap();
        assert_eq!(loaded.integrity_hash, memory.integrity_hash);
        assert_eq!(
            storage.match_tokens(&["ab".repeat(32)]).unwrap().len(),
            1
        );
    }

    #[test]
    fn digest_dedup_probe() {
        let (_dir, storage) = test_storage();
        let memory = test_memory();
        storage.commit_ingest(&memory, None, &[]).unwrap();
        let found = storage.memory_by_digest(&memory.integrity_hash).unwrap();
        assert_eq!(found.unwrap().id, memory.id);
        assert!(storage.memory_by_digest("deadbeef").unwrap().is_none());
    }

    #[test]
    fn soft_delete_hides_purge_removes() {
        let (_dir, storage) = test_storage();
        let memory = test_memory();
        storage.commit_ingest(&memory, None, &[]).unwrap();

        storage.soft_delete_memory(&memory.id).unwrap();
        assert!(storage.memory(&memory.id, false).unwrap().is_none());
        assert!(storage.memory(&memory.id, true).unwrap().is_some());

        let paths = storage.purge_memory(&memory.id).unwrap();
        assert!(paths.is_empty());
        assert!(storage.memory(&memory.id, true).unwrap().is_none());
    }

    #[test]
    fn connection_idempotent_and_no_self_loop() {
        let (_dir, storage) = test_storage();
        let a = test_memory();
        let mut b = test_memory();
        b.integrity_hash = "other".to_string();
        storage.commit_ingest(&a, None, &[]).unwrap();
        storage.commit_ingest(&b, None, &[]).unwrap();

        let prov = Provenance::Model("m1".to_string());
        assert!(storage
            .upsert_connection(&a.id, &b.id, RelationKind::Supports, 0.8, &prov, None)
            .unwrap());
        assert!(!storage
            .upsert_connection(&a.id, &b.id, RelationKind::Supports, 0.9, &prov, None)
            .unwrap());
        assert!(matches!(
            storage.upsert_connection(&a.id, &a.id, RelationKind::Related, 0.5, &prov, None),
            Err(CoreError::PreconditionFailed(_))
        ));

        let edges = storage.connections_for_memory(&a.id).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].strength, 0.8);
    }

    #[test]
    fn purge_cascades_connections() {
        let (_dir, storage) = test_storage();
        let a = test_memory();
        let mut b = test_memory();
        b.integrity_hash = "other".to_string();
        storage.commit_ingest(&a, None, &[]).unwrap();
        storage.commit_ingest(&b, None, &[]).unwrap();
        storage
            .upsert_connection(&a.id, &b.id, RelationKind::Related, 0.5, &Provenance::User, None)
            .unwrap();

        storage.purge_memory(&b.id).unwrap();
        assert!(storage.connections_for_memory(&a.id).unwrap().is_empty());
    }

    #[test]
    fn tags_normalize_and_link_once() {
        let (_dir, storage) = test_storage();
        let memory = test_memory();
        storage.commit_ingest(&memory, None, &[]).unwrap();

        let tag = storage.ensure_tag("  Travel ", None).unwrap();
        assert_eq!(tag.name, "travel");
        let again = storage.ensure_tag("TRAVEL", None).unwrap();
        assert_eq!(again.id, tag.id);

        assert!(storage.tag_memory(&memory.id, tag.id).unwrap());
        assert!(!storage.tag_memory(&memory.id, tag.id).unwrap());
        assert_eq!(storage.tags_for_memory(&memory.id).unwrap().len(), 1);
    }

    #[test]
    fn person_link_provenances_coexist() {
        let (_dir, storage) = test_storage();
        let memory = test_memory();
        storage.commit_ingest(&memory, None, &[]).unwrap();

        let person = Person {
            id: uuid::Uuid::now_v7().to_string(),
            display_name: "Anna".to_string(),
            name_envelope: None,
            external_id: None,
            relationship: None,
            deceased: false,
            created_at: Utc::now(),
        };
        storage.insert_person(&person).unwrap();

        let manual = MemoryPerson {
            memory_id: memory.id.clone(),
            person_id: person.id.clone(),
            provenance: LinkProvenance::Manual,
            confidence: None,
        };
        let inferred = MemoryPerson {
            provenance: LinkProvenance::Inference,
            confidence: Some(0.82),
            ..manual.clone()
        };
        assert!(storage.link_person(&manual).unwrap());
        assert!(storage.link_person(&inferred).unwrap());
        // Duplicate reports "already linked", not an error
        assert!(!storage.link_person(&manual).unwrap());
        assert_eq!(storage.persons_for_memory(&memory.id).unwrap().len(), 2);
    }

    #[test]
    fn owner_profile_stamps_self() {
        let (_dir, storage) = test_storage();
        let person = Person {
            id: uuid::Uuid::now_v7().to_string(),
            display_name: "Me".to_string(),
            name_envelope: None,
            external_id: None,
            relationship: None,
            deceased: false,
            created_at: Utc::now(),
        };
        storage.insert_person(&person).unwrap();

        storage
            .set_owner_profile(&OwnerProfile {
                display_name: "Me".to_string(),
                birthdate: None,
                bio: None,
                self_person_id: Some(person.id.clone()),
            })
            .unwrap();

        let stamped = storage.person(&person.id).unwrap().unwrap();
        assert_eq!(stamped.relationship, Some(OwnerRelationship::SelfOwner));
    }

    #[test]
    fn suggestion_terminal_transitions_irreversible() {
        let (_dir, storage) = test_storage();
        let id = storage.insert_suggestion("tag", None, &envelope()).unwrap();

        let resolved = storage
            .resolve_suggestion(id, SuggestionStatus::Dismissed)
            .unwrap();
        assert_eq!(resolved.status, SuggestionStatus::Dismissed);

        assert!(matches!(
            storage.resolve_suggestion(id, SuggestionStatus::Accepted),
            Err(CoreError::Conflict(_))
        ));
    }

    #[test]
    fn alert_idempotency() {
        let (_dir, storage) = test_storage();
        assert!(storage
            .insert_alert(AlertLevel::Reminded, "reminder:2026-08-01", None)
            .unwrap());
        assert!(!storage
            .insert_alert(AlertLevel::Reminded, "reminder:2026-08-01", None)
            .unwrap());
        assert_eq!(storage.alerts(10).unwrap().len(), 1);
    }

    #[test]
    fn challenge_single_use() {
        let (_dir, storage) = test_storage();
        let now = Utc::now();
        storage
            .insert_challenge("abc123", now, now + chrono::Duration::days(30))
            .unwrap();

        storage.consume_challenge("abc123", now).unwrap();
        assert!(matches!(
            storage.consume_challenge("abc123", now),
            Err(CoreError::Conflict(_))
        ));
        assert!(matches!(
            storage.consume_challenge("missing", now),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn loop_claim_is_cas() {
        let (_dir, storage) = test_storage();
        let t0 = Utc::now();
        storage.ensure_loop("audit", t0).unwrap();

        let due = storage.due_loops(t0 + chrono::Duration::seconds(1)).unwrap();
        assert_eq!(due.len(), 1);
        let expected = due[0].next_run_at;
        let next = expected + chrono::Duration::hours(1);

        assert!(storage.claim_loop("audit", expected, next).unwrap());
        // Second claim with the stale expectation loses the race
        assert!(!storage.claim_loop("audit", expected, next).unwrap());
    }

    #[test]
    fn loop_auto_disables_after_failures() {
        let (_dir, storage) = test_storage();
        let t0 = Utc::now();
        storage.ensure_loop("flaky", t0).unwrap();

        for _ in 0..4 {
            storage.fail_loop("flaky", t0, 5).unwrap();
        }
        assert!(storage.loop_states().unwrap()[0].enabled);
        storage.fail_loop("flaky", t0, 5).unwrap();
        assert!(!storage.loop_states().unwrap()[0].enabled);
    }

    #[test]
    fn list_filters_by_year_and_type() {
        let (_dir, storage) = test_storage();
        let mut old = test_memory();
        old.captured_at = "2021-06-09T12:00:00Z".parse().unwrap();
        let mut recent = test_memory();
        recent.integrity_hash = "other".to_string();
        recent.content_type = ContentType::Photo;
        storage.commit_ingest(&old, None, &[]).unwrap();
        storage.commit_ingest(&recent, None, &[]).unwrap();

        let filter = MemoryListFilter {
            limit: 10,
            year: Some(2021),
            ..Default::default()
        };
        let hits = storage.list_memories(&filter).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, old.id);

        let filter = MemoryListFilter {
            limit: 10,
            content_type: Some(ContentType::Photo),
            ..Default::default()
        };
        let hits = storage.list_memories(&filter).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, recent.id);
    }

    #[test]
    fn update_swaps_field_and_tokens_atomically() {
        let (_dir, storage) = test_storage();
        let memory = test_memory();
        storage
            .commit_ingest(
                &memory,
                None,
                &[SearchToken {
                    memory_id: memory.id.clone(),
                    token_type: TokenType::Body,
                    token: "aa".repeat(32),
                }],
            )
            .unwrap();

        let new_env = envelope();
        let update = MemoryUpdate {
            content: Some((new_env.clone(), "newdigest".to_string())),
            tokens: Some(vec![SearchToken {
                memory_id: memory.id.clone(),
                token_type: TokenType::Body,
                token: "bb".repeat(32),
            }]),
            ..Default::default()
        };
        let updated = storage.update_memory(&memory.id, &update).unwrap();
        assert_eq!(updated.integrity_hash, "newdigest");
        assert!(storage.match_tokens(&["aa".repeat(32)]).unwrap().is_empty());
        assert_eq!(storage.match_tokens(&["bb".repeat(32)]).unwrap().len(), 1);
    }

    #[test]
    fn retry_cursor_park_and_drain() {
        let (_dir, storage) = test_storage();
        let now = Utc::now();
        storage.park_retry("mem1", "embed", "timeout", now).unwrap();
        storage.park_retry("mem1", "embed", "timeout again", now).unwrap();

        let due = storage.due_retries(now + chrono::Duration::seconds(1), 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts, 2);

        storage.clear_retry("mem1", "embed").unwrap();
        assert!(storage
            .due_retries(now + chrono::Duration::seconds(1), 10)
            .unwrap()
            .is_empty());
    }
}
