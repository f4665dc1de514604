//! Ingestion Orchestrator
//!
//! One transactional pipeline from raw input to every derived store:
//! digest → (file: convert, encrypt, vault writes, Source row) → field
//! envelopes → blind tokens → single database transaction → post-commit job
//! fan-out. Vault files are written before the commit with temp-then-rename,
//! so a crash mid-ingest leaves at most an orphan the audit reclaims; a
//! failed commit best-effort unlinks what was written. Ingesting a digest
//! that already exists short-circuits to the existing memory.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{CoreError, Result};
use crate::jobs::JobQueue;
use crate::model::{
    ContentType, Memory, MemoryMetadata, SearchToken, Source, SourceClass, Visibility,
};
use crate::shield::{Envelope, Session, TokenType, blind_index};
use crate::storage::Storage;
use crate::vault::{Converter, Vault};

/// What an ingest produced (or found)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub memory_id: String,
    pub source_id: Option<String>,
    pub content_type: ContentType,
    pub mime: Option<String>,
    pub preservation_format: Option<String>,
    /// False when the digest matched an existing memory
    pub created: bool,
}

/// A text capture
#[derive(Debug, Clone, Default)]
pub struct TextCapture {
    pub title: Option<String>,
    pub content: String,
    pub metadata: MemoryMetadata,
    pub captured_at: Option<DateTime<Utc>>,
    pub parent_id: Option<String>,
    pub source_class: SourceClass,
    pub visibility: Visibility,
}

/// A field-wise text patch. `title: Some(None)` clears the title;
/// absent fields stay untouched.
#[derive(Debug, Clone, Default)]
pub struct MemoryPatch {
    pub title: Option<Option<String>>,
    pub content: Option<String>,
    pub metadata: Option<MemoryMetadata>,
    pub visibility: Option<Visibility>,
    pub captured_at: Option<DateTime<Utc>>,
}

/// A file ingest
#[derive(Debug, Clone)]
pub struct FileIngest {
    pub bytes: Vec<u8>,
    pub declared_mime: String,
    pub filename: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
    pub parent_id: Option<String>,
    pub metadata: MemoryMetadata,
    /// Keep the pre-conversion original beside the archival rendition
    pub keep_original: bool,
}

/// The single entry point from raw input to all derived stores
pub struct Orchestrator {
    storage: Arc<Storage>,
    session: Arc<Session>,
    vault: Arc<Vault>,
    converter: Converter,
    jobs: JobQueue,
    max_payload_bytes: usize,
}

impl Orchestrator {
    pub fn new(
        storage: Arc<Storage>,
        session: Arc<Session>,
        vault: Arc<Vault>,
        converter: Converter,
        jobs: JobQueue,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            storage,
            session,
            vault,
            converter,
            jobs,
            max_payload_bytes,
        }
    }

    fn tokens_for(
        &self,
        memory_id: &str,
        title: Option<&str>,
        body: Option<&str>,
        metadata: &MemoryMetadata,
        captured_at: DateTime<Utc>,
    ) -> Result<Vec<SearchToken>> {
        self.session.with_keys(|keys| {
            let key = keys.search();
            let mut values: Vec<(String, TokenType)> = Vec::new();

            if let Some(title) = title {
                for token in blind_index::tokenize_text(key, title, TokenType::Title, true) {
                    values.push((token, TokenType::Title));
                }
            }
            if let Some(body) = body {
                for token in blind_index::tokenize_text(key, body, TokenType::Body, true) {
                    values.push((token, TokenType::Body));
                }
            }
            for tag in &metadata.tags {
                if let Some(token) = blind_index::tokenize_whole(key, tag, TokenType::Tag) {
                    values.push((token, TokenType::Tag));
                }
            }
            if let Some(place) = &metadata.place_name {
                if let Some(token) = blind_index::tokenize_whole(key, place, TokenType::Location)
                {
                    values.push((token, TokenType::Location));
                }
            }
            for token in blind_index::date_tokens(key, captured_at.date_naive()) {
                values.push((token, TokenType::Date));
            }

            Ok(values
                .into_iter()
                .map(|(token, token_type)| SearchToken {
                    memory_id: memory_id.to_string(),
                    token_type,
                    token,
                })
                .collect())
        })
    }

    fn encrypt_field(&self, plaintext: &[u8]) -> Result<Envelope> {
        self.session
            .with_keys(|keys| Envelope::encrypt(keys.kek(), plaintext))
    }

    /// Capture text. Returns the existing memory when the digest is known.
    pub async fn ingest_text(&self, capture: TextCapture) -> Result<IngestOutcome> {
        self.session.require_writable()?;
        if capture.content.len() > self.max_payload_bytes {
            return Err(CoreError::QuotaExceeded("payload too large".to_string()));
        }

        let digest = blake3::hash(capture.content.as_bytes()).to_hex().to_string();
        if let Some(existing) = self.storage.memory_by_digest(&digest)? {
            return Ok(IngestOutcome {
                memory_id: existing.id,
                source_id: None,
                content_type: existing.content_type,
                mime: None,
                preservation_format: None,
                created: false,
            });
        }

        let mut memory = Memory::new(ContentType::Text, capture.source_class);
        memory.captured_at = capture.captured_at.unwrap_or_else(Utc::now);
        memory.parent_id = capture.parent_id.clone();
        memory.visibility = capture.visibility;
        memory.integrity_hash = digest;
        memory.has_location = capture.metadata.has_coordinates();

        memory.title_envelope = capture
            .title
            .as_deref()
            .map(|t| self.encrypt_field(t.as_bytes()))
            .transpose()?;
        memory.content_envelope = Some(self.encrypt_field(capture.content.as_bytes())?);
        memory.metadata_envelope =
            Some(self.encrypt_field(&serde_json::to_vec(&capture.metadata)?)?);

        let tokens = self.tokens_for(
            &memory.id,
            capture.title.as_deref(),
            Some(&capture.content),
            &capture.metadata,
            memory.captured_at,
        )?;

        self.storage.commit_ingest(&memory, None, &tokens)?;
        self.enqueue_jobs(&memory.id);

        Ok(IngestOutcome {
            memory_id: memory.id,
            source_id: None,
            content_type: ContentType::Text,
            mime: None,
            preservation_format: None,
            created: true,
        })
    }

    /// Ingest a file: convert, encrypt both renditions, write vault blobs,
    /// then commit the Memory + Source + token rows in one transaction.
    pub async fn ingest_file(&self, ingest: FileIngest) -> Result<IngestOutcome> {
        self.session.require_writable()?;
        if ingest.bytes.len() > self.max_payload_bytes {
            return Err(CoreError::QuotaExceeded("payload too large".to_string()));
        }

        // Integrity hash on plaintext, pre-conversion
        let digest = blake3::hash(&ingest.bytes).to_hex().to_string();
        let content_type = ContentType::from_mime(&ingest.declared_mime);
        if let Some(existing) = self.storage.memory_by_digest(&digest)? {
            let source = self.storage.source_for_memory(&existing.id)?;
            return Ok(IngestOutcome {
                memory_id: existing.id,
                source_id: source.as_ref().map(|s| s.id.clone()),
                content_type: existing.content_type,
                mime: source.as_ref().map(|s| s.mime.clone()),
                preservation_format: source.map(|s| s.preservation_format),
                created: false,
            });
        }

        let converted = self.converter.convert(&ingest.bytes, &ingest.declared_mime).await?;
        let captured_at = ingest.captured_at.unwrap_or_else(Utc::now);

        // One DEK per source, wrapped by the FileKey; both renditions share it
        let dek = crate::shield::primitives::generate_dek();
        let dek_envelope = self
            .session
            .with_keys(|keys| Envelope::wrap_dek(keys.file(), &dek))?;

        let archival_blob = self.vault.store(&dek, &converted.archival, captured_at)?;
        let original_blob = if converted.changed && ingest.keep_original {
            Some(self.vault.store(&dek, &ingest.bytes, captured_at)?)
        } else {
            None
        };

        let filename_envelope = ingest
            .filename
            .as_deref()
            .map(|name| self.encrypt_field(name.as_bytes()))
            .transpose()?;
        if let Some(envelope) = &filename_envelope {
            self.vault.write_meta(&archival_blob.rel_path, envelope)?;
        }

        let mut memory = Memory::new(content_type, SourceClass::Import);
        memory.captured_at = captured_at;
        memory.parent_id = ingest.parent_id.clone();
        memory.integrity_hash = digest.clone();
        memory.has_location = ingest.metadata.has_coordinates();

        let title = ingest.filename.clone();
        memory.title_envelope = title
            .as_deref()
            .map(|t| self.encrypt_field(t.as_bytes()))
            .transpose()?;
        memory.content_envelope = converted
            .text_extract
            .as_deref()
            .map(|t| self.encrypt_field(t.as_bytes()))
            .transpose()?;
        memory.metadata_envelope =
            Some(self.encrypt_field(&serde_json::to_vec(&ingest.metadata)?)?);

        let source = Source {
            id: uuid::Uuid::new_v4().to_string(),
            memory_id: memory.id.clone(),
            vault_path: archival_blob.rel_path.clone(),
            original_vault_path: original_blob.as_ref().map(|b| b.rel_path.clone()),
            original_size: ingest.bytes.len() as i64,
            encrypted_size: archival_blob.encrypted_size as i64,
            mime: ingest.declared_mime.clone(),
            preservation_format: converted.preservation_format.clone(),
            integrity_hash: digest,
            cipher_digest: archival_blob.cipher_digest.clone(),
            original_cipher_digest: original_blob.as_ref().map(|b| b.cipher_digest.clone()),
            filename_envelope,
            dek_envelope,
            serve_archival: true,
            created_at: Utc::now(),
        };
        memory.source_id = Some(source.id.clone());

        let tokens = self.tokens_for(
            &memory.id,
            title.as_deref(),
            converted.text_extract.as_deref(),
            &ingest.metadata,
            captured_at,
        )?;

        if let Err(e) = self.storage.commit_ingest(&memory, Some(&source), &tokens) {
            // Reverse the vault writes best-effort; anything left is an
            // orphan the audit reclaims
            let _ = self.vault.remove(&archival_blob.rel_path);
            if let Some(blob) = &original_blob {
                let _ = self.vault.remove(&blob.rel_path);
            }
            return Err(e);
        }
        self.enqueue_jobs(&memory.id);

        Ok(IngestOutcome {
            memory_id: memory.id,
            source_id: Some(source.id),
            content_type,
            mime: Some(ingest.declared_mime),
            preservation_format: Some(converted.preservation_format),
            created: true,
        })
    }

    /// Patch text fields. Every touched field swaps plaintext-derived state
    /// and envelope together; the blind tokens are regenerated from the
    /// merged plaintext so no field can diverge from its index.
    pub async fn update_memory_fields(
        &self,
        memory_id: &str,
        patch: MemoryPatch,
    ) -> Result<Memory> {
        self.session.require_writable()?;
        let memory = self.storage.require_memory(memory_id)?;

        // Current plaintext, decrypted transiently for the merge
        let (current_title, current_content, current_metadata) =
            self.session.with_keys(|keys| {
                let title = memory
                    .title_envelope
                    .as_ref()
                    .map(|e| e.decrypt(keys.kek()))
                    .transpose()?
                    .map(|b| String::from_utf8_lossy(&b).into_owned());
                let content = memory
                    .content_envelope
                    .as_ref()
                    .map(|e| e.decrypt(keys.kek()))
                    .transpose()?
                    .map(|b| String::from_utf8_lossy(&b).into_owned());
                let metadata = memory
                    .metadata_envelope
                    .as_ref()
                    .map(|e| e.decrypt(keys.kek()))
                    .transpose()?
                    .map(|b| serde_json::from_slice(&b).unwrap_or_default())
                    .unwrap_or_default();
                Ok((title, content, metadata))
            })?;

        let merged_title = match &patch.title {
            Some(new_title) => new_title.clone(),
            None => current_title,
        };
        let merged_content = patch.content.clone().or(current_content);
        let merged_metadata = patch.metadata.clone().unwrap_or(current_metadata);
        let merged_captured = patch.captured_at.unwrap_or(memory.captured_at);
        let content_changed = patch.content.is_some();

        let mut update = crate::storage::MemoryUpdate {
            visibility: patch.visibility,
            captured_at: patch.captured_at,
            ..Default::default()
        };
        if patch.title.is_some() {
            update.title_envelope = Some(
                merged_title
                    .as_deref()
                    .map(|t| self.encrypt_field(t.as_bytes()))
                    .transpose()?,
            );
        }
        if let Some(content) = &patch.content {
            let digest = blake3::hash(content.as_bytes()).to_hex().to_string();
            update.content = Some((self.encrypt_field(content.as_bytes())?, digest));
        }
        if patch.metadata.is_some() {
            update.metadata = Some((
                self.encrypt_field(&serde_json::to_vec(&merged_metadata)?)?,
                merged_metadata.has_coordinates(),
            ));
        }
        update.tokens = Some(self.tokens_for(
            memory_id,
            merged_title.as_deref(),
            merged_content.as_deref(),
            &merged_metadata,
            merged_captured,
        )?);

        let updated = self.storage.update_memory(memory_id, &update)?;
        if content_changed {
            // Material update: re-embed and re-synthesize
            self.enqueue_jobs(memory_id);
        }
        Ok(updated)
    }

    fn enqueue_jobs(&self, memory_id: &str) {
        // Jobs are post-commit and best-effort; backpressure is logged,
        // the retry drain picks the memory up later
        if let Err(e) = self.jobs.enqueue_derivations(memory_id) {
            tracing::warn!(memory_id, "derivation enqueue failed: {e:?}");
            let _ = self.storage.park_retry(
                memory_id,
                "embed",
                "enqueue backpressure",
                Utc::now() + chrono::Duration::minutes(5),
            );
        }
    }

    /// Hard delete: database rows, vault blobs, vector points
    pub async fn purge(
        &self,
        memory_id: &str,
        vectors: &dyn crate::cortex::VectorStore,
    ) -> Result<()> {
        self.session.require_writable()?;
        let paths = self.storage.purge_memory(memory_id)?;
        for path in paths {
            self.vault.remove(&path)?;
        }
        vectors.delete_memory(memory_id).await?;
        Ok(())
    }
}
