//! Re-Key
//!
//! Changing the passphrase derives a new master, new sub-keys, and rewraps
//! every stored per-object data key; blind-index tokens are regenerated under
//! the new SearchKey. Progress is recorded per object so a restart resumes
//! where it stopped instead of re-encrypting from scratch. The session ends
//! up unlocked under the new keys.

use std::sync::Arc;

use serde::Serialize;
use zeroize::Zeroize;

use crate::error::{CoreError, Result};
use crate::model::{MemoryMetadata, SearchToken};
use crate::shield::primitives::{self, KdfParams};
use crate::shield::{Envelope, MasterKey, Session, SessionMode, SubKeys, TokenType, blind_index};
use crate::storage::{KdfConfig, MemoryUpdate, Storage};

/// What one re-key run touched
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RekeySummary {
    pub memories: usize,
    pub sources: usize,
    pub connections: usize,
    pub messages: usize,
    pub suggestions: usize,
    pub persons: usize,
    pub skipped: usize,
}

/// Passphrase rotation over every envelope family
pub struct RekeyService {
    storage: Arc<Storage>,
    session: Arc<Session>,
}

impl RekeyService {
    pub fn new(storage: Arc<Storage>, session: Arc<Session>) -> Self {
        Self { storage, session }
    }

    /// Rotate from the current master (re-uploaded transiently) to a new
    /// passphrase. Idempotent on restart via the per-object progress table.
    pub async fn rekey(
        &self,
        old_master_b64: &str,
        new_passphrase: &str,
    ) -> Result<RekeySummary> {
        self.session.require_writable()?;
        let stored = self
            .storage
            .kdf_config()?
            .ok_or_else(|| CoreError::PreconditionFailed("setup not completed".to_string()))?;

        let old_master = MasterKey::from_b64(old_master_b64)?;
        if !primitives::ct_eq(&old_master.verifier(), &stored.verifier) {
            return Err(CoreError::BadPassphrase);
        }
        let old_keys = SubKeys::derive(&old_master);
        drop(old_master);

        let new_salt = primitives::generate_salt();
        let new_params = KdfParams::default();
        let new_master = MasterKey::derive(new_passphrase, &new_salt, &new_params)?;
        let new_verifier = new_master.verifier();
        let new_keys = SubKeys::derive(&new_master);

        let mut summary = RekeySummary::default();
        self.rekey_memories(&old_keys, &new_keys, &mut summary)?;
        self.rekey_sources(&old_keys, &new_keys, &mut summary)?;
        self.rekey_connections(&old_keys, &new_keys, &mut summary)?;
        self.rekey_messages(&old_keys, &new_keys, &mut summary)?;
        self.rekey_suggestions(&old_keys, &new_keys, &mut summary)?;
        self.rekey_persons(&old_keys, &new_keys, &mut summary)?;

        self.storage.replace_kdf_config(&KdfConfig {
            salt: new_salt.to_vec(),
            params: new_params,
            verifier: new_verifier.to_vec(),
        })?;
        self.storage.clear_rekey_progress()?;
        self.storage.append_audit("rekey_completed", None)?;

        // Hand the session over to the new hierarchy
        drop(new_keys);
        self.session
            .unlock(new_master, &new_verifier, SessionMode::Owner)?;
        Ok(summary)
    }

    /// Re-encrypt a memory's three envelopes and regenerate its tokens
    fn rekey_memories(
        &self,
        old: &SubKeys,
        new: &SubKeys,
        summary: &mut RekeySummary,
    ) -> Result<()> {
        let mut offset = 0;
        loop {
            let page = self.storage.memory_ids_page(offset, 256)?;
            if page.is_empty() {
                return Ok(());
            }
            offset += page.len() as i64;

            for id in page {
                if self.storage.rekey_done("memory", &id)? {
                    summary.skipped += 1;
                    continue;
                }
                let memory = self.storage.require_memory(&id)?;

                let mut update = MemoryUpdate::default();
                let mut title_plain: Option<Vec<u8>> = None;
                let mut body_plain: Option<Vec<u8>> = None;
                let mut metadata = MemoryMetadata::default();

                if let Some(envelope) = &memory.title_envelope {
                    let plain = envelope.decrypt(old.kek())?;
                    update.title_envelope = Some(Some(Envelope::encrypt(new.kek(), &plain)?));
                    title_plain = Some(plain);
                }
                if let Some(envelope) = &memory.content_envelope {
                    let plain = envelope.decrypt(old.kek())?;
                    update.content =
                        Some((Envelope::encrypt(new.kek(), &plain)?, memory.integrity_hash.clone()));
                    body_plain = Some(plain);
                }
                if let Some(envelope) = &memory.metadata_envelope {
                    let plain = envelope.decrypt(old.kek())?;
                    metadata = serde_json::from_slice(&plain).unwrap_or_default();
                    update.metadata = Some((
                        Envelope::encrypt(new.kek(), &plain)?,
                        metadata.has_coordinates(),
                    ));
                }

                update.tokens = Some(Self::regenerate_tokens(
                    new,
                    &id,
                    title_plain.as_deref(),
                    body_plain.as_deref(),
                    &metadata,
                    memory.captured_at,
                )?);

                self.storage.update_memory(&id, &update)?;
                if let Some(mut plain) = title_plain {
                    plain.zeroize();
                }
                if let Some(mut plain) = body_plain {
                    plain.zeroize();
                }
                self.storage.mark_rekey("memory", &id)?;
                summary.memories += 1;
            }
        }
    }

    fn regenerate_tokens(
        new: &SubKeys,
        memory_id: &str,
        title: Option<&[u8]>,
        body: Option<&[u8]>,
        metadata: &MemoryMetadata,
        captured_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<SearchToken>> {
        let key = new.search();
        let mut values: Vec<(String, TokenType)> = Vec::new();
        if let Some(title) = title {
            let title = String::from_utf8_lossy(title);
            for token in blind_index::tokenize_text(key, &title, TokenType::Title, true) {
                values.push((token, TokenType::Title));
            }
        }
        if let Some(body) = body {
            let body = String::from_utf8_lossy(body);
            for token in blind_index::tokenize_text(key, &body, TokenType::Body, true) {
                values.push((token, TokenType::Body));
            }
        }
        for tag in &metadata.tags {
            if let Some(token) = blind_index::tokenize_whole(key, tag, TokenType::Tag) {
                values.push((token, TokenType::Tag));
            }
        }
        if let Some(place) = &metadata.place_name {
            if let Some(token) = blind_index::tokenize_whole(key, place, TokenType::Location) {
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
    }

    /// Vault file bodies stay put; only the manifest's wrapped DEK moves
    fn rekey_sources(
        &self,
        old: &SubKeys,
        new: &SubKeys,
        summary: &mut RekeySummary,
    ) -> Result<()> {
        for source in self.storage.all_sources()? {
            if self.storage.rekey_done("source", &source.id)? {
                summary.skipped += 1;
                continue;
            }
            let rewrapped_dek = source.dek_envelope.rewrap_dek(old.file(), new.file())?;
            let rewrapped_name = source
                .filename_envelope
                .as_ref()
                .map(|e| e.reencrypt(old.kek(), new.kek()))
                .transpose()?;
            self.storage.update_source_envelopes(
                &source.id,
                &rewrapped_dek,
                rewrapped_name.as_ref(),
            )?;
            self.storage.mark_rekey("source", &source.id)?;
            summary.sources += 1;
        }
        Ok(())
    }

    fn rekey_connections(
        &self,
        old: &SubKeys,
        new: &SubKeys,
        summary: &mut RekeySummary,
    ) -> Result<()> {
        for connection in self.storage.all_connections()? {
            let key = connection.id.to_string();
            if self.storage.rekey_done("connection", &key)? {
                summary.skipped += 1;
                continue;
            }
            if let Some(envelope) = &connection.explanation_envelope {
                let rewrapped = envelope.reencrypt(old.kek(), new.kek())?;
                self.storage
                    .update_connection_envelope(connection.id, Some(&rewrapped))?;
            }
            self.storage.mark_rekey("connection", &key)?;
            summary.connections += 1;
        }
        Ok(())
    }

    fn rekey_messages(
        &self,
        old: &SubKeys,
        new: &SubKeys,
        summary: &mut RekeySummary,
    ) -> Result<()> {
        for (id, envelope) in self.storage.all_message_envelopes()? {
            let key = id.to_string();
            if self.storage.rekey_done("message", &key)? {
                summary.skipped += 1;
                continue;
            }
            let rewrapped = envelope.reencrypt(old.kek(), new.kek())?;
            self.storage.update_message_envelope(id, &rewrapped)?;
            self.storage.mark_rekey("message", &key)?;
            summary.messages += 1;
        }
        Ok(())
    }

    fn rekey_suggestions(
        &self,
        old: &SubKeys,
        new: &SubKeys,
        summary: &mut RekeySummary,
    ) -> Result<()> {
        for suggestion in self.storage.list_suggestions(None)? {
            let key = suggestion.id.to_string();
            if self.storage.rekey_done("suggestion", &key)? {
                summary.skipped += 1;
                continue;
            }
            let rewrapped = suggestion.payload_envelope.reencrypt(old.kek(), new.kek())?;
            self.storage
                .update_suggestion_envelope(suggestion.id, &rewrapped)?;
            self.storage.mark_rekey("suggestion", &key)?;
            summary.suggestions += 1;
        }
        Ok(())
    }

    fn rekey_persons(
        &self,
        old: &SubKeys,
        new: &SubKeys,
        summary: &mut RekeySummary,
    ) -> Result<()> {
        for mut person in self.storage.list_persons()? {
            if self.storage.rekey_done("person", &person.id)? {
                summary.skipped += 1;
                continue;
            }
            if let Some(envelope) = &person.name_envelope {
                person.name_envelope = Some(envelope.reencrypt(old.kek(), new.kek())?);
                self.storage.update_person(&person)?;
            }
            self.storage.mark_rekey("person", &person.id)?;
            summary.persons += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentType, Memory, SourceClass};
    use base64::Engine;

    fn b64(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    async fn rekey_fixture() -> (tempfile::TempDir, Arc<Storage>, Arc<Session>, [u8; 32]) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("rk.db"))).unwrap());
        let session = Arc::new(Session::new(15));

        let master_bytes = [31u8; 32];
        let master = MasterKey::from_bytes(master_bytes);
        let verifier = master.verifier();
        storage
            .save_kdf_config(&KdfConfig {
                salt: vec![2u8; 32],
                params: KdfParams::default(),
                verifier: verifier.to_vec(),
            })
            .unwrap();
        session.unlock(master, &verifier, SessionMode::Owner).unwrap();
        (dir, storage, session, master_bytes)
    }

    #[tokio::test]
    async fn rekey_moves_envelopes_and_tokens() {
        let (_dir, storage, session, master_bytes) = rekey_fixture().await;
        let old_keys = SubKeys::derive(&MasterKey::from_bytes(master_bytes));

        let mut memory = Memory::new(ContentType::Text, SourceClass::Manual);
        memory.integrity_hash = blake3::hash(b"paris content").to_hex().to_string();
        memory.title_envelope =
            Some(Envelope::encrypt(old_keys.kek(), b"Paris trip").unwrap());
        memory.content_envelope =
            Some(Envelope::encrypt(old_keys.kek(), b"paris content").unwrap());
        let old_token = blind_index::token(old_keys.search(), "paris", TokenType::Title);
        storage
            .commit_ingest(
                &memory,
                None,
                &[SearchToken {
                    memory_id: memory.id.clone(),
                    token_type: TokenType::Title,
                    token: old_token.clone(),
                }],
            )
            .unwrap();

        let service = RekeyService::new(Arc::clone(&storage), Arc::clone(&session));
        let summary = service
            .rekey(&b64(&master_bytes), "new correct horse")
            .await
            .unwrap();
        assert_eq!(summary.memories, 1);

        // Old tokens are gone; the new SearchKey finds the title
        assert!(storage.match_tokens(&[old_token]).unwrap().is_empty());
        let new_keys = session
            .with_keys(|keys| {
                Ok(blind_index::token(keys.search(), "paris", TokenType::Title))
            })
            .unwrap();
        assert_eq!(storage.match_tokens(&[new_keys]).unwrap().len(), 1);

        // Envelope decrypts under the new hierarchy only
        let reloaded = storage.require_memory(&memory.id).unwrap();
        let title = session
            .with_keys(|keys| reloaded.title_envelope.as_ref().unwrap().decrypt(keys.kek()))
            .unwrap();
        assert_eq!(title, b"Paris trip");
        assert!(
            reloaded
                .title_envelope
                .unwrap()
                .decrypt(old_keys.kek())
                .is_err()
        );
    }

    #[tokio::test]
    async fn rekey_requires_current_master() {
        let (_dir, storage, session, _master) = rekey_fixture().await;
        let service = RekeyService::new(storage, session);
        assert!(matches!(
            service.rekey(&b64(&[0u8; 32]), "whatever").await,
            Err(CoreError::BadPassphrase)
        ));
    }
}
