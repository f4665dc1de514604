//! The Testament
//!
//! Secret-sharing inheritance: k-of-n mnemonic shares of the master key, heir
//! management, the heartbeat escalation machine, and heir mode. Below the
//! threshold a share set is information-theoretic noise; the stored verifier
//! is the only evidence a combination recovered the real master.

pub mod heartbeat;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::error::{CoreError, Result};
use crate::model::{Heir, TestamentConfig};
use crate::shield::{MasterKey, Session, SessionMode, sharing};
use crate::storage::Storage;

pub use heartbeat::{HeartbeatService, HeartbeatStatus};

/// Result of a share split
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareBundle {
    pub shares: Vec<String>,
    pub k: u8,
    pub n: u8,
}

/// Share lifecycle, heirs, and heir-mode session entry
pub struct TestamentService {
    storage: Arc<Storage>,
    session: Arc<Session>,
}

impl TestamentService {
    pub fn new(storage: Arc<Storage>, session: Arc<Session>) -> Self {
        Self { storage, session }
    }

    pub fn config(&self) -> Result<TestamentConfig> {
        self.storage.testament_config()
    }

    pub fn put_config(&self, k: u8, n: u8) -> Result<TestamentConfig> {
        self.session.require_writable()?;
        let config = self.storage.put_testament_config(k, n)?;
        self.storage
            .append_audit("testament_config", Some(&format!("{k}-of-{n}")))?;
        Ok(config)
    }

    /// Split the master key into mnemonic shares. The owner re-uploads the
    /// master transiently (it is never held server-side past unlock); it is
    /// verified against the stored verifier, split, and dropped.
    pub fn split_shares(
        &self,
        master_key_b64: &str,
        passphrase: Option<&str>,
    ) -> Result<ShareBundle> {
        self.session.require_writable()?;
        let config = self.storage.testament_config()?;
        let stored = self
            .storage
            .kdf_config()?
            .ok_or_else(|| CoreError::PreconditionFailed("setup not completed".to_string()))?;

        let master = MasterKey::from_b64(master_key_b64)?;
        if !crate::shield::primitives::ct_eq(&master.verifier(), &stored.verifier) {
            return Err(CoreError::BadPassphrase);
        }

        let shares = sharing::split(
            master.as_bytes(),
            config.threshold_k,
            config.total_n,
            passphrase,
        )?;
        drop(master);

        // Hand share indexes to heirs that don't have one yet
        let mut taken: Vec<u8> = self
            .storage
            .list_heirs()?
            .iter()
            .filter_map(|h| h.share_index)
            .collect();
        for mut heir in self.storage.list_heirs()? {
            if heir.share_index.is_some() {
                continue;
            }
            if let Some(index) = (1..=config.total_n).find(|i| !taken.contains(i)) {
                taken.push(index);
                heir.share_index = Some(index);
                self.storage.upsert_heir(&heir)?;
            }
        }

        self.storage.mark_shares_generated()?;
        self.storage.append_audit(
            "shares_generated",
            Some(&format!("{}-of-{}", config.threshold_k, config.total_n)),
        )?;

        Ok(ShareBundle {
            shares,
            k: config.threshold_k,
            n: config.total_n,
        })
    }

    /// Heir-mode unlock from combined shares. Only possible after the
    /// escalation machine reached `InheritanceTriggered`. The recovered
    /// master must match the stored verifier.
    pub fn unlock_with_shares(
        &self,
        shares: &[String],
        passphrase: Option<&str>,
    ) -> Result<()> {
        let config = self.storage.testament_config()?;
        if !config.heir_mode_active {
            return Err(CoreError::PreconditionFailed(
                "inheritance not triggered".to_string(),
            ));
        }
        let stored = self
            .storage
            .kdf_config()?
            .ok_or_else(|| CoreError::PreconditionFailed("setup not completed".to_string()))?;

        let secret = sharing::combine(shares, config.threshold_k, passphrase)?;
        let master = MasterKey::from_bytes(secret);
        self.session
            .unlock(master, &stored.verifier, SessionMode::Heir)?;
        self.storage.append_audit("heir_unlock", None)?;
        Ok(())
    }

    /// Owner re-unlock is the only deactivation path for heir mode
    pub fn deactivate_heir_mode(&self) -> Result<()> {
        if self.session.mode() != Some(SessionMode::Owner) {
            return Err(CoreError::AuthRequired);
        }
        self.storage.set_heir_mode(false)?;
        self.storage.append_audit("heir_mode_deactivated", None)?;
        Ok(())
    }

    pub fn upsert_heir(&self, heir: &Heir) -> Result<()> {
        self.session.require_writable()?;
        self.storage.upsert_heir(heir)?;
        self.storage.append_audit("heir_upserted", Some(&heir.id))
    }

    pub fn list_heirs(&self) -> Result<Vec<Heir>> {
        self.storage.list_heirs()
    }

    pub fn delete_heir(&self, id: &str) -> Result<()> {
        self.session.require_writable()?;
        self.storage.delete_heir(id)?;
        self.storage.append_audit("heir_deleted", Some(id))
    }
}

/// Convenience constructor for a new heir row
pub fn new_heir(name: &str, email: &str, phone: Option<String>) -> Heir {
    Heir {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        email: email.to_string(),
        phone,
        share_index: None,
        created_at: Utc::now(),
    }
}
