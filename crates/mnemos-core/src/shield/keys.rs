//! Key Hierarchy
//!
//! Argon2id(passphrase) → master key → three 32-byte sub-keys:
//! KEK for envelope data keys, SearchKey for blind-index tokens, FileKey for
//! vault data keys. The master key is stretched once and discarded; sub-keys
//! live only inside an unlocked session and are zeroed on lock.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::primitives::{self, KEY_LEN};
use crate::error::{CoreError, Result};

/// HKDF purpose label for the key-encryption key
pub const LABEL_KEK: &str = "kek";
/// HKDF purpose label for the blind-index key
pub const LABEL_SEARCH: &str = "search";
/// Purpose label for the vault file-recipient key. The label predates the
/// vault's current layout; changing it would orphan every wrapped file DEK.
pub const LABEL_FILE: &str = "git";

/// Domain-separation input for the stored verifier
pub const VERIFIER_CONTEXT: &[u8] = b"auth_check";

// ============================================================================
// MASTER KEY
// ============================================================================

/// The passphrase-derived master key. Held transiently: stretched into
/// sub-keys at unlock and dropped (wiping itself) immediately after.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Decode the client's base64 upload. Anything but 32 raw bytes is a
    /// malformed credential, not an internal fault.
    pub fn from_b64(encoded: &str) -> Result<Self> {
        let raw = B64
            .decode(encoded.trim())
            .map_err(|_| CoreError::BadPassphrase)?;
        let bytes: [u8; KEY_LEN] = raw.try_into().map_err(|_| CoreError::BadPassphrase)?;
        Ok(Self(bytes))
    }

    /// Derive the master key from a passphrase (client-side path and tests)
    pub fn derive(
        passphrase: &str,
        salt: &[u8; primitives::SALT_LEN],
        params: &primitives::KdfParams,
    ) -> Result<Self> {
        Ok(Self(primitives::derive_master_key(passphrase, salt, params)?))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// The stored verifier: HMAC(master, "auth_check")
    pub fn verifier(&self) -> [u8; 32] {
        primitives::keyed_hash(&self.0, VERIFIER_CONTEXT)
    }
}

// ============================================================================
// SUB-KEYS
// ============================================================================

/// The three session sub-keys. Wiped when the owning session locks.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SubKeys {
    kek: [u8; KEY_LEN],
    search: [u8; KEY_LEN],
    file: [u8; KEY_LEN],
}

impl SubKeys {
    /// Stretch a master key into the sub-key set
    pub fn derive(master: &MasterKey) -> Self {
        Self {
            kek: primitives::derive_subkey(master.as_bytes(), LABEL_KEK),
            search: primitives::derive_subkey(master.as_bytes(), LABEL_SEARCH),
            file: primitives::derive_subkey(master.as_bytes(), LABEL_FILE),
        }
    }

    /// Key-encryption key: wraps per-record data keys
    pub fn kek(&self) -> &[u8; KEY_LEN] {
        &self.kek
    }

    /// Blind-index key: deterministic search tokens
    pub fn search(&self) -> &[u8; KEY_LEN] {
        &self.search
    }

    /// File-recipient key: wraps vault data keys
    pub fn file(&self) -> &[u8; KEY_LEN] {
        &self.file
    }
}
