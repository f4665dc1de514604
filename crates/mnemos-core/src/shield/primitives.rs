//! Crypto Primitives
//!
//! The four primitives everything above builds on:
//! - AES-256-GCM authenticated encryption (256-bit key, 96-bit nonce)
//! - HKDF-SHA256 sub-key derivation with purpose labels
//! - Argon2id memory-hard passphrase KDF with persisted parameters
//! - HMAC-SHA256 keyed hashing with constant-time comparison
//!
//! Any AEAD failure surfaces as `TamperDetected`; no primitive here retries.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{CoreError, Result};

/// Symmetric key length in bytes
pub const KEY_LEN: usize = 32;
/// AEAD nonce length in bytes
pub const NONCE_LEN: usize = 12;
/// Passphrase salt length in bytes
pub const SALT_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

// ============================================================================
// PASSPHRASE KDF
// ============================================================================

/// Argon2id parameters, persisted alongside the salt and verifier so the
/// client can re-derive the same master key across upgrades.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    pub time_cost: u32,
    pub memory_kib: u32,
    pub parallelism: u32,
    pub output_len: usize,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            time_cost: 3,
            memory_kib: 64 * 1024,
            parallelism: 1,
            output_len: KEY_LEN,
        }
    }
}

/// Derive a 32-byte master key from a passphrase with Argon2id
pub fn derive_master_key(
    passphrase: &str,
    salt: &[u8; SALT_LEN],
    params: &KdfParams,
) -> Result<[u8; KEY_LEN]> {
    let argon_params = argon2::Params::new(
        params.memory_kib,
        params.time_cost,
        params.parallelism,
        Some(params.output_len),
    )
    .map_err(CoreError::internal)?;
    let argon = argon2::Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon_params,
    );

    let mut out = [0u8; KEY_LEN];
    argon
        .hash_password_into(passphrase.as_bytes(), salt, &mut out)
        .map_err(CoreError::internal)?;
    Ok(out)
}

/// Fresh random passphrase salt
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

// ============================================================================
// SUB-KEY DERIVATION
// ============================================================================

/// HKDF-SHA256 expand of `master` under a purpose label.
/// A fixed label always yields the same sub-key for a fixed master.
pub fn derive_subkey(master: &[u8; KEY_LEN], label: &str) -> [u8; KEY_LEN] {
    let hk = Hkdf::<Sha256>::new(None, master);
    let mut okm = [0u8; KEY_LEN];
    // Label lengths are far below the RFC 5869 output cap; expand cannot fail.
    hk.expand(label.as_bytes(), &mut okm)
        .expect("hkdf expand with 32-byte output");
    okm
}

// ============================================================================
// KEYED HASH
// ============================================================================

/// HMAC-SHA256 of `data` under `key`
pub fn keyed_hash(key: &[u8; KEY_LEN], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("hmac accepts 32-byte keys");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time equality on byte strings
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

// ============================================================================
// AUTHENTICATED ENCRYPTION
// ============================================================================

/// Encrypt `plaintext` under `key` with a fresh nonce; output is nonce ‖ ct.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CoreError::internal("aead encrypt"))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Reverse of [`seal`]. Any authentication failure is `TamperDetected`.
pub fn open(key: &[u8; KEY_LEN], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + 16 {
        return Err(CoreError::TamperDetected);
    }
    let (nonce, ct) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ct)
        .map_err(|_| CoreError::TamperDetected)
}

/// Fresh random 256-bit data key
pub fn generate_dek() -> [u8; KEY_LEN] {
    let mut dek = [0u8; KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut dek);
    dek
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_params() -> KdfParams {
        // Small memory so the test suite stays fast; production default is 64 MiB
        KdfParams {
            time_cost: 1,
            memory_kib: 8 * 1024,
            parallelism: 1,
            output_len: KEY_LEN,
        }
    }

    #[test]
    fn seal_open_round_trip() {
        let key = generate_dek();
        let sealed = seal(&key, b"ate pain au chocolat near the Seine").unwrap();
        let opened = open(&key, &sealed).unwrap();
        assert_eq!(opened, b"ate pain au chocolat near the Seine");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = generate_dek();
        let mut sealed = seal(&key, b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(open(&key, &sealed), Err(CoreError::TamperDetected)));
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = seal(&generate_dek(), b"secret").unwrap();
        assert!(matches!(
            open(&generate_dek(), &sealed),
            Err(CoreError::TamperDetected)
        ));
    }

    #[test]
    fn truncated_input_fails_cleanly() {
        let key = generate_dek();
        assert!(matches!(open(&key, &[0u8; 5]), Err(CoreError::TamperDetected)));
    }

    #[test]
    fn nonces_are_fresh() {
        let key = generate_dek();
        let a = seal(&key, b"x").unwrap();
        let b = seal(&key, b"x").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn master_key_is_deterministic() {
        let salt = [7u8; SALT_LEN];
        let params = test_params();
        let a = derive_master_key("correct horse battery staple", &salt, &params).unwrap();
        let b = derive_master_key("correct horse battery staple", &salt, &params).unwrap();
        assert_eq!(a, b);
        let c = derive_master_key("correct horse battery stable", &salt, &params).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn subkeys_differ_by_label() {
        let master = [9u8; KEY_LEN];
        assert_ne!(derive_subkey(&master, "kek"), derive_subkey(&master, "search"));
        assert_eq!(derive_subkey(&master, "kek"), derive_subkey(&master, "kek"));
    }

    #[test]
    fn keyed_hash_constant_time_eq() {
        let key = [1u8; KEY_LEN];
        let a = keyed_hash(&key, b"auth_check");
        let b = keyed_hash(&key, b"auth_check");
        assert!(ct_eq(&a, &b));
        assert!(!ct_eq(&a, &keyed_hash(&key, b"auth-check")));
    }
}
