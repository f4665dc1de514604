//! Envelope Encryption
//!
//! Every stored secret is an envelope: the plaintext sealed under a fresh
//! 256-bit data key (DEK), and the DEK sealed under a wrapping key (the
//! session KEK for records, the FileKey for vault manifests). Both layers
//! carry their nonce inline. The (algo, version) pair makes the layout
//! crypto-agile: a newer suite re-encrypts by copying plaintext once, and an
//! old envelope stays readable while its tag is still supported.

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::primitives::{self, KEY_LEN};
use crate::error::{CoreError, Result};

/// Current envelope layout version
pub const ENVELOPE_VERSION: u16 = 1;

/// Closed cipher-suite enumeration. Serialized tags are part of the stored
/// format; an unknown tag on read is rejected as `Internal`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlgoTag {
    #[serde(rename = "aes256-gcm")]
    Aes256Gcm,
}

impl AlgoTag {
    /// Suite used for new envelopes
    pub const CURRENT: AlgoTag = AlgoTag::Aes256Gcm;

    pub fn as_str(&self) -> &'static str {
        match self {
            AlgoTag::Aes256Gcm => "aes256-gcm",
        }
    }

    /// Wire byte for the vault file header
    pub fn wire_byte(&self) -> u8 {
        match self {
            AlgoTag::Aes256Gcm => 1,
        }
    }

    pub fn from_wire_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(AlgoTag::Aes256Gcm),
            other => Err(CoreError::internal(format!("unknown algo tag {other}"))),
        }
    }
}

mod b64 {
    //! Envelopes live in JSON columns; raw bytes ride as base64 strings.
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as B64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&B64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        B64.decode(s).map_err(serde::de::Error::custom)
    }
}

/// A sealed payload plus its wrapped data key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// nonce ‖ AEAD(plaintext) under the DEK
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    /// nonce ‖ AEAD(DEK) under the wrapping key
    #[serde(with = "b64")]
    pub wrapped_dek: Vec<u8>,
    pub algo: AlgoTag,
    pub version: u16,
}

impl Envelope {
    /// Encrypt `plaintext`: fresh DEK, fresh nonces at both layers.
    pub fn encrypt(wrapping_key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Self> {
        let mut dek = primitives::generate_dek();
        let ciphertext = primitives::seal(&dek, plaintext)?;
        let wrapped_dek = primitives::seal(wrapping_key, &dek)?;
        dek.zeroize();
        Ok(Self {
            ciphertext,
            wrapped_dek,
            algo: AlgoTag::CURRENT,
            version: ENVELOPE_VERSION,
        })
    }

    /// Unwrap the DEK and open the payload. Any failure at either layer,
    /// including a wrong wrapping key, is `TamperDetected`.
    pub fn decrypt(&self, wrapping_key: &[u8; KEY_LEN]) -> Result<Vec<u8>> {
        let mut dek_bytes = primitives::open(wrapping_key, &self.wrapped_dek)?;
        if dek_bytes.len() != KEY_LEN {
            dek_bytes.zeroize();
            return Err(CoreError::TamperDetected);
        }
        let mut dek = [0u8; KEY_LEN];
        dek.copy_from_slice(&dek_bytes);
        dek_bytes.zeroize();
        let plaintext = primitives::open(&dek, &self.ciphertext);
        dek.zeroize();
        plaintext
    }

    /// Unwrap only the DEK (the vault streams file bodies separately)
    pub fn unwrap_dek(&self, wrapping_key: &[u8; KEY_LEN]) -> Result<[u8; KEY_LEN]> {
        let mut dek_bytes = primitives::open(wrapping_key, &self.wrapped_dek)?;
        if dek_bytes.len() != KEY_LEN {
            dek_bytes.zeroize();
            return Err(CoreError::TamperDetected);
        }
        let mut dek = [0u8; KEY_LEN];
        dek.copy_from_slice(&dek_bytes);
        dek_bytes.zeroize();
        Ok(dek)
    }

    /// Wrap an externally-generated DEK without a payload (vault manifests
    /// keep the file DEK envelope separate from the file bytes).
    pub fn wrap_dek(wrapping_key: &[u8; KEY_LEN], dek: &[u8; KEY_LEN]) -> Result<Self> {
        Ok(Self {
            ciphertext: Vec::new(),
            wrapped_dek: primitives::seal(wrapping_key, dek)?,
            algo: AlgoTag::CURRENT,
            version: ENVELOPE_VERSION,
        })
    }

    /// Re-encrypt under a new wrapping key and the current suite.
    /// Plaintext is copied exactly once and wiped.
    pub fn reencrypt(
        &self,
        old_key: &[u8; KEY_LEN],
        new_key: &[u8; KEY_LEN],
    ) -> Result<Self> {
        let mut plaintext = self.decrypt(old_key)?;
        let fresh = Self::encrypt(new_key, &plaintext);
        plaintext.zeroize();
        fresh
    }

    /// Rewrap only the DEK (re-key path for vault files: bodies stay put)
    pub fn rewrap_dek(
        &self,
        old_key: &[u8; KEY_LEN],
        new_key: &[u8; KEY_LEN],
    ) -> Result<Self> {
        let mut dek = self.unwrap_dek(old_key)?;
        let wrapped_dek = primitives::seal(new_key, &dek)?;
        dek.zeroize();
        Ok(Self {
            ciphertext: self.ciphertext.clone(),
            wrapped_dek,
            algo: self.algo,
            version: self.version,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a stored envelope. Unknown algo tags fail here as `Internal`.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| CoreError::internal(format!("envelope parse: {e}")))
    }
}
