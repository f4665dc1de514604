//! Encrypted File Store
//!
//! Content-addressed on-disk layout: `YYYY/MM/<uuid>.enc` under the vault
//! root, each file a small header (magic, layout version, algorithm tag)
//! followed by the AEAD body. The file DEK lives wrapped in the manifest row,
//! not in the file, so re-key rewraps database rows without touching bodies.
//! Writes go through a temp file and an atomic rename; a crash mid-ingest
//! leaves at most an orphan the audit reclaims.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};
use tempfile::NamedTempFile;

use crate::error::{CoreError, Result};
use crate::shield::primitives::{self, KEY_LEN};
use crate::shield::{AlgoTag, Envelope};

/// Vault file magic
pub const VAULT_MAGIC: [u8; 4] = *b"MNV\0";
/// Vault file layout version
pub const VAULT_VERSION: u16 = 1;
/// magic(4) + version(2) + algo(1)
const HEADER_LEN: usize = 7;

/// A stored blob: its relative path plus audit material
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub rel_path: String,
    pub encrypted_size: u64,
    /// blake3 hex of the complete on-disk bytes (header included)
    pub cipher_digest: String,
}

/// The encrypted file store rooted at a configured path
pub struct Vault {
    root: PathBuf,
}

impl Vault {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            let _ = std::fs::set_permissions(&root, perms);
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn absolute(&self, rel_path: &str) -> Result<PathBuf> {
        // The manifest only ever holds date-partitioned relative paths;
        // anything else is a corrupted row, not a user error.
        if rel_path.contains("..") || rel_path.starts_with('/') {
            return Err(CoreError::internal(format!("bad vault path {rel_path}")));
        }
        Ok(self.root.join(rel_path))
    }

    /// Encrypt and store `plaintext` under `dek`, partitioned by `when`.
    /// Returns the relative path and the ciphertext digest for the manifest.
    pub fn store(
        &self,
        dek: &[u8; KEY_LEN],
        plaintext: &[u8],
        when: DateTime<Utc>,
    ) -> Result<StoredBlob> {
        let rel_dir = format!("{:04}/{:02}", when.year(), when.month());
        let dir = self.root.join(&rel_dir);
        std::fs::create_dir_all(&dir)?;

        let rel_path = format!("{rel_dir}/{}.enc", uuid::Uuid::new_v4());
        let final_path = self.root.join(&rel_path);

        let body = primitives::seal(dek, plaintext)?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
        bytes.extend_from_slice(&VAULT_MAGIC);
        bytes.extend_from_slice(&VAULT_VERSION.to_be_bytes());
        bytes.push(AlgoTag::CURRENT.wire_byte());
        bytes.extend_from_slice(&body);

        let mut temp = NamedTempFile::new_in(&dir)?;
        temp.write_all(&bytes)?;
        temp.as_file_mut().sync_all()?;
        temp.persist(&final_path)
            .map_err(|e| CoreError::internal(format!("vault persist: {e}")))?;

        Ok(StoredBlob {
            rel_path,
            encrypted_size: bytes.len() as u64,
            cipher_digest: blake3::hash(&bytes).to_hex().to_string(),
        })
    }

    /// Decrypt a stored blob. Header mismatches and AEAD failures are
    /// `TamperDetected`; a missing file is `NotFound`.
    pub fn retrieve(&self, dek: &[u8; KEY_LEN], rel_path: &str) -> Result<Vec<u8>> {
        let path = self.absolute(rel_path)?;
        let bytes = std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CoreError::NotFound(format!("vault file {rel_path}")),
            _ => CoreError::from(e),
        })?;
        if bytes.len() < HEADER_LEN || bytes[..4] != VAULT_MAGIC {
            return Err(CoreError::TamperDetected);
        }
        let version = u16::from_be_bytes([bytes[4], bytes[5]]);
        if version != VAULT_VERSION {
            return Err(CoreError::internal(format!(
                "unsupported vault layout v{version}"
            )));
        }
        // The embedded tag lets the outer wrapper upgrade independently
        AlgoTag::from_wire_byte(bytes[6])?;
        primitives::open(dek, &bytes[HEADER_LEN..])
    }

    /// Write the sibling metadata envelope (encrypted original filename etc.)
    pub fn write_meta(&self, rel_path: &str, envelope: &Envelope) -> Result<()> {
        let path = self.absolute(&meta_path(rel_path))?;
        let mut temp = NamedTempFile::new_in(path.parent().unwrap_or(&self.root))?;
        temp.write_all(envelope.to_json()?.as_bytes())?;
        temp.persist(&path)
            .map_err(|e| CoreError::internal(format!("vault persist: {e}")))?;
        Ok(())
    }

    pub fn read_meta(&self, rel_path: &str) -> Result<Option<Envelope>> {
        let path = self.absolute(&meta_path(rel_path))?;
        match std::fs::read_to_string(&path) {
            Ok(json) => Ok(Some(Envelope::from_json(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a blob and its sibling metadata; missing files are fine
    pub fn remove(&self, rel_path: &str) -> Result<()> {
        for target in [rel_path.to_string(), meta_path(rel_path)] {
            match std::fs::remove_file(self.absolute(&target)?) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn exists(&self, rel_path: &str) -> bool {
        self.absolute(rel_path).map(|p| p.exists()).unwrap_or(false)
    }

    /// blake3 hex of the on-disk ciphertext (audit)
    pub fn cipher_digest(&self, rel_path: &str) -> Result<String> {
        let bytes = std::fs::read(self.absolute(rel_path)?)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }

    /// Every `.enc` relative path under the root (audit's filesystem side)
    pub fn walk(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().is_some_and(|ext| ext == "enc") {
                    if let Ok(rel) = path.strip_prefix(&self.root) {
                        out.push(rel.to_string_lossy().replace('\\', "/"));
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

fn meta_path(rel_path: &str) -> String {
    match rel_path.strip_suffix(".enc") {
        Some(stem) => format!("{stem}.meta"),
        None => format!("{rel_path}.meta"),
    }
}
