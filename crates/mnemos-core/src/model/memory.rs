//! Memory and Source - the atoms of the store
//!
//! A Memory owns three field envelopes (title, content, metadata), its blind
//! tokens, and at most one Source (the original file in the vault). Plaintext
//! never persists; the integrity hash is computed on plaintext before
//! encryption and re-verified on decrypt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::shield::Envelope;

// ============================================================================
// ENUMS
// ============================================================================

/// What kind of thing a memory captures
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Photo,
    Voice,
    Video,
    Document,
    Email,
    Webpage,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Photo => "photo",
            ContentType::Voice => "voice",
            ContentType::Video => "video",
            ContentType::Document => "document",
            ContentType::Email => "email",
            ContentType::Webpage => "webpage",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "photo" => ContentType::Photo,
            "voice" => ContentType::Voice,
            "video" => ContentType::Video,
            "document" => ContentType::Document,
            "email" => ContentType::Email,
            "webpage" => ContentType::Webpage,
            _ => ContentType::Text,
        }
    }

    /// Classify from a declared MIME at the ingest boundary
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.to_ascii_lowercase();
        if mime.starts_with("image/") {
            ContentType::Photo
        } else if mime.starts_with("audio/") {
            ContentType::Voice
        } else if mime.starts_with("video/") {
            ContentType::Video
        } else if mime == "text/html" {
            ContentType::Webpage
        } else if mime == "message/rfc822" {
            ContentType::Email
        } else if mime.starts_with("text/") {
            ContentType::Text
        } else {
            ContentType::Document
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a memory entered the system
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceClass {
    #[default]
    Manual,
    Import,
    Email,
    Browser,
    Api,
    Voice,
}

impl SourceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceClass::Manual => "manual",
            SourceClass::Import => "import",
            SourceClass::Email => "email",
            SourceClass::Browser => "browser",
            SourceClass::Api => "api",
            SourceClass::Voice => "voice",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "import" => SourceClass::Import,
            "email" => SourceClass::Email,
            "browser" => SourceClass::Browser,
            "api" => SourceClass::Api,
            "voice" => SourceClass::Voice,
            _ => SourceClass::Manual,
        }
    }
}

/// Visibility of a memory in list/search surfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    #[default]
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "public" => Visibility::Public,
            _ => Visibility::Private,
        }
    }
}

// ============================================================================
// MEMORY
// ============================================================================

/// A memory row. Envelope fields are `None` until the corresponding plaintext
/// was captured; each field swaps atomically with its envelope on update.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    /// UUIDv7: stable and time-ordered
    pub id: String,
    /// When the thing happened
    pub captured_at: DateTime<Utc>,
    /// When it entered the system
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub content_type: ContentType,
    pub source_class: SourceClass,
    pub title_envelope: Option<Envelope>,
    pub content_envelope: Option<Envelope>,
    pub metadata_envelope: Option<Envelope>,
    /// blake3 hex of the plaintext content, computed pre-encryption
    pub integrity_hash: String,
    pub parent_id: Option<String>,
    pub source_id: Option<String>,
    pub visibility: Visibility,
    /// Whether the metadata envelope carries both coordinates. Stored in the
    /// clear so geo filters can narrow without decrypting every row.
    pub has_location: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Memory {
    /// Fresh memory shell with a time-ordered id
    pub fn new(content_type: ContentType, source_class: SourceClass) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            captured_at: now,
            created_at: now,
            updated_at: now,
            content_type,
            source_class,
            title_envelope: None,
            content_envelope: None,
            metadata_envelope: None,
            integrity_hash: String::new(),
            parent_id: None,
            source_id: None,
            visibility: Visibility::Private,
            has_location: false,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Plaintext metadata carried inside the metadata envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryMetadata {
    #[serde(default)]
    pub tags: Vec<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub place_name: Option<String>,
}

impl MemoryMetadata {
    pub fn has_coordinates(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

// ============================================================================
// SOURCE
// ============================================================================

/// Manifest row for an original file in the vault
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: String,
    pub memory_id: String,
    /// Date-partitioned relative path of the served (archival) rendition
    pub vault_path: String,
    /// Original rendition, kept alongside when conversion changed the bytes
    pub original_vault_path: Option<String>,
    pub original_size: i64,
    pub encrypted_size: i64,
    pub mime: String,
    /// Archival preservation tag ("png", "flac", ...)
    pub preservation_format: String,
    /// blake3 hex of the original plaintext, pre-conversion
    pub integrity_hash: String,
    /// blake3 hex of the archival rendition's ciphertext (audit)
    pub cipher_digest: String,
    pub original_cipher_digest: Option<String>,
    /// Encrypted original filename
    pub filename_envelope: Option<Envelope>,
    /// The file DEK wrapped by the FileKey; kept in the manifest so re-key
    /// rewraps rows without rewriting file bodies
    pub dek_envelope: Envelope,
    /// Whether the archival rendition is served by default
    pub serve_archival: bool,
    pub created_at: DateTime<Utc>,
}

/// A blind-index token row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchToken {
    pub memory_id: String,
    pub token_type: crate::shield::TokenType,
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_from_mime() {
        assert_eq!(ContentType::from_mime("image/jpeg"), ContentType::Photo);
        assert_eq!(ContentType::from_mime("audio/mpeg"), ContentType::Voice);
        assert_eq!(ContentType::from_mime("text/html"), ContentType::Webpage);
        assert_eq!(ContentType::from_mime("application/pdf"), ContentType::Document);
        assert_eq!(ContentType::from_mime("text/plain"), ContentType::Text);
    }

    #[test]
    fn memory_ids_are_time_ordered() {
        let a = Memory::new(ContentType::Text, SourceClass::Manual);
        let b = Memory::new(ContentType::Text, SourceClass::Manual);
        assert!(a.id < b.id);
    }

    #[test]
    fn metadata_coordinates() {
        let mut m = MemoryMetadata::default();
        assert!(!m.has_coordinates());
        m.latitude = Some(48.8566);
        assert!(!m.has_coordinates());
        m.longitude = Some(2.3522);
        assert!(m.has_coordinates());
    }
}
