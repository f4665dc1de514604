//! Process-Wide Configuration
//!
//! Every tunable has a default; nothing embeds a secret at build time.
//! Values come from the environment (a `.env` file is honored in dev via
//! dotenvy). Names are prefixed `MNEMOS_`.

use std::path::PathBuf;
use std::time::Duration;

/// Endpoint + model identifier for an external inference service
#[derive(Debug, Clone)]
pub struct ModelEndpoint {
    pub url: String,
    pub model: String,
}

/// Embedding service configuration
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub primary: ModelEndpoint,
    /// Secondary provider tried when the primary fails permanently
    pub fallback: Option<ModelEndpoint>,
    /// Output dimension D, declared at collection creation
    pub dimension: usize,
}

/// Vector collection configuration
#[derive(Debug, Clone)]
pub struct VectorConfig {
    /// External collection service; None selects the in-process store
    pub url: Option<String>,
    pub collection: String,
}

/// Heartbeat escalation ladder, in days since last check-in
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval_days: i64,
    pub remind_days: i64,
    pub urgent_days: i64,
    pub emergency_contact_days: i64,
    pub keyholder_days: i64,
    pub inheritance_days: i64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_days: 30,
            remind_days: 30,
            urgent_days: 45,
            emergency_contact_days: 60,
            keyholder_days: 75,
            inheritance_days: 90,
        }
    }
}

/// External conversion tool commands. Each is a template with `{input}` and
/// `{output}` placeholders, split on whitespace before exec.
#[derive(Debug, Clone)]
pub struct ConversionConfig {
    pub image_tool: String,
    pub audio_tool: String,
    pub video_tool: String,
    pub document_tool: String,
    /// Plain-text extraction from the archival document rendition
    pub extract_tool: String,
    pub timeout: Duration,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            image_tool: "magick {input} {output}".to_string(),
            audio_tool: "ffmpeg -y -i {input} -c:a flac {output}".to_string(),
            video_tool: "ffmpeg -y -i {input} -c:v ffv1 -c:a flac {output}".to_string(),
            document_tool: "pandoc {input} -o {output}".to_string(),
            extract_tool: "pdftotext {input} {output}".to_string(),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Process-wide configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address
    pub bind_addr: String,
    /// SQLite database file; None picks the platform data dir
    pub database_path: Option<PathBuf>,
    /// Vault root directory
    pub vault_root: PathBuf,
    /// Argon2id memory ceiling in KiB
    pub kdf_memory_kib: u32,
    /// Minutes of inactivity before the session auto-locks
    pub session_idle_minutes: i64,
    /// Access token lifetime in minutes
    pub access_token_minutes: i64,
    /// Refresh token lifetime in days
    pub refresh_token_days: i64,
    pub embedding: EmbeddingConfig,
    pub llm: ModelEndpoint,
    pub vector: VectorConfig,
    pub heartbeat: HeartbeatConfig,
    pub conversion: ConversionConfig,
    /// Destination for heartbeat alert mail
    pub alert_email: Option<String>,
    pub smtp_host: Option<String>,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
    /// Backup repository endpoints (consumed by ops tooling)
    pub backup_endpoints: Vec<String>,
    /// UI-facing request budget
    pub request_budget: Duration,
    /// Ingest payload cap in bytes
    pub max_payload_bytes: usize,
    /// Backpressure: pending background jobs before QuotaExceeded
    pub max_pending_jobs: usize,
    /// Consecutive failures before a background loop auto-disables
    pub loop_failure_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            database_path: None,
            vault_root: PathBuf::from("vault"),
            kdf_memory_kib: 64 * 1024,
            session_idle_minutes: 15,
            access_token_minutes: 30,
            refresh_token_days: 14,
            embedding: EmbeddingConfig {
                primary: ModelEndpoint {
                    url: "http://127.0.0.1:11434/api/embed".to_string(),
                    model: "nomic-embed-text".to_string(),
                },
                fallback: None,
                dimension: 768,
            },
            llm: ModelEndpoint {
                url: "http://127.0.0.1:11434/api/chat".to_string(),
                model: "llama3.1:8b".to_string(),
            },
            vector: VectorConfig {
                url: None,
                collection: "mnemos_chunks".to_string(),
            },
            heartbeat: HeartbeatConfig::default(),
            conversion: ConversionConfig::default(),
            alert_email: None,
            smtp_host: None,
            smtp_user: None,
            smtp_password: None,
            backup_endpoints: Vec::new(),
            request_budget: Duration::from_secs(30),
            max_payload_bytes: 256 * 1024 * 1024,
            max_pending_jobs: 1024,
            loop_failure_limit: 5,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_var(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load configuration from the environment, falling back to defaults
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let d = Config::default();

        let embedding = EmbeddingConfig {
            primary: ModelEndpoint {
                url: env_var("MNEMOS_EMBED_URL").unwrap_or(d.embedding.primary.url),
                model: env_var("MNEMOS_EMBED_MODEL").unwrap_or(d.embedding.primary.model),
            },
            fallback: env_var("MNEMOS_EMBED_FALLBACK_URL").map(|url| ModelEndpoint {
                url,
                model: env_var("MNEMOS_EMBED_FALLBACK_MODEL")
                    .unwrap_or_else(|| "all-minilm".to_string()),
            }),
            dimension: env_parse("MNEMOS_EMBED_DIM", d.embedding.dimension),
        };

        Self {
            bind_addr: env_var("MNEMOS_BIND").unwrap_or(d.bind_addr),
            database_path: env_var("MNEMOS_DB_PATH").map(PathBuf::from),
            vault_root: env_var("MNEMOS_VAULT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(d.vault_root),
            kdf_memory_kib: env_parse("MNEMOS_KDF_MEMORY_KIB", d.kdf_memory_kib),
            session_idle_minutes: env_parse("MNEMOS_SESSION_IDLE_MIN", d.session_idle_minutes),
            access_token_minutes: env_parse("MNEMOS_ACCESS_TOKEN_MIN", d.access_token_minutes),
            refresh_token_days: env_parse("MNEMOS_REFRESH_TOKEN_DAYS", d.refresh_token_days),
            embedding,
            llm: ModelEndpoint {
                url: env_var("MNEMOS_LLM_URL").unwrap_or(d.llm.url),
                model: env_var("MNEMOS_LLM_MODEL").unwrap_or(d.llm.model),
            },
            vector: VectorConfig {
                url: env_var("MNEMOS_VECTOR_URL"),
                collection: env_var("MNEMOS_VECTOR_COLLECTION").unwrap_or(d.vector.collection),
            },
            heartbeat: HeartbeatConfig {
                interval_days: env_parse("MNEMOS_HEARTBEAT_INTERVAL_DAYS", 30),
                remind_days: env_parse("MNEMOS_HEARTBEAT_REMIND_DAYS", 30),
                urgent_days: env_parse("MNEMOS_HEARTBEAT_URGENT_DAYS", 45),
                emergency_contact_days: env_parse("MNEMOS_HEARTBEAT_EMERGENCY_DAYS", 60),
                keyholder_days: env_parse("MNEMOS_HEARTBEAT_KEYHOLDER_DAYS", 75),
                inheritance_days: env_parse("MNEMOS_HEARTBEAT_INHERITANCE_DAYS", 90),
            },
            conversion: ConversionConfig {
                image_tool: env_var("MNEMOS_IMAGE_TOOL").unwrap_or(d.conversion.image_tool),
                audio_tool: env_var("MNEMOS_AUDIO_TOOL").unwrap_or(d.conversion.audio_tool),
                video_tool: env_var("MNEMOS_VIDEO_TOOL").unwrap_or(d.conversion.video_tool),
                document_tool: env_var("MNEMOS_DOCUMENT_TOOL")
                    .unwrap_or(d.conversion.document_tool),
                extract_tool: env_var("MNEMOS_EXTRACT_TOOL").unwrap_or(d.conversion.extract_tool),
                timeout: Duration::from_secs(env_parse("MNEMOS_CONVERT_TIMEOUT_SECS", 300)),
            },
            alert_email: env_var("MNEMOS_ALERT_EMAIL"),
            smtp_host: env_var("MNEMOS_SMTP_HOST"),
            smtp_user: env_var("MNEMOS_SMTP_USER"),
            smtp_password: env_var("MNEMOS_SMTP_PASSWORD"),
            backup_endpoints: env_var("MNEMOS_BACKUP_ENDPOINTS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            request_budget: Duration::from_secs(env_parse("MNEMOS_REQUEST_BUDGET_SECS", 30)),
            max_payload_bytes: env_parse("MNEMOS_MAX_PAYLOAD_BYTES", d.max_payload_bytes),
            max_pending_jobs: env_parse("MNEMOS_MAX_PENDING_JOBS", d.max_pending_jobs),
            loop_failure_limit: env_parse("MNEMOS_LOOP_FAILURE_LIMIT", d.loop_failure_limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let c = Config::default();
        assert_eq!(c.session_idle_minutes, 15);
        assert_eq!(c.heartbeat.inheritance_days, 90);
        assert_eq!(c.embedding.dimension, 768);
        assert!(c.vector.url.is_none());
    }

    #[test]
    fn heartbeat_ladder_is_ordered() {
        let h = HeartbeatConfig::default();
        assert!(h.remind_days < h.urgent_days);
        assert!(h.urgent_days < h.emergency_contact_days);
        assert!(h.emergency_contact_days < h.keyholder_days);
        assert!(h.keyholder_days < h.inheritance_days);
    }
}
