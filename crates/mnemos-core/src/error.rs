//! Core Error Types
//!
//! One error enum for the whole engine, ordered by the precedence the
//! HTTP boundary maps to status codes. User-facing messages stay generic;
//! detail rides in the variant payload and goes to the server log.

use std::fmt;

/// Core result type
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the core, by ordered precedence
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Unauthenticated access to an authenticated resource
    #[error("authentication required")]
    AuthRequired,
    /// Session present but keys not in memory
    #[error("session is locked")]
    SessionLocked,
    /// Verifier mismatch on unlock
    #[error("invalid passphrase")]
    BadPassphrase,
    /// Authenticated-decryption failure in the envelope or file layer.
    /// Fatal to the operation, non-fatal to the process. Never retried.
    #[error("integrity check failed")]
    TamperDetected,
    /// Referenced id does not exist (or is soft-deleted without opt-in)
    #[error("{0} not found")]
    NotFound(String),
    /// Idempotency violation: duplicate unique key or terminal-state transition
    #[error("conflict: {0}")]
    Conflict(String),
    /// Inconsistent partial update
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    /// External transducer errored or timed out
    #[error("conversion failed: {0}")]
    ConversionFailed(String),
    /// Embedding or LLM endpoint unreachable after retries
    #[error("model endpoint unavailable: {0}")]
    ModelUnavailable(String),
    /// Query embedded with a different model than the indexed chunks
    #[error("embedding model mismatch: index has '{indexed}', query used '{queried}'")]
    ModelMismatch { indexed: String, queried: String },
    /// Below-threshold share combination
    #[error("insufficient shares: need {needed}, got {got}")]
    InsufficientShares { needed: u8, got: usize },
    /// Oversized payload or too-many-pending backpressure
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    /// Catch-all. Display never exposes the detail; `{:?}` carries it for logs.
    #[error("internal error")]
    Internal(InternalDetail),
}

/// Opaque wrapper so `Display` on `CoreError::Internal` stays generic
/// while `Debug` keeps the diagnostic string for the server log.
pub struct InternalDetail(pub String);

impl fmt::Debug for InternalDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl CoreError {
    /// Build an `Internal` error from any displayable detail
    pub fn internal(detail: impl fmt::Display) -> Self {
        CoreError::Internal(InternalDetail(detail.to_string()))
    }

    /// True when retrying the same operation could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::ModelUnavailable(_))
    }
}

// SQLite unique-key collisions are idempotency violations, not server faults.
impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(err, ref msg) = e {
            if err.code == rusqlite::ErrorCode::ConstraintViolation {
                return CoreError::Conflict(
                    msg.clone().unwrap_or_else(|| "unique constraint".to_string()),
                );
            }
        }
        CoreError::internal(e)
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::internal(format!("io: {e}"))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::internal(format!("json: {e}"))
    }
}
