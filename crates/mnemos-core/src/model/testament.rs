//! Testament and Heartbeat records
//!
//! The escalation ladder, check-in and alert rows, the singleton testament
//! configuration, heirs, the append-only audit log, and background loop state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// ESCALATION LADDER
// ============================================================================

/// Liveness state, ordered: comparisons follow escalation order
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    #[default]
    Fresh,
    Reminded,
    UrgentReminder,
    EmergencyContactAlerted,
    KeyholdersAlerted,
    InheritanceTriggered,
}

impl AlertLevel {
    /// Ladder in escalation order, Fresh excluded
    pub const ESCALATIONS: [AlertLevel; 5] = [
        AlertLevel::Reminded,
        AlertLevel::UrgentReminder,
        AlertLevel::EmergencyContactAlerted,
        AlertLevel::KeyholdersAlerted,
        AlertLevel::InheritanceTriggered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Fresh => "fresh",
            AlertLevel::Reminded => "reminder",
            AlertLevel::UrgentReminder => "urgent_reminder",
            AlertLevel::EmergencyContactAlerted => "emergency_contact_alert",
            AlertLevel::KeyholdersAlerted => "keyholder_alert",
            AlertLevel::InheritanceTriggered => "inheritance_trigger",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "reminder" => AlertLevel::Reminded,
            "urgent_reminder" => AlertLevel::UrgentReminder,
            "emergency_contact_alert" => AlertLevel::EmergencyContactAlerted,
            "keyholder_alert" => AlertLevel::KeyholdersAlerted,
            "inheritance_trigger" => AlertLevel::InheritanceTriggered,
            _ => AlertLevel::Fresh,
        }
    }
}

/// An issued liveness challenge awaiting its HMAC response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatChallenge {
    /// Hex of the random 32-byte challenge
    pub challenge: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A verified check-in
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatCheckin {
    pub id: i64,
    pub at: DateTime<Utc>,
}

/// A dispatched escalation notification. Idempotent on its key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAlert {
    pub id: i64,
    pub level: AlertLevel,
    /// "(level):(trigger-day)", the unique key making the daily tick safe
    pub idempotency_key: String,
    pub dispatched_at: DateTime<Utc>,
    pub detail: Option<String>,
}

// ============================================================================
// TESTAMENT
// ============================================================================

/// Singleton share-scheme configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestamentConfig {
    pub threshold_k: u8,
    pub total_n: u8,
    pub shares_generated: bool,
    pub heir_mode_active: bool,
}

impl Default for TestamentConfig {
    fn default() -> Self {
        Self {
            threshold_k: 3,
            total_n: 5,
            shares_generated: false,
            heir_mode_active: false,
        }
    }
}

/// Someone holding a share
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heir {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    /// Which share this heir was handed, once generated
    pub share_index: Option<u8>,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit row; proves heir activity after inheritance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: String,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

// ============================================================================
// BACKGROUND LOOPS
// ============================================================================

/// Persisted state of one named background loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopState {
    pub name: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub enabled: bool,
    pub consecutive_failures: u32,
}
