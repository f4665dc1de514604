//! Suggestions and Conversations
//!
//! Suggestions are pending AI-proposed actions with an encrypted payload and
//! irreversible terminal transitions. Conversations hold the RAG chat
//! threads; messages carry the memory ids the retriever cited.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::shield::Envelope;

// ============================================================================
// SUGGESTIONS
// ============================================================================

/// Lifecycle of a suggestion. Accepted and Dismissed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionStatus {
    #[default]
    Pending,
    Accepted,
    Dismissed,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Accepted => "accepted",
            SuggestionStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "accepted" => SuggestionStatus::Accepted,
            "dismissed" => SuggestionStatus::Dismissed,
            _ => SuggestionStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SuggestionStatus::Pending)
    }
}

/// A pending AI-proposed action (suggested tag, enrichment prompt, ...)
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub id: i64,
    /// What the payload proposes ("tag", "enrichment", ...)
    pub kind: String,
    pub memory_id: Option<String>,
    pub payload_envelope: Envelope,
    pub status: SuggestionStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

// ============================================================================
// CONVERSATIONS
// ============================================================================

/// Role of a chat message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "assistant" => MessageRole::Assistant,
            _ => MessageRole::User,
        }
    }
}

/// A chat thread with an AI-generated short title
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An ordered, role-tagged message with its retrieval citations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: i64,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content_envelope: Envelope,
    /// Memory ids cited by the RAG retriever for this message
    pub cited_memory_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!SuggestionStatus::Pending.is_terminal());
        assert!(SuggestionStatus::Accepted.is_terminal());
        assert!(SuggestionStatus::Dismissed.is_terminal());
    }
}
