//! Connections, Tags, and Persons
//!
//! Connections are directional typed edges between memories with an encrypted
//! explanation. Tags and persons are shared entities; join rows carry
//! provenance. Deleting a memory cascades its edges; unlinking a tag or
//! person never deletes the entity.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::shield::Envelope;

// ============================================================================
// CONNECTIONS
// ============================================================================

/// Relationship kinds a connection can carry
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    #[default]
    Related,
    CausedBy,
    Contradicts,
    Supports,
    References,
    Extends,
    Summarizes,
}

impl RelationKind {
    pub const ALL: [RelationKind; 7] = [
        RelationKind::Related,
        RelationKind::CausedBy,
        RelationKind::Contradicts,
        RelationKind::Supports,
        RelationKind::References,
        RelationKind::Extends,
        RelationKind::Summarizes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Related => "related",
            RelationKind::CausedBy => "caused_by",
            RelationKind::Contradicts => "contradicts",
            RelationKind::Supports => "supports",
            RelationKind::References => "references",
            RelationKind::Extends => "extends",
            RelationKind::Summarizes => "summarizes",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }
}

/// Where a connection came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Authored or promoted by the owner
    User,
    /// Synthesized by a model; carries the model identifier
    Model(String),
    /// Recorded from vector similarity alone
    Similarity,
}

impl Provenance {
    pub fn as_string(&self) -> String {
        match self {
            Provenance::User => "user".to_string(),
            Provenance::Model(id) => format!("model:{id}"),
            Provenance::Similarity => "similarity".to_string(),
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "user" => Provenance::User,
            "similarity" => Provenance::Similarity,
            other => match other.strip_prefix("model:") {
                Some(id) => Provenance::Model(id.to_string()),
                None => Provenance::Similarity,
            },
        }
    }
}

/// A directional typed edge between two memories.
/// Invariants: no self-loops; strength in [0,1]; at most one
/// (source, target, kind) per provenance.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: i64,
    pub source_id: String,
    pub target_id: String,
    pub kind: RelationKind,
    pub strength: f64,
    pub provenance: Provenance,
    pub explanation_envelope: Option<Envelope>,
    pub user_promoted: bool,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// TAGS
// ============================================================================

/// A case-normalized label
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub color: String,
}

// ============================================================================
// PERSONS
// ============================================================================

/// Relationship of a person to the owner
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerRelationship {
    SelfOwner,
    Spouse,
    Child,
    Parent,
    Sibling,
    Grandparent,
    Grandchild,
    AuntUncle,
    Cousin,
    InLaw,
    Friend,
    Other,
}

impl OwnerRelationship {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerRelationship::SelfOwner => "self",
            OwnerRelationship::Spouse => "spouse",
            OwnerRelationship::Child => "child",
            OwnerRelationship::Parent => "parent",
            OwnerRelationship::Sibling => "sibling",
            OwnerRelationship::Grandparent => "grandparent",
            OwnerRelationship::Grandchild => "grandchild",
            OwnerRelationship::AuntUncle => "aunt_uncle",
            OwnerRelationship::Cousin => "cousin",
            OwnerRelationship::InLaw => "in_law",
            OwnerRelationship::Friend => "friend",
            OwnerRelationship::Other => "other",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "self" => Some(OwnerRelationship::SelfOwner),
            "spouse" => Some(OwnerRelationship::Spouse),
            "child" => Some(OwnerRelationship::Child),
            "parent" => Some(OwnerRelationship::Parent),
            "sibling" => Some(OwnerRelationship::Sibling),
            "grandparent" => Some(OwnerRelationship::Grandparent),
            "grandchild" => Some(OwnerRelationship::Grandchild),
            "aunt_uncle" => Some(OwnerRelationship::AuntUncle),
            "cousin" => Some(OwnerRelationship::Cousin),
            "in_law" => Some(OwnerRelationship::InLaw),
            "friend" => Some(OwnerRelationship::Friend),
            "other" => Some(OwnerRelationship::Other),
            _ => None,
        }
    }
}

/// A named entity memories can reference
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    pub id: String,
    pub display_name: String,
    pub name_envelope: Option<Envelope>,
    pub external_id: Option<String>,
    pub relationship: Option<OwnerRelationship>,
    pub deceased: bool,
    pub created_at: DateTime<Utc>,
}

impl Person {
    /// Fresh person with a time-ordered id
    pub fn new(display_name: &str) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            display_name: display_name.to_string(),
            name_envelope: None,
            external_id: None,
            relationship: None,
            deceased: false,
            created_at: chrono::Utc::now(),
        }
    }
}

/// How a memory-person link was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkProvenance {
    #[default]
    Manual,
    Import,
    Inference,
}

impl LinkProvenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkProvenance::Manual => "manual",
            LinkProvenance::Import => "import",
            LinkProvenance::Inference => "inference",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "import" => LinkProvenance::Import,
            "inference" => LinkProvenance::Inference,
            _ => LinkProvenance::Manual,
        }
    }
}

/// Join row: memory ↔ person, keyed by (memory, person, provenance)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryPerson {
    pub memory_id: String,
    pub person_id: String,
    pub provenance: LinkProvenance,
    pub confidence: Option<f64>,
}

// ============================================================================
// OWNER PROFILE
// ============================================================================

/// Singleton owner record. Linking `self_person_id` is the only path that
/// stamps a person's relationship as "self".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerProfile {
    pub display_name: String,
    pub birthdate: Option<NaiveDate>,
    pub bio: Option<String>,
    pub self_person_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_kind_round_trips() {
        for kind in RelationKind::ALL {
            assert_eq!(RelationKind::parse_name(kind.as_str()), Some(kind));
        }
        assert_eq!(RelationKind::parse_name("caused by"), None);
    }

    #[test]
    fn provenance_round_trips() {
        assert_eq!(Provenance::parse_name("user"), Provenance::User);
        assert_eq!(
            Provenance::parse_name("model:llama3.1:8b"),
            Provenance::Model("llama3.1:8b".to_string())
        );
        assert_eq!(
            Provenance::Model("llama3.1:8b".to_string()).as_string(),
            "model:llama3.1:8b"
        );
    }

    #[test]
    fn self_relationship_spelled_self() {
        assert_eq!(OwnerRelationship::SelfOwner.as_str(), "self");
        assert_eq!(
            OwnerRelationship::parse_name("self"),
            Some(OwnerRelationship::SelfOwner)
        );
    }
}
