//! Blind-Index Tokenizer
//!
//! Maps plaintext terms to deterministic HMAC tokens the server can match by
//! equality without ever seeing the term. For a fixed SearchKey and token
//! type, `token(term)` is a pure function of the normalized term; rotating
//! the key invalidates every stored token.
//!
//! Normalization: Unicode NFC, lowercase, trim, collapse internal whitespace.
//! Titles and bodies tokenize into unigrams (plus bigrams for proximity)
//! behind a stop list and a minimum length of 2; tags, persons, locations,
//! and captured-date components tokenize whole.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use super::primitives::{KEY_LEN, keyed_hash};

/// Minimum normalized term length for text unigrams
pub const MIN_TOKEN_LEN: usize = 2;

/// Terms too common to be worth indexing
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "had",
    "has", "have", "he", "her", "his", "i", "in", "is", "it", "its", "my", "of",
    "on", "or", "our", "she", "that", "the", "their", "them", "they", "this",
    "to", "was", "we", "were", "with", "you", "your",
];

/// Scope a token is generated under; the type participates in the HMAC so
/// the same word indexed as a tag and as body text never collides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Title,
    Body,
    Tag,
    Person,
    Location,
    Date,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Title => "title",
            TokenType::Body => "body",
            TokenType::Tag => "tag",
            TokenType::Person => "person",
            TokenType::Location => "location",
            TokenType::Date => "date",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "title" => Some(TokenType::Title),
            "body" => Some(TokenType::Body),
            "tag" => Some(TokenType::Tag),
            "person" => Some(TokenType::Person),
            "location" => Some(TokenType::Location),
            "date" => Some(TokenType::Date),
            _ => None,
        }
    }
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// NORMALIZATION
// ============================================================================

/// NFC, lowercase, trim, collapse internal whitespace
pub fn normalize(term: &str) -> String {
    let folded: String = term.nfc().collect::<String>().to_lowercase();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// TOKEN GENERATION
// ============================================================================

/// Deterministic token: hex(HMAC(SearchKey, normalized ‖ 0x1f ‖ type)).
/// The 0x1f separator keeps ("ab", tag) and ("abt", "ag") style splices apart.
pub fn token(search_key: &[u8; KEY_LEN], term: &str, token_type: TokenType) -> String {
    let normalized = normalize(term);
    let mut input = Vec::with_capacity(normalized.len() + 1 + 8);
    input.extend_from_slice(normalized.as_bytes());
    input.push(0x1f);
    input.extend_from_slice(token_type.as_str().as_bytes());
    hex::encode(keyed_hash(search_key, &input))
}

fn is_indexable(word: &str) -> bool {
    word.chars().count() >= MIN_TOKEN_LEN && !STOP_WORDS.contains(&word)
}

/// Tokenize free text into deduplicated unigram (and optional bigram) tokens
pub fn tokenize_text(
    search_key: &[u8; KEY_LEN],
    text: &str,
    token_type: TokenType,
    bigrams: bool,
) -> Vec<String> {
    let normalized = normalize(text);
    let words: Vec<&str> = normalized
        .split(' ')
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .collect();

    let mut out = BTreeSet::new();
    for word in words.iter().filter(|w| is_indexable(w)) {
        out.insert(token(search_key, word, token_type));
    }
    if bigrams {
        for pair in words.windows(2) {
            if is_indexable(pair[0]) && is_indexable(pair[1]) {
                out.insert(token(search_key, &format!("{} {}", pair[0], pair[1]), token_type));
            }
        }
    }
    out.into_iter().collect()
}

/// Whole-value token for tags, persons, and locations
pub fn tokenize_whole(
    search_key: &[u8; KEY_LEN],
    value: &str,
    token_type: TokenType,
) -> Option<String> {
    let normalized = normalize(value);
    if normalized.is_empty() {
        return None;
    }
    Some(token(search_key, &normalized, token_type))
}

/// Captured-date components: year, year-month, and full date tokens
pub fn date_tokens(search_key: &[u8; KEY_LEN], date: chrono::NaiveDate) -> Vec<String> {
    vec![
        token(search_key, &date.format("%Y").to_string(), TokenType::Date),
        token(search_key, &date.format("%Y-%m").to_string(), TokenType::Date),
        token(search_key, &date.format("%Y-%m-%d").to_string(), TokenType::Date),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LEN] = [21u8; KEY_LEN];

    #[test]
    fn normalization_folds_case_and_whitespace() {
        assert_eq!(normalize("  PARIS   Trip \n"), "paris trip");
        // NFC: decomposed e + combining acute composes to é
        assert_eq!(normalize("Cafe\u{0301}"), "café");
    }

    #[test]
    fn tokens_are_deterministic() {
        assert_eq!(
            token(&KEY, "Paris", TokenType::Title),
            token(&KEY, "  paris ", TokenType::Title)
        );
    }

    #[test]
    fn token_type_separates_scopes() {
        assert_ne!(
            token(&KEY, "paris", TokenType::Title),
            token(&KEY, "paris", TokenType::Body)
        );
    }

    #[test]
    fn key_rotation_invalidates_tokens() {
        let other = [22u8; KEY_LEN];
        assert_ne!(
            token(&KEY, "paris", TokenType::Body),
            token(&other, "paris", TokenType::Body)
        );
    }

    #[test]
    fn stop_words_and_short_terms_skipped() {
        let tokens = tokenize_text(&KEY, "I ate a pain au chocolat", TokenType::Body, false);
        // "i", "a" dropped (stop/short), "au" kept (2 chars, not a stop word)
        assert!(tokens.contains(&token(&KEY, "ate", TokenType::Body)));
        assert!(tokens.contains(&token(&KEY, "au", TokenType::Body)));
        assert!(tokens.contains(&token(&KEY, "chocolat", TokenType::Body)));
        assert!(!tokens.contains(&token(&KEY, "i", TokenType::Body)));
    }

    #[test]
    fn bigrams_capture_adjacency() {
        let tokens = tokenize_text(&KEY, "pain au chocolat", TokenType::Body, true);
        assert!(tokens.contains(&token(&KEY, "pain au", TokenType::Body)));
        assert!(tokens.contains(&token(&KEY, "au chocolat", TokenType::Body)));
    }

    #[test]
    fn punctuation_is_stripped() {
        let tokens = tokenize_text(&KEY, "Seine, (near) the river!", TokenType::Body, false);
        assert!(tokens.contains(&token(&KEY, "seine", TokenType::Body)));
        assert!(tokens.contains(&token(&KEY, "river", TokenType::Body)));
    }

    #[test]
    fn date_components() {
        let d = chrono::NaiveDate::from_ymd_opt(2021, 6, 9).unwrap();
        let tokens = date_tokens(&KEY, d);
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0], token(&KEY, "2021", TokenType::Date));
        assert_eq!(tokens[2], token(&KEY, "2021-06-09", TokenType::Date));
    }

    #[test]
    fn tokens_leak_no_plaintext() {
        let t = token(&KEY, "chocolat", TokenType::Body);
        assert_eq!(t.len(), 64);
        assert!(!t.contains("chocolat"));
        assert!(t.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
