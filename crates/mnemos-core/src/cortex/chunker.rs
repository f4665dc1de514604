//! Text Chunking
//!
//! Whitespace tokenization sliced into windows of up to 512 tokens with a
//! 64-token overlap; the final chunk may be short. Chunk indices are 0-based
//! and stable per (memory id, plaintext digest): the same text always chunks
//! the same way, and re-chunking happens only on content update.

/// Window size in whitespace tokens
pub const CHUNK_TOKENS: usize = 512;
/// Overlap between consecutive windows
pub const CHUNK_OVERLAP: usize = 64;

/// One chunk of a memory's plaintext
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 0-based, stable for a fixed (memory id, digest)
    pub index: u32,
    pub text: String,
}

/// Slice `text` into overlapping windows
pub fn chunk_text(text: &str) -> Vec<Chunk> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return Vec::new();
    }

    let stride = CHUNK_TOKENS - CHUNK_OVERLAP;
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut index = 0u32;
    loop {
        let end = (start + CHUNK_TOKENS).min(tokens.len());
        chunks.push(Chunk {
            index,
            text: tokens[start..end].join(" "),
        });
        if end == tokens.len() {
            break;
        }
        start += stride;
        index += 1;
    }
    chunks
}
