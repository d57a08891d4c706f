//! Token-window text chunker.
//!
//! Splits document content into [`Chunk`]s of at most `max_tokens` tokens,
//! with an optional `overlap_tokens` shared between consecutive windows.
//! Tokenization is delegated to a [`Tokenizer`] so a real BPE tokenizer can
//! be plugged in; [`ApproxTokenizer`] is the built-in default.
//!
//! Each chunk receives a deterministic id derived from
//! `(repo, path, index, sha256(text))`, so re-processing identical content
//! produces identical ids and vector-store upserts overwrite instead of
//! duplicating.
//!
//! # Algorithm
//!
//! 1. Tokenize the content into byte spans.
//! 2. Slide a window of `max_tokens` spans with stride
//!    `max_tokens - overlap_tokens`.
//! 3. Each window's text is the unmodified content from the first span's
//!    start to the last span's end, so whitespace inside a window is kept.
//!
//! # Example
//!
//! ```rust
//! use git2vec_core::chunk::Chunker;
//! use git2vec_core::models::Document;
//!
//! let chunker = Chunker::approximate(512, 0).unwrap();
//! let doc = Document::new("owner/repo", "main", "README.md", "Hello world.".into()).unwrap();
//! let chunks = chunker.chunk_document(&doc);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].index, 0);
//! ```

use std::ops::Range;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Chunk, Document};

/// Approximate characters-per-token ratio used by [`ApproxTokenizer`].
const CHARS_PER_TOKEN: usize = 4;

/// Splits text into token byte ranges.
pub trait Tokenizer: Send + Sync {
    /// Byte ranges of each token in `text`, in order and non-overlapping.
    /// Every range must start and end on a UTF-8 char boundary.
    fn token_spans(&self, text: &str) -> Vec<Range<usize>>;
}

/// Heuristic tokenizer: runs of word characters are split into pieces of
/// at most 4 chars, every other non-whitespace char is its own token, and
/// whitespace is never a token.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApproxTokenizer;

impl Tokenizer for ApproxTokenizer {
    fn token_spans(&self, text: &str) -> Vec<Range<usize>> {
        let mut spans = Vec::new();
        let mut word_start: Option<usize> = None;
        let mut word_chars = 0usize;

        for (i, c) in text.char_indices() {
            if c.is_alphanumeric() || c == '_' {
                match word_start {
                    Some(_) if word_chars < CHARS_PER_TOKEN => word_chars += 1,
                    Some(start) => {
                        spans.push(start..i);
                        word_start = Some(i);
                        word_chars = 1;
                    }
                    None => {
                        word_start = Some(i);
                        word_chars = 1;
                    }
                }
                continue;
            }

            if let Some(start) = word_start.take() {
                spans.push(start..i);
                word_chars = 0;
            }
            if !c.is_whitespace() {
                spans.push(i..i + c.len_utf8());
            }
        }

        if let Some(start) = word_start {
            spans.push(start..text.len());
        }

        spans
    }
}

/// Splits documents into fixed-size token windows.
#[derive(Clone)]
pub struct Chunker {
    tokenizer: Arc<dyn Tokenizer>,
    max_tokens: usize,
    overlap_tokens: usize,
}

impl Chunker {
    /// # Errors
    ///
    /// Returns a validation error if `max_tokens` is zero or
    /// `overlap_tokens >= max_tokens`.
    pub fn new(
        tokenizer: Arc<dyn Tokenizer>,
        max_tokens: usize,
        overlap_tokens: usize,
    ) -> Result<Self> {
        if max_tokens == 0 {
            return Err(Error::validation("chunking.max_tokens must be > 0"));
        }
        if overlap_tokens >= max_tokens {
            return Err(Error::validation(
                "chunking.overlap_tokens must be < chunking.max_tokens",
            ));
        }
        Ok(Self {
            tokenizer,
            max_tokens,
            overlap_tokens,
        })
    }

    /// Chunker backed by [`ApproxTokenizer`].
    pub fn approximate(max_tokens: usize, overlap_tokens: usize) -> Result<Self> {
        Self::new(Arc::new(ApproxTokenizer), max_tokens, overlap_tokens)
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn overlap_tokens(&self) -> usize {
        self.overlap_tokens
    }

    /// Split one document into chunks with contiguous indices from 0.
    ///
    /// Content with no tokens yields no chunks.
    pub fn chunk_document(&self, doc: &Document) -> Vec<Chunk> {
        let text = doc.content.as_str();
        let spans = self.tokenizer.token_spans(text);
        if spans.is_empty() {
            return Vec::new();
        }

        let stride = self.max_tokens - self.overlap_tokens;
        let mut chunks = Vec::new();
        let mut start = 0usize;
        let mut index = 0u32;

        loop {
            let end = (start + self.max_tokens).min(spans.len());
            let window = &text[spans[start].start..spans[end - 1].end];
            chunks.push(make_chunk(
                &doc.metadata.repo,
                &doc.path,
                index,
                window,
                end - start,
            ));
            if end == spans.len() {
                break;
            }
            start += stride;
            index += 1;
        }

        chunks
    }
}

/// Deterministic chunk id for `(repo, path, index, content_hash)`.
///
/// A name-based (v5) UUID, so the same slot with the same content always maps
/// to the same id and any difference in the inputs yields a different one.
pub fn chunk_id(repo: &str, path: &str, index: u32, content_hash: &str) -> String {
    let name = format!("{}\0{}\0{}\0{}", repo, path, index, content_hash);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// SHA-256 of `text`, hex encoded.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(repo: &str, path: &str, index: u32, text: &str, token_count: usize) -> Chunk {
    let content_hash = hash_text(text);
    Chunk {
        id: chunk_id(repo, path, index, &content_hash),
        repo: repo.to_string(),
        path: path.to_string(),
        index,
        text: text.to_string(),
        token_count,
        content_hash,
        embedding: None,
    }
}
