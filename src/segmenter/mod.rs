//! Token-aware greedy segmentation with controlled overlap.
//!
//! ```text
//!   document text
//!        │
//!        ▼
//!   sentence-unit split ──▶ greedy accumulate ──▶ ordered TextChunks
//!   (., !, ? + space)       (token budget)        (index, offsets, overlap)
//! ```
//!
//! The segmenter walks sentence-like units left to right, packing them into
//! a chunk until adding the next unit would push the joined text past the
//! token budget. The closed chunk's tail units are replayed as the next
//! chunk's prefix (the overlap seed), bounded by a separate overlap budget,
//! so context spanning a boundary is visible on both sides.
//!
//! Budgets are checked against the *joined* candidate text, not a sum of
//! per-unit counts: BPE tokenizers merge across unit boundaries, and the
//! joined count is what a downstream model will actually see.
//!
//! Known limitation, kept on purpose: a single sentence whose own token
//! count exceeds the chunk budget is emitted as one oversized chunk rather
//! than split mid-sentence.

pub mod tokenizer;

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;

use crate::types::TextChunk;

pub use tokenizer::{TokenCounter, WhitespaceTokenizer, default_tokenizer};
#[cfg(feature = "tokenizer-tiktoken")]
pub use tokenizer::TiktokenTokenizer;

/// A terminal punctuation mark followed by whitespace ends a sentence unit.
static BOUNDARY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[.!?]\s+").unwrap());

/// One sentence-like span of the source text.
#[derive(Clone, Copy, Debug)]
struct Unit<'a> {
    text: &'a str,
    start_char: usize,
    end_char: usize,
}

/// Splits documents into ordered, overlapping, token-bounded chunks.
///
/// Segmentation is a pure function of `(text, chunk_size, chunk_overlap)`
/// and the tokenizer: the same inputs always produce the same chunks.
pub struct Segmenter {
    chunk_size: usize,
    chunk_overlap: usize,
    tokenizer: Arc<dyn TokenCounter>,
}

impl Segmenter {
    /// Create a segmenter.
    ///
    /// Callers are expected to keep `chunk_overlap` below `chunk_size`
    /// (configuration validation enforces this); the algorithm terminates
    /// either way since the unit cursor only moves forward.
    pub fn new(tokenizer: Arc<dyn TokenCounter>, chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
            tokenizer,
        }
    }

    /// Split `text` into chunks. Never returns an empty vector: empty or
    /// short input degrades to a single (possibly empty) chunk equal to the
    /// input.
    pub fn segment(&self, text: &str, source_document: Option<&str>) -> Vec<TextChunk> {
        let total_tokens = self.tokenizer.count_tokens(text);
        if total_tokens <= self.chunk_size {
            let chunk = attach_source(
                TextChunk::new(text, 0, 0, text.chars().count(), total_tokens),
                source_document,
            );
            return vec![chunk];
        }

        let units = split_units(text);
        if units.is_empty() {
            // Unreachable for text that exceeded the budget, but the
            // never-empty contract holds regardless.
            let chunk = attach_source(
                TextChunk::new(text, 0, 0, text.chars().count(), total_tokens),
                source_document,
            );
            return vec![chunk];
        }

        let mut chunks: Vec<TextChunk> = Vec::new();
        let mut current: Vec<Unit<'_>> = Vec::new();
        let mut current_text = String::new();

        for unit in units {
            if current.is_empty() {
                current_text = unit.text.to_string();
                current.push(unit);
                continue;
            }

            let candidate = format!("{current_text} {}", unit.text);
            if self.tokenizer.count_tokens(&candidate) > self.chunk_size {
                chunks.push(attach_source(
                    self.close_chunk(&current, current_text, chunks.len()),
                    source_document,
                ));

                // Reseed from the closed chunk's tail, then append the unit
                // that overflowed the budget.
                current = self.overlap_seed(&current);
                current.push(unit);
                current_text = join_units(&current);
            } else {
                current_text = candidate;
                current.push(unit);
            }
        }

        if !current.is_empty() {
            chunks.push(attach_source(
                self.close_chunk(&current, current_text, chunks.len()),
                source_document,
            ));
        }

        chunks
    }

    fn close_chunk(&self, units: &[Unit<'_>], text: String, index: usize) -> TextChunk {
        let token_count = self.tokenizer.count_tokens(&text);
        let start_char = units[0].start_char;
        let end_char = units[units.len() - 1].end_char;
        TextChunk::new(text, index, start_char, end_char, token_count)
    }

    /// Walk the closed chunk's units backward, keeping the longest suffix
    /// whose joined token count stays within the overlap budget. Units are
    /// returned in original order.
    fn overlap_seed<'a>(&self, units: &[Unit<'a>]) -> Vec<Unit<'a>> {
        if self.chunk_overlap == 0 {
            return Vec::new();
        }

        let mut accumulated = String::new();
        let mut taken = 0;
        for unit in units.iter().rev() {
            let candidate = if accumulated.is_empty() {
                unit.text.to_string()
            } else {
                format!("{} {accumulated}", unit.text)
            };
            if self.tokenizer.count_tokens(&candidate) > self.chunk_overlap {
                break;
            }
            accumulated = candidate;
            taken += 1;
        }

        units[units.len() - taken..].to_vec()
    }
}

fn attach_source(chunk: TextChunk, source_document: Option<&str>) -> TextChunk {
    match source_document {
        Some(source) => chunk.with_source(source),
        None => chunk,
    }
}

fn join_units(units: &[Unit<'_>]) -> String {
    let mut out = String::new();
    for unit in units {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(unit.text);
    }
    out
}

/// Split text into trimmed sentence units with character offsets.
///
/// Offsets count characters, not bytes; the conversion runs once over the
/// text with a forward cursor.
fn split_units(text: &str) -> Vec<Unit<'_>> {
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut last_byte = 0;
    for boundary in BOUNDARY_RE.find_iter(text) {
        // The punctuation mark is a single-byte character; keep it with the
        // sentence it terminates.
        let end_byte = boundary.start() + 1;
        if end_byte > last_byte {
            spans.push((last_byte, end_byte));
        }
        last_byte = boundary.end();
    }
    if last_byte < text.len() {
        spans.push((last_byte, text.len()));
    }

    let mut units = Vec::with_capacity(spans.len());
    let mut cursor = CharCursor::new(text);
    for (start_byte, end_byte) in spans {
        let slice = &text[start_byte..end_byte];
        let trimmed = slice.trim();
        if trimmed.is_empty() {
            continue;
        }
        let lead = slice.len() - slice.trim_start().len();
        let trail = slice.len() - slice.trim_end().len();
        let start_char = cursor.char_at(start_byte + lead);
        let end_char = cursor.char_at(end_byte - trail);
        units.push(Unit {
            text: trimmed,
            start_char,
            end_char,
        });
    }
    units
}

/// Forward-only byte-to-char offset converter; each byte of the text is
/// scanned at most once across all conversions.
struct CharCursor<'a> {
    text: &'a str,
    byte_pos: usize,
    char_pos: usize,
}

impl<'a> CharCursor<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            byte_pos: 0,
            char_pos: 0,
        }
    }

    fn char_at(&mut self, byte: usize) -> usize {
        debug_assert!(byte >= self.byte_pos);
        self.char_pos += self.text[self.byte_pos..byte].chars().count();
        self.byte_pos = byte;
        self.char_pos
    }
}
