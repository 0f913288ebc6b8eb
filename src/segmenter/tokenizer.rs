//! Token counting capabilities for the segmenter.
//!
//! Chunk budgets are expressed in tokens, so the segmenter needs a counter
//! that is deterministic for a given input. Two implementations ship here:
//! a BPE counter matching what hosted models actually bill (behind the
//! default `tokenizer-tiktoken` feature) and a whitespace approximation
//! that needs no vocabulary data.

use std::sync::Arc;

use crate::types::PipelineError;

/// Deterministic token counting.
///
/// Implementations must be pure: identical input always yields an identical
/// count, with no interior state that drifts between calls.
pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;

    /// Short identifier for logs and analysis metadata.
    fn id(&self) -> &str;
}

/// Whitespace word counting.
///
/// A coarse approximation, but exact and cheap: useful offline and in tests
/// where chunk arithmetic should be easy to reason about.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl TokenCounter for WhitespaceTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }

    fn id(&self) -> &str {
        "whitespace"
    }
}

/// BPE token counting over the `cl100k_base` vocabulary.
#[cfg(feature = "tokenizer-tiktoken")]
pub struct TiktokenTokenizer {
    bpe: tiktoken_rs::CoreBPE,
}

#[cfg(feature = "tokenizer-tiktoken")]
impl TiktokenTokenizer {
    /// Load the `cl100k_base` vocabulary.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Tokenizer`] when the bundled vocabulary
    /// cannot be constructed.
    pub fn cl100k() -> Result<Self, PipelineError> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|err| PipelineError::Tokenizer(err.to_string()))?;
        Ok(Self { bpe })
    }
}

#[cfg(feature = "tokenizer-tiktoken")]
impl TokenCounter for TiktokenTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    fn id(&self) -> &str {
        "cl100k_base"
    }
}

/// The best counter available under the enabled features.
pub fn default_tokenizer() -> Result<Arc<dyn TokenCounter>, PipelineError> {
    #[cfg(feature = "tokenizer-tiktoken")]
    {
        Ok(Arc::new(TiktokenTokenizer::cl100k()?))
    }
    #[cfg(not(feature = "tokenizer-tiktoken"))]
    {
        Ok(Arc::new(WhitespaceTokenizer))
    }
}
