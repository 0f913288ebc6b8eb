//! Technique extraction from chunk text.
//!
//! An [`Extractor`] reads a chunk plus its formatted candidate context and
//! returns the techniques it believes the chunk describes. Three HTTP
//! backends ship in [`providers`]; the prompt and response parsing they
//! share live in [`prompt`].

pub mod prompt;
pub mod providers;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};

pub use providers::{AnthropicExtractor, OllamaExtractor, OpenAiExtractor, build_extractor};

use crate::types::{MappingCandidate, PipelineError, TextChunk};

/// Everything an extractor needs for one chunk.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub text: String,
    pub chunk_index: usize,
    pub source_document: Option<String>,
    /// Formatted candidate context from retrieval.
    pub context: String,
}

impl ExtractionRequest {
    pub fn from_chunk(chunk: &TextChunk, context: String) -> Self {
        Self {
            text: chunk.text.clone(),
            chunk_index: chunk.chunk_index,
            source_document: chunk.source_document.clone(),
            context,
        }
    }
}

/// Result of extracting one chunk. `Err` covers both transport failures
/// and unparseable model output for that chunk alone.
pub type ChunkOutcome = Result<Vec<MappingCandidate>, PipelineError>;

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, request: &ExtractionRequest) -> ChunkOutcome;

    /// Extract a whole batch in one logical call.
    ///
    /// `Err` here means the batch attempt failed as a unit (transport or
    /// backend refusal) and nothing in it was processed; per-chunk failures
    /// are reported inside the returned vector instead. Results are in
    /// request order.
    async fn extract_batch(
        &self,
        requests: &[ExtractionRequest],
    ) -> Result<Vec<ChunkOutcome>, PipelineError> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            outcomes.push(self.extract(request).await);
        }
        Ok(outcomes)
    }

    /// Short identifier for logs.
    fn name(&self) -> &str;
}

/// Run `extract` over requests with bounded concurrency, keeping order.
pub(crate) async fn extract_concurrently<E>(
    extractor: &E,
    requests: &[ExtractionRequest],
    concurrency: usize,
) -> Vec<ChunkOutcome>
where
    E: Extractor + ?Sized,
{
    // Materialize the (lazy) futures before streaming: mapping the stream
    // through a closure instead leaves the closure in the future's `Send`
    // witness and trips rustc's higher-ranked lifetime limitation
    // (rust-lang/rust#102211) inside the `async_trait` callers.
    let futures: Vec<_> = requests
        .iter()
        .map(|request| extractor.extract(request))
        .collect();
    stream::iter(futures)
        .buffered(concurrency.max(1))
        .collect()
        .await
}
