//! End-to-end document analysis.
//!
//! ```text
//!   locator ──► DocumentSource ──► Segmenter ──► CandidateIndex ──► DocumentMapper
//!               (web / file)       (chunks)      (per-chunk          (extract +
//!                                                 candidates)         consolidate)
//! ```
//!
//! [`MappingPipeline`] wires the stages together. Construction goes through
//! [`PipelineBuilder`], which opens the technique index (populating it from
//! the taxonomy on first run) and builds the configured extractor; tests
//! inject their own index, extractor, or tokenizer instead.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::PipelineConfig;
use crate::embeddings::CachedEmbeddings;
use crate::extraction::{Extractor, build_extractor};
use crate::index::sqlite::SqliteTechniqueIndex;
use crate::index::{VectorIndex, populate_index};
use crate::mapping::DocumentMapper;
use crate::retrieval::CandidateIndex;
use crate::segmenter::{Segmenter, TokenCounter, default_tokenizer};
use crate::sources;
use crate::taxonomy::CatalogLoader;
use crate::types::{ConsolidatedMapping, PipelineError};
use crate::{embeddings, preprocess};

/// Everything known about one analyzed document.
#[derive(Debug, Clone)]
pub struct DocumentAnalysis {
    pub id: Uuid,
    pub source: String,
    pub title: Option<String>,
    pub generated_at: DateTime<Utc>,
    pub chunk_count: usize,
    pub mappings: Vec<ConsolidatedMapping>,
    /// Extraction requests issued, batch attempts and fallback calls both.
    pub request_count: usize,
    /// True when a cancellation signal stopped processing early.
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

/// Per-call knobs for an analysis run.
#[derive(Default)]
pub struct AnalysisOptions<'a> {
    /// Keep only candidates whose tactics intersect this set.
    pub tactic_filter: Option<Vec<String>>,
    /// Invoked once per processed chunk with
    /// `(processed, total, accepted_for_chunk)`.
    pub progress: Option<&'a mut dyn FnMut(usize, usize, usize)>,
    pub cancel: Option<CancelToken>,
}

pub struct MappingPipeline {
    config: PipelineConfig,
    segmenter: Segmenter,
    candidates: CandidateIndex,
    mapper: DocumentMapper,
}

impl MappingPipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            index: None,
            extractor: None,
            tokenizer: None,
        }
    }

    /// Fetch a document by locator and analyze it.
    pub async fn analyze(
        &self,
        locator: &str,
        options: AnalysisOptions<'_>,
    ) -> Result<DocumentAnalysis, PipelineError> {
        let fetched = sources::resolve(locator)?.fetch(locator).await?;
        let mut analysis = self
            .analyze_text(&fetched.text, Some(&fetched.source), options)
            .await;
        analysis.title = fetched.title;
        Ok(analysis)
    }

    /// Analyze already-acquired text.
    ///
    /// Never fails: empty or degenerate input produces an analysis with no
    /// mappings, and retrieval or extraction trouble surfaces as warnings
    /// and reduced findings rather than an error.
    pub async fn analyze_text(
        &self,
        text: &str,
        source_document: Option<&str>,
        options: AnalysisOptions<'_>,
    ) -> DocumentAnalysis {
        let started = Instant::now();
        let source = source_document.unwrap_or("inline text").to_string();

        if let Some(note) = preprocess::validate(text, preprocess::DEFAULT_MIN_LENGTH).note() {
            tracing::warn!(source = %source, note = %note, "analyzing despite content check");
        }

        let chunks = self.segmenter.segment(text, source_document);
        tracing::info!(source = %source, chunks = chunks.len(), "document segmented");

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let candidates_per_chunk = self
            .candidates
            .batch_retrieve(&texts, self.config.top_k, options.tactic_filter.as_deref())
            .await;

        let outcome = self
            .mapper
            .map_document(
                &chunks,
                &candidates_per_chunk,
                self.config.min_confidence,
                options.progress,
                options.cancel,
            )
            .await;

        DocumentAnalysis {
            id: Uuid::new_v4(),
            source,
            title: None,
            generated_at: Utc::now(),
            chunk_count: chunks.len(),
            mappings: outcome.mappings,
            request_count: outcome.request_count,
            cancelled: outcome.cancelled,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

pub struct PipelineBuilder {
    config: PipelineConfig,
    index: Option<Arc<dyn VectorIndex>>,
    extractor: Option<Arc<dyn Extractor>>,
    tokenizer: Option<Arc<dyn TokenCounter>>,
}

impl PipelineBuilder {
    /// Use a pre-built index instead of opening the configured one.
    #[must_use]
    pub fn with_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Use a pre-built extractor instead of the configured backend.
    #[must_use]
    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    #[must_use]
    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn TokenCounter>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Validate configuration and assemble the pipeline.
    ///
    /// When no index was injected this opens the sqlite index under the
    /// taxonomy data directory and populates it from the STIX bundle if it
    /// is empty (or `force_reload` is set), which needs network access on
    /// a cold start.
    pub async fn build(self) -> Result<MappingPipeline, PipelineError> {
        self.config.validate()?;

        let tokenizer = match self.tokenizer {
            Some(tokenizer) => tokenizer,
            None => default_tokenizer()?,
        };
        let index = match self.index {
            Some(index) => index,
            None => Arc::new(open_default_index(&self.config).await?),
        };
        let extractor = match self.extractor {
            Some(extractor) => extractor,
            None => build_extractor(&self.config.extractor, self.config.extraction_concurrency)?,
        };

        let segmenter = Segmenter::new(tokenizer, self.config.chunk_size, self.config.chunk_overlap);
        let candidates = CandidateIndex::new(index, &self.config);
        let mapper = DocumentMapper::new(extractor, &self.config);
        Ok(MappingPipeline {
            config: self.config,
            segmenter,
            candidates,
            mapper,
        })
    }
}

async fn open_default_index(
    config: &PipelineConfig,
) -> Result<SqliteTechniqueIndex, PipelineError> {
    let provider = Arc::new(CachedEmbeddings::new(embeddings::build_provider(
        &config.embedding,
    )?));
    let index = SqliteTechniqueIndex::open(config.taxonomy.index_path(), provider).await?;

    let needs_population = config.taxonomy.force_reload || index.count().await? == 0;
    if needs_population {
        if config.taxonomy.force_reload {
            index.clear().await?;
        }
        let catalog = CatalogLoader::new(config.taxonomy.clone())?.load().await?;
        let inserted = populate_index(&index, &catalog.active()).await?;
        if inserted == 0 {
            return Err(PipelineError::Taxonomy(
                "taxonomy contained no active techniques to index".into(),
            ));
        }
    }
    Ok(index)
}
