//! ```text
//! Locator ──► sources::resolve ──► FetchedDocument ──► preprocess::clean
//!                                                             │
//! TechniqueCatalog ◄── taxonomy::CatalogLoader                ▼
//!        │                                       segmenter::Segmenter
//!        ▼                                                    │
//! index::SqliteTechniqueIndex ◄── embeddings                  ▼
//!        │                                              Vec<TextChunk>
//!        ▼                                                    │
//! retrieval::CandidateIndex ──► candidate context ────────────┤
//!                                                             ▼
//!                     extraction::Extractor (OpenAI / Anthropic / Ollama)
//!                                                             │
//!                                                             ▼
//!                  mapping::DocumentMapper ──► ConsolidatedMapping list
//!                                                             │
//!                                                             ▼
//!                  pipeline::MappingPipeline ──► output::render
//! ```
//!
pub mod cancel;
pub mod config;
pub mod embeddings;
pub mod extraction;
pub mod index;
pub mod mapping;
pub mod output;
pub mod pipeline;
pub mod preprocess;
pub mod retrieval;
pub mod segmenter;
pub mod sources;
pub mod taxonomy;
pub mod types;

pub use cancel::{CancelSignal, CancelToken};
pub use config::PipelineConfig;
pub use output::OutputFormat;
pub use pipeline::{AnalysisOptions, DocumentAnalysis, MappingPipeline};
pub use types::{ConsolidatedMapping, MappingCandidate, PipelineError, TextChunk};
