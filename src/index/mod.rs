//! Technique vector index.
//!
//! The index stores one document per active technique and answers
//! text queries with nearest neighbours by cosine distance. [`VectorIndex`]
//! keeps the storage backend swappable; the shipped backend is SQLite with
//! the sqlite-vec extension ([`sqlite::SqliteTechniqueIndex`]). Backends own
//! their embedding provider, so callers hand over plain text on both the
//! write and the read path.

pub mod sqlite;

use async_trait::async_trait;

pub use sqlite::SqliteTechniqueIndex;

use crate::types::{PipelineError, TaxonomyEntry};

/// Techniques inserted per call while populating.
const POPULATE_BATCH: usize = 100;

/// Stored fields returned alongside a hit.
#[derive(Debug, Clone)]
pub struct HitMetadata {
    pub name: String,
    /// Tactic short names joined with commas, as stored.
    pub tactics: String,
    pub description: String,
}

/// One nearest-neighbour result. `distance` is raw cosine distance; the
/// retrieval layer converts it to a similarity score.
#[derive(Debug, Clone)]
pub struct IndexHit {
    pub id: String,
    pub metadata: HitMetadata,
    pub distance: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Embed and store taxonomy entries. Existing rows with the same id are
    /// replaced.
    async fn insert(&self, entries: Vec<TaxonomyEntry>) -> Result<(), PipelineError>;

    /// Nearest neighbours for `text`, ordered by ascending distance.
    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<IndexHit>, PipelineError>;

    async fn count(&self) -> Result<usize, PipelineError>;

    /// Drop all stored documents, used before a forced rebuild.
    async fn clear(&self) -> Result<(), PipelineError>;
}

/// Insert taxonomy entries into the index in batches.
///
/// Returns the number of documents inserted. Callers pass only active
/// entries; deprecated ones never reach the index.
pub async fn populate_index(
    index: &dyn VectorIndex,
    entries: &[TaxonomyEntry],
) -> Result<usize, PipelineError> {
    let mut inserted = 0usize;
    for batch in entries.chunks(POPULATE_BATCH) {
        index.insert(batch.to_vec()).await?;
        inserted += batch.len();
        tracing::debug!(inserted, total = entries.len(), "index population progress");
    }
    tracing::info!(documents = inserted, "technique index populated");
    Ok(inserted)
}
