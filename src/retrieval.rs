//! Candidate retrieval over the technique index.
//!
//! [`CandidateIndex`] turns raw nearest-neighbour hits into scored
//! candidates: cosine distance becomes `1 / (1 + distance)`, so a distance
//! of zero maps to similarity 1.0 and the score stays in `(0, 1]`.
//! Sub-techniques (dotted ids) are held to a stricter threshold than parent
//! techniques, since shallow textual overlap is enough to surface a parent
//! but picking the right sub-technique needs stronger evidence.
//!
//! Retrieval never fails the pipeline: an index error degrades to an empty
//! candidate list with a warning, and extraction proceeds without context.

use std::borrow::Cow;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};

use crate::config::PipelineConfig;
use crate::index::VectorIndex;
use crate::types::{RetrievedCandidate, is_subtechnique};

/// Character budget for a parent technique description in formatted context.
const PARENT_DESC_BUDGET: usize = 400;
/// Sub-techniques get twice the budget; disambiguating them from siblings
/// and parents needs more of the description text.
const SUBTECH_DESC_BUDGET: usize = 800;

const EMPTY_CONTEXT: &str = "No candidate techniques were retrieved for this text.";

pub struct CandidateIndex {
    index: Arc<dyn VectorIndex>,
    similarity_threshold: f32,
    subtechnique_threshold: f32,
    concurrency: usize,
}

fn similarity_from_distance(distance: f32) -> f32 {
    1.0 / (1.0 + distance)
}

fn truncate_description(text: &str, budget: usize) -> Cow<'_, str> {
    if text.chars().count() <= budget {
        return Cow::Borrowed(text);
    }
    let cut: String = text.chars().take(budget).collect();
    Cow::Owned(format!("{}...", cut.trim_end()))
}

impl CandidateIndex {
    pub fn new(index: Arc<dyn VectorIndex>, config: &PipelineConfig) -> Self {
        Self {
            index,
            similarity_threshold: config.similarity_threshold,
            subtechnique_threshold: config.subtechnique_threshold,
            concurrency: config.retrieval_concurrency.max(1),
        }
    }

    /// Retrieve scored candidates for one query text.
    ///
    /// Hits keep the index's order (ascending distance, so descending
    /// similarity). Candidates below their granularity's threshold are
    /// dropped, as is anything whose tactics miss a supplied filter.
    pub async fn retrieve(
        &self,
        query_text: &str,
        top_k: usize,
        tactic_filter: Option<&[String]>,
    ) -> Vec<RetrievedCandidate> {
        let hits = match self.index.query(query_text, top_k).await {
            Ok(hits) => hits,
            Err(err) => {
                tracing::warn!(error = %err, "candidate retrieval failed, continuing without candidates");
                return Vec::new();
            }
        };

        let mut candidates = Vec::with_capacity(hits.len());
        for hit in hits {
            let similarity = similarity_from_distance(hit.distance);
            let threshold = if is_subtechnique(&hit.id) {
                self.subtechnique_threshold
            } else {
                self.similarity_threshold
            };
            // Written so NaN similarity (corrupt vector) is dropped too.
            if !(similarity >= threshold) {
                continue;
            }

            let tactics: Vec<String> = hit
                .metadata
                .tactics
                .split(',')
                .map(str::trim)
                .filter(|tactic| !tactic.is_empty())
                .map(str::to_string)
                .collect();

            if let Some(filter) = tactic_filter {
                if !filter.is_empty()
                    && !tactics.iter().any(|tactic| filter.contains(tactic))
                {
                    continue;
                }
            }

            candidates.push(RetrievedCandidate {
                technique_id: hit.id,
                name: hit.metadata.name,
                tactics,
                description: hit.metadata.description,
                similarity_score: similarity,
            });
        }
        candidates
    }

    /// Retrieve candidates for many texts, preserving input order.
    ///
    /// Each retrieval is independent, so up to `retrieval_concurrency`
    /// queries run against the index at once.
    pub async fn batch_retrieve(
        &self,
        query_texts: &[String],
        top_k: usize,
        tactic_filter: Option<&[String]>,
    ) -> Vec<Vec<RetrievedCandidate>> {
        stream::iter(query_texts)
            .map(|query| self.retrieve(query, top_k, tactic_filter))
            .buffered(self.concurrency)
            .collect()
            .await
    }

    /// Render candidates into a bounded context block for the extractor.
    /// See [`format_context`].
    pub fn format_context(&self, candidates: &[RetrievedCandidate], max_chars: usize) -> String {
        format_context(candidates, max_chars)
    }
}

/// Render candidates into a bounded context block for the extractor.
///
/// Candidates are taken in the given order. Each description is clipped
/// to its granularity's budget, and the loop stops before a block would
/// push the total past `max_chars`. The first candidate is always
/// included so a tight budget still yields usable context. Empty input
/// returns a fixed sentinel instead of an empty string.
pub fn format_context(candidates: &[RetrievedCandidate], max_chars: usize) -> String {
    if candidates.is_empty() {
        return EMPTY_CONTEXT.to_string();
    }

    let mut context = String::new();
    for candidate in candidates {
        let budget = if candidate.is_subtechnique() {
            SUBTECH_DESC_BUDGET
        } else {
            PARENT_DESC_BUDGET
        };
        let description = truncate_description(&candidate.description, budget);
        let block = format!(
            "{} ({}) | tactics: {} | similarity: {:.2}\n{}\n\n",
            candidate.technique_id,
            candidate.name,
            candidate.tactics.join(", "),
            candidate.similarity_score,
            description,
        );
        if !context.is_empty() && context.len() + block.len() > max_chars {
            break;
        }
        context.push_str(&block);
    }
    context.trim_end().to_string()
}
