//! Core data model shared across the mapping pipeline.
//!
//! Everything downstream of the segmenter treats these records as read-only
//! values: chunks flow into retrieval and extraction, candidates flow into
//! consolidation, and the consolidated mappings are what callers keep.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for the pipeline and its capability seams.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("document source failure: {0}")]
    Source(String),
    #[error("taxonomy load failure: {0}")]
    Taxonomy(String),
    #[error("embedding failure: {0}")]
    Embedding(String),
    #[error("index failure: {0}")]
    Index(String),
    #[error("extraction failure: {0}")]
    Extraction(String),
    #[error("output failure: {0}")]
    Output(String),
    #[error("tokenizer failure: {0}")]
    Tokenizer(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Returns true when a technique id denotes a sub-technique.
///
/// ATT&CK sub-techniques carry a dotted id (`T1566.001` specializes `T1566`);
/// the dot is the hierarchy separator for every id scheme this crate handles.
pub fn is_subtechnique(technique_id: &str) -> bool {
    technique_id.contains('.')
}

/// A token-bounded slice of a source document.
///
/// Produced by the segmenter, never mutated afterwards. Offsets are character
/// positions in the text the segmenter was given; when chunks overlap, the
/// spans of consecutive chunks overlap over exactly the reused text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    /// Chunk text, whitespace-normalized at sentence joins
    pub text: String,
    /// Zero-based position of this chunk in emission order
    pub chunk_index: usize,
    /// Character offset of the chunk start in the source text
    pub start_char: usize,
    /// Character offset one past the chunk end in the source text
    pub end_char: usize,
    /// Token count of `text` under the segmenter's tokenizer
    pub token_count: usize,
    /// Identifier of the originating document, when known
    pub source_document: Option<String>,
    /// Page the chunk was lifted from, for paginated sources
    pub page_number: Option<u32>,
}

impl TextChunk {
    /// Create a chunk with no source attribution.
    pub fn new(
        text: impl Into<String>,
        chunk_index: usize,
        start_char: usize,
        end_char: usize,
        token_count: usize,
    ) -> Self {
        Self {
            text: text.into(),
            chunk_index,
            start_char,
            end_char,
            token_count,
            source_document: None,
            page_number: None,
        }
    }

    /// Attach the originating document identifier.
    #[must_use]
    pub fn with_source(mut self, source_document: impl Into<String>) -> Self {
        self.source_document = Some(source_document.into());
        self
    }

    /// Attach a page number.
    #[must_use]
    pub fn with_page(mut self, page_number: u32) -> Self {
        self.page_number = Some(page_number);
        self
    }
}

/// One technique in the target taxonomy.
///
/// Loaded from the ATT&CK STIX bundle and held immutable. Deprecated entries
/// are filtered out before anything reaches the vector index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyEntry {
    /// External technique id (`T1566`, `T1566.001`, ...)
    pub id: String,
    /// Human-readable technique name
    pub name: String,
    /// Tactic names in kill-chain order
    pub tactics: Vec<String>,
    /// Full technique description
    pub description: String,
    /// Whether the upstream catalog marks this entry deprecated
    pub deprecated: bool,
}

impl TaxonomyEntry {
    /// True when this entry specializes a parent technique.
    pub fn is_subtechnique(&self) -> bool {
        is_subtechnique(&self.id)
    }

    /// The text embedded for this entry: name and description together, so
    /// queries match either phrasing.
    pub fn document_text(&self) -> String {
        format!("{}. {}", self.name, self.description)
    }

    /// Tactics joined into the comma-separated form stored as index metadata.
    pub fn tactics_joined(&self) -> String {
        self.tactics.join(",")
    }
}

/// A taxonomy entry returned for one query, scored by similarity.
///
/// `similarity_score` lives in `(0, 1]`: it is derived from a non-negative
/// index distance via `1 / (1 + distance)`, so distance zero maps to exactly
/// one and larger distances decay monotonically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievedCandidate {
    pub technique_id: String,
    pub name: String,
    pub tactics: Vec<String>,
    pub description: String,
    pub similarity_score: f32,
}

impl RetrievedCandidate {
    /// True when the candidate id denotes a sub-technique.
    pub fn is_subtechnique(&self) -> bool {
        is_subtechnique(&self.technique_id)
    }
}

/// One technique an extractor claims a chunk describes.
///
/// Constructed through [`MappingCandidate::new`], which rejects confidence
/// values outside `[0, 1]` (NaN included) so later ordering never sees them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MappingCandidate {
    pub technique_id: String,
    pub technique_name: String,
    /// Extractor confidence in `[0, 1]`
    pub confidence: f32,
    /// Verbatim passage the extractor cites as support
    pub evidence: String,
    pub tactics: Vec<String>,
}

impl MappingCandidate {
    /// Create a candidate, validating the confidence range.
    pub fn new(
        technique_id: impl Into<String>,
        technique_name: impl Into<String>,
        confidence: f32,
        evidence: impl Into<String>,
        tactics: Vec<String>,
    ) -> Result<Self, PipelineError> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(PipelineError::Validation(format!(
                "confidence {confidence} outside [0, 1]"
            )));
        }
        Ok(Self {
            technique_id: technique_id.into(),
            technique_name: technique_name.into(),
            confidence,
            evidence: evidence.into(),
            tactics,
        })
    }

    /// True when the candidate id denotes a sub-technique.
    pub fn is_subtechnique(&self) -> bool {
        is_subtechnique(&self.technique_id)
    }
}

/// Document-level record for one unique technique after consolidation.
///
/// `confidence` is the maximum observed across contributing chunks and
/// `evidence` joins up to three supporting passages, best first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedMapping {
    pub technique_id: String,
    pub technique_name: String,
    pub confidence: f32,
    pub evidence: String,
    pub tactics: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtechnique_ids_are_dotted() {
        assert!(is_subtechnique("T1566.001"));
        assert!(!is_subtechnique("T1566"));
        assert!(!is_subtechnique(""));
    }

    #[test]
    fn chunk_builders_attach_attribution() {
        let chunk = TextChunk::new("attack text", 0, 0, 11, 2)
            .with_source("report.html")
            .with_page(4);
        assert_eq!(chunk.source_document.as_deref(), Some("report.html"));
        assert_eq!(chunk.page_number, Some(4));
    }

    #[test]
    fn mapping_candidate_rejects_out_of_range_confidence() {
        for bad in [-0.1, 1.1, f32::NAN] {
            let result = MappingCandidate::new("T1078", "Valid Accounts", bad, "e", vec![]);
            assert!(result.is_err(), "confidence {bad} should be rejected");
        }
    }

    #[test]
    fn mapping_candidate_accepts_boundary_confidence() {
        for ok in [0.0, 0.5, 1.0] {
            assert!(MappingCandidate::new("T1078", "Valid Accounts", ok, "e", vec![]).is_ok());
        }
    }

    #[test]
    fn entry_document_text_joins_name_and_description() {
        let entry = TaxonomyEntry {
            id: "T1566".into(),
            name: "Phishing".into(),
            tactics: vec!["initial-access".into()],
            description: "Adversaries may send phishing messages.".into(),
            deprecated: false,
        };
        assert_eq!(
            entry.document_text(),
            "Phishing. Adversaries may send phishing messages."
        );
        assert_eq!(entry.tactics_joined(), "initial-access");
        assert!(!entry.is_subtechnique());
    }
}
