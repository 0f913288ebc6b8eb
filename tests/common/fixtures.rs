#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use attackmap::config::{EmbeddingKind, PipelineConfig};
use attackmap::extraction::{ChunkOutcome, ExtractionRequest, Extractor};
use attackmap::index::{HitMetadata, IndexHit, VectorIndex};
use attackmap::types::{MappingCandidate, PipelineError, TaxonomyEntry};

/// Configuration for offline runs: hash embeddings, small chunks, and a
/// threshold loose enough that hash-vector similarity never drops hits.
pub fn offline_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.embedding.kind = EmbeddingKind::Hash;
    config.chunk_size = 20;
    config.chunk_overlap = 4;
    config.top_k = 3;
    config.similarity_threshold = 0.05;
    config.subtechnique_threshold = 0.05;
    config.min_confidence = 0.5;
    config.batch_size = 4;
    config
}

pub fn hit(id: &str, name: &str, tactics: &str, distance: f32) -> IndexHit {
    IndexHit {
        id: id.to_string(),
        metadata: HitMetadata {
            name: name.to_string(),
            tactics: tactics.to_string(),
            description: format!("{name} description"),
        },
        distance,
    }
}

pub fn candidate(id: &str, confidence: f32, evidence: &str, tactics: &[&str]) -> MappingCandidate {
    MappingCandidate::new(
        id,
        format!("name for {id}"),
        confidence,
        evidence,
        tactics.iter().map(|t| t.to_string()).collect(),
    )
    .unwrap()
}

/// Index stub answering every query with the same fixed hits.
pub struct StaticIndex {
    hits: Vec<IndexHit>,
    pub queries: AtomicUsize,
}

impl StaticIndex {
    pub fn new(hits: Vec<IndexHit>) -> Self {
        Self {
            hits,
            queries: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl VectorIndex for StaticIndex {
    async fn insert(&self, _entries: Vec<TaxonomyEntry>) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn query(&self, _text: &str, top_k: usize) -> Result<Vec<IndexHit>, PipelineError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.hits.iter().take(top_k).cloned().collect())
    }

    async fn count(&self) -> Result<usize, PipelineError> {
        Ok(self.hits.len())
    }

    async fn clear(&self) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Extractor stub that emits a fixed mapping whenever its keyword appears in
/// the chunk text, recording every candidate context it was handed.
pub struct KeywordExtractor {
    rules: Vec<(String, MappingCandidate)>,
    pub contexts: Mutex<Vec<String>>,
}

impl KeywordExtractor {
    pub fn new(rules: Vec<(&str, MappingCandidate)>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|(keyword, candidate)| (keyword.to_string(), candidate))
                .collect(),
            contexts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Extractor for KeywordExtractor {
    async fn extract(&self, request: &ExtractionRequest) -> ChunkOutcome {
        self.contexts.lock().push(request.context.clone());
        Ok(self
            .rules
            .iter()
            .filter(|(keyword, _)| request.text.contains(keyword.as_str()))
            .map(|(_, candidate)| candidate.clone())
            .collect())
    }

    fn name(&self) -> &str {
        "keyword-stub"
    }
}

/// Six sentences of eight whitespace tokens each. With `chunk_size` 20 and
/// `chunk_overlap` 4 under the whitespace tokenizer this segments into three
/// two-sentence chunks: PowerShell appears in chunks 0 and 2, phishing in
/// chunk 1.
pub fn sample_report() -> String {
    [
        "The intruders launched PowerShell scripts on every host.",
        "Collected data was staged inside renamed archive files.",
        "A phishing email delivered the first malicious payload.",
        "Operators then moved laterally using harvested administrator credentials.",
        "Later stages executed PowerShell loaders from remote infrastructure.",
        "Defenders observed beaconing traffic toward a hostile domain.",
    ]
    .join(" ")
}

/// Minimal STIX bundle with three active techniques and one deprecated one.
pub fn sample_bundle() -> String {
    let phases = |tactic: &str| {
        serde_json::json!([{ "kill_chain_name": "mitre-attack", "phase_name": tactic }])
    };
    serde_json::json!({
        "type": "bundle",
        "id": "bundle--test",
        "objects": [
            {
                "type": "attack-pattern",
                "name": "Command and Scripting Interpreter",
                "description": "Adversaries abuse command interpreters such as PowerShell to execute payloads.",
                "kill_chain_phases": phases("execution"),
                "external_references": [
                    { "source_name": "mitre-attack", "external_id": "T1059" }
                ]
            },
            {
                "type": "attack-pattern",
                "name": "Phishing",
                "description": "Adversaries send phishing messages carrying malicious attachments or links.",
                "kill_chain_phases": phases("initial-access"),
                "external_references": [
                    { "source_name": "mitre-attack", "external_id": "T1566" }
                ]
            },
            {
                "type": "attack-pattern",
                "name": "OS Credential Dumping",
                "description": "Adversaries dump credential material from operating system stores.",
                "kill_chain_phases": phases("credential-access"),
                "external_references": [
                    { "source_name": "mitre-attack", "external_id": "T1003" }
                ]
            },
            {
                "type": "attack-pattern",
                "name": "Retired Technique",
                "description": "Kept in the bundle for history only.",
                "x_mitre_deprecated": true,
                "kill_chain_phases": phases("execution"),
                "external_references": [
                    { "source_name": "mitre-attack", "external_id": "T9999" }
                ]
            }
        ]
    })
    .to_string()
}
