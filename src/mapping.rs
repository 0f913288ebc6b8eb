//! Document-level consolidation of per-chunk extractions.
//!
//! [`DocumentMapper`] drives the extractor over segmented chunks:
//!
//! ```text
//! chunks ──► batches of `batch_size` ──► extract_batch ──┬─► per-chunk outcomes
//!                                          │ (batch Err) │
//!                                          ▼             ▼
//!                                   sequential extract   confidence filter
//!                                   per chunk (fallback) ──► dedup by id
//! ```
//!
//! A failed chunk contributes zero findings and never aborts the document.
//! Deduplication groups accepted mappings by technique id: the
//! highest-confidence record represents the group, carrying up to three
//! evidence passages joined best-first. Document order is first appearance
//! of each technique id, not confidence order.

use std::future::Future;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::cancel::CancelToken;
use crate::config::PipelineConfig;
use crate::extraction::{ChunkOutcome, ExtractionRequest, Extractor};
use crate::retrieval::format_context;
use crate::types::{ConsolidatedMapping, MappingCandidate, RetrievedCandidate, TextChunk};

/// Evidence passages kept per consolidated technique.
const EVIDENCE_LIMIT: usize = 3;
const EVIDENCE_SEPARATOR: &str = " | ";

/// Result of mapping one document.
#[derive(Debug, Clone)]
pub struct MapOutcome {
    pub mappings: Vec<ConsolidatedMapping>,
    /// Extraction requests issued: one per batch attempt plus one per
    /// sequential fallback call.
    pub request_count: usize,
    /// True when processing stopped early on a cancellation signal. The
    /// mappings then cover only the chunks processed before the stop.
    pub cancelled: bool,
}

pub struct DocumentMapper {
    extractor: Arc<dyn Extractor>,
    batch_size: usize,
    context_max_chars: usize,
}

impl DocumentMapper {
    pub fn new(extractor: Arc<dyn Extractor>, config: &PipelineConfig) -> Self {
        Self {
            extractor,
            batch_size: config.batch_size.max(1),
            context_max_chars: config.context_max_chars,
        }
    }

    /// Map a segmented document onto consolidated techniques.
    ///
    /// `candidates_per_chunk` is positional and parallel to `chunks`; a
    /// missing or empty entry yields the "no candidates" context for that
    /// chunk. The progress observer fires once per chunk, failures
    /// included, with `(processed, total, accepted_for_chunk)`.
    pub async fn map_document(
        &self,
        chunks: &[TextChunk],
        candidates_per_chunk: &[Vec<RetrievedCandidate>],
        min_confidence: f32,
        mut progress: Option<&mut dyn FnMut(usize, usize, usize)>,
        mut cancel: Option<CancelToken>,
    ) -> MapOutcome {
        let total = chunks.len();
        let mut accepted: Vec<MappingCandidate> = Vec::new();
        let mut request_count = 0usize;
        let mut processed = 0usize;
        let mut cancelled = false;

        'batches: for (batch_number, batch) in chunks.chunks(self.batch_size).enumerate() {
            if cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                cancelled = true;
                break;
            }

            let base = batch_number * self.batch_size;
            let requests: Vec<ExtractionRequest> = batch
                .iter()
                .enumerate()
                .map(|(offset, chunk)| {
                    let candidates = candidates_per_chunk
                        .get(base + offset)
                        .map(Vec::as_slice)
                        .unwrap_or(&[]);
                    ExtractionRequest::from_chunk(
                        chunk,
                        format_context(candidates, self.context_max_chars),
                    )
                })
                .collect();

            // One unit of accounting per batch attempt, failed ones included.
            request_count += 1;
            let batch_attempt = match run_until_cancelled(
                self.extractor.extract_batch(&requests),
                cancel.as_mut(),
            )
            .await
            {
                Some(result) => result,
                None => {
                    cancelled = true;
                    break;
                }
            };

            match batch_attempt {
                Ok(outcomes) => {
                    for (request, outcome) in requests.iter().zip(outcomes) {
                        processed += 1;
                        let kept = accept_outcome(
                            outcome,
                            request.chunk_index,
                            min_confidence,
                            &mut accepted,
                        );
                        if let Some(observer) = progress.as_mut() {
                            observer(processed, total, kept);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        batch = batch_number,
                        error = %err,
                        "batch extraction failed, retrying its chunks sequentially"
                    );
                    for request in &requests {
                        if cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                            cancelled = true;
                            break 'batches;
                        }
                        request_count += 1;
                        let outcome = match run_until_cancelled(
                            self.extractor.extract(request),
                            cancel.as_mut(),
                        )
                        .await
                        {
                            Some(outcome) => outcome,
                            None => {
                                cancelled = true;
                                break 'batches;
                            }
                        };
                        processed += 1;
                        let kept = accept_outcome(
                            outcome,
                            request.chunk_index,
                            min_confidence,
                            &mut accepted,
                        );
                        if let Some(observer) = progress.as_mut() {
                            observer(processed, total, kept);
                        }
                    }
                }
            }
        }

        let mappings = consolidate(accepted);
        tracing::info!(
            chunks = total,
            processed,
            mappings = mappings.len(),
            requests = request_count,
            cancelled,
            "document mapping complete"
        );
        MapOutcome {
            mappings,
            request_count,
            cancelled,
        }
    }
}

async fn run_until_cancelled<F>(work: F, cancel: Option<&mut CancelToken>) -> Option<F::Output>
where
    F: Future,
{
    match cancel {
        Some(token) => {
            tokio::select! {
                output = work => Some(output),
                _ = token.cancelled() => None,
            }
        }
        None => Some(work.await),
    }
}

/// Filter one chunk's outcome into the accumulator, returning how many
/// mappings were kept. Failures count as zero findings.
fn accept_outcome(
    outcome: ChunkOutcome,
    chunk_index: usize,
    min_confidence: f32,
    accepted: &mut Vec<MappingCandidate>,
) -> usize {
    match outcome {
        Ok(mappings) => {
            let mut kept = 0usize;
            for mapping in mappings {
                if mapping.confidence >= min_confidence {
                    accepted.push(mapping);
                    kept += 1;
                } else {
                    tracing::debug!(
                        chunk_index,
                        technique_id = %mapping.technique_id,
                        confidence = mapping.confidence,
                        "mapping below confidence floor"
                    );
                }
            }
            kept
        }
        Err(err) => {
            tracing::warn!(chunk_index, error = %err, "chunk extraction failed");
            0
        }
    }
}

/// Merge accepted mappings into one record per technique id.
fn consolidate(accepted: Vec<MappingCandidate>) -> Vec<ConsolidatedMapping> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: FxHashMap<String, Vec<MappingCandidate>> = FxHashMap::default();
    for mapping in accepted {
        if !groups.contains_key(&mapping.technique_id) {
            order.push(mapping.technique_id.clone());
        }
        groups
            .entry(mapping.technique_id.clone())
            .or_default()
            .push(mapping);
    }

    let mut consolidated = Vec::with_capacity(order.len());
    for technique_id in order {
        let Some(mut group) = groups.remove(&technique_id) else {
            continue;
        };
        // Stable sort keeps first-seen order among equal confidences.
        group.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let evidence = group
            .iter()
            .map(|mapping| mapping.evidence.as_str())
            .filter(|evidence| !evidence.is_empty())
            .take(EVIDENCE_LIMIT)
            .collect::<Vec<_>>()
            .join(EVIDENCE_SEPARATOR);
        let Some(best) = group.into_iter().next() else {
            continue;
        };
        consolidated.push(ConsolidatedMapping {
            technique_id: best.technique_id,
            technique_name: best.technique_name,
            confidence: best.confidence,
            evidence,
            tactics: best.tactics,
        });
    }
    consolidated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSignal;
    use crate::types::PipelineError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedExtractor {
        script: FxHashMap<usize, Vec<MappingCandidate>>,
        failing_chunks: Vec<usize>,
        fail_batches: bool,
        batch_calls: AtomicUsize,
        single_calls: AtomicUsize,
        seen_contexts: Mutex<Vec<String>>,
    }

    impl ScriptedExtractor {
        fn new(script: FxHashMap<usize, Vec<MappingCandidate>>) -> Self {
            Self {
                script,
                failing_chunks: Vec::new(),
                fail_batches: false,
                batch_calls: AtomicUsize::new(0),
                single_calls: AtomicUsize::new(0),
                seen_contexts: Mutex::new(Vec::new()),
            }
        }

        fn outcome_for(&self, chunk_index: usize) -> ChunkOutcome {
            if self.failing_chunks.contains(&chunk_index) {
                return Err(PipelineError::Extraction(format!("chunk {chunk_index} failed")));
            }
            Ok(self.script.get(&chunk_index).cloned().unwrap_or_default())
        }
    }

    #[async_trait]
    impl Extractor for ScriptedExtractor {
        async fn extract(&self, request: &ExtractionRequest) -> ChunkOutcome {
            self.single_calls.fetch_add(1, Ordering::SeqCst);
            self.outcome_for(request.chunk_index)
        }

        async fn extract_batch(
            &self,
            requests: &[ExtractionRequest],
        ) -> Result<Vec<ChunkOutcome>, PipelineError> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_batches {
                return Err(PipelineError::Extraction("batch transport failure".into()));
            }
            let mut contexts = self.seen_contexts.lock();
            for request in requests {
                contexts.push(request.context.clone());
            }
            Ok(requests
                .iter()
                .map(|request| self.outcome_for(request.chunk_index))
                .collect())
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn chunk(i: usize) -> TextChunk {
        TextChunk::new(format!("chunk text {i}"), i, i * 20, i * 20 + 13, 3)
    }

    fn chunks(n: usize) -> Vec<TextChunk> {
        (0..n).map(chunk).collect()
    }

    fn no_candidates(n: usize) -> Vec<Vec<RetrievedCandidate>> {
        vec![Vec::new(); n]
    }

    fn candidate(id: &str, confidence: f32, evidence: &str) -> MappingCandidate {
        MappingCandidate::new(
            id,
            format!("name for {id}"),
            confidence,
            evidence,
            vec!["execution".to_string()],
        )
        .unwrap()
    }

    fn mapper(extractor: Arc<dyn Extractor>) -> DocumentMapper {
        DocumentMapper::new(extractor, &PipelineConfig::default())
    }

    #[tokio::test]
    async fn filters_mappings_below_the_confidence_floor() {
        let mut script = FxHashMap::default();
        script.insert(
            0,
            vec![candidate("T1059", 0.9, "strong"), candidate("T1027", 0.3, "weak")],
        );
        let extractor = Arc::new(ScriptedExtractor::new(script));

        let outcome = mapper(extractor)
            .map_document(&chunks(1), &no_candidates(1), 0.5, None, None)
            .await;
        assert_eq!(outcome.mappings.len(), 1);
        assert_eq!(outcome.mappings[0].technique_id, "T1059");
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn deduplicates_by_first_seen_order_with_max_confidence() {
        let mut script = FxHashMap::default();
        script.insert(
            0,
            vec![candidate("T1059", 0.7, "first sighting"), candidate("T1003", 0.8, "creds")],
        );
        script.insert(1, vec![candidate("T1059", 0.95, "stronger")]);
        script.insert(2, vec![candidate("T1059", 0.6, "weaker")]);
        let extractor = Arc::new(ScriptedExtractor::new(script));

        let outcome = mapper(extractor)
            .map_document(&chunks(3), &no_candidates(3), 0.5, None, None)
            .await;

        assert_eq!(outcome.mappings.len(), 2);
        // First appearance order, not confidence order.
        assert_eq!(outcome.mappings[0].technique_id, "T1059");
        assert_eq!(outcome.mappings[1].technique_id, "T1003");

        let merged = &outcome.mappings[0];
        assert!((merged.confidence - 0.95).abs() < 1e-6);
        assert_eq!(merged.evidence, "stronger | first sighting | weaker");
        assert_eq!(merged.technique_name, "name for T1059");
    }

    #[tokio::test]
    async fn evidence_stops_at_three_passages() {
        let mut script = FxHashMap::default();
        for i in 0..5 {
            script.insert(
                i,
                vec![candidate("T1486", 0.5 + i as f32 * 0.1, &format!("evidence {i}"))],
            );
        }
        let extractor = Arc::new(ScriptedExtractor::new(script));

        let outcome = mapper(extractor)
            .map_document(&chunks(5), &no_candidates(5), 0.1, None, None)
            .await;
        let evidence: Vec<&str> = outcome.mappings[0].evidence.split(" | ").collect();
        assert_eq!(evidence, vec!["evidence 4", "evidence 3", "evidence 2"]);
    }

    #[tokio::test]
    async fn batch_failure_falls_back_to_sequential_calls() {
        let mut script = FxHashMap::default();
        script.insert(0, vec![candidate("T1059", 0.9, "a")]);
        script.insert(2, vec![candidate("T1566", 0.8, "c")]);
        let extractor = Arc::new(ScriptedExtractor {
            fail_batches: true,
            ..ScriptedExtractor::new(script)
        });

        let outcome = mapper(extractor.clone())
            .map_document(&chunks(3), &no_candidates(3), 0.5, None, None)
            .await;

        assert_eq!(extractor.batch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(extractor.single_calls.load(Ordering::SeqCst), 3);
        // One failed batch attempt plus three fallback calls.
        assert_eq!(outcome.request_count, 4);
        assert_eq!(outcome.mappings.len(), 2);
    }

    #[tokio::test]
    async fn failed_chunk_reports_zero_accepted_and_does_not_abort() {
        let mut script = FxHashMap::default();
        script.insert(0, vec![candidate("T1059", 0.9, "a")]);
        script.insert(2, vec![candidate("T1566", 0.8, "c")]);
        let extractor = Arc::new(ScriptedExtractor {
            failing_chunks: vec![1],
            ..ScriptedExtractor::new(script)
        });

        let mut calls: Vec<(usize, usize, usize)> = Vec::new();
        let mut observer = |processed: usize, total: usize, kept: usize| {
            calls.push((processed, total, kept));
        };
        let outcome = mapper(extractor)
            .map_document(&chunks(3), &no_candidates(3), 0.5, Some(&mut observer), None)
            .await;

        assert_eq!(calls, vec![(1, 3, 1), (2, 3, 0), (3, 3, 1)]);
        assert_eq!(outcome.mappings.len(), 2);
    }

    #[tokio::test]
    async fn request_count_is_one_per_batch() {
        let extractor = Arc::new(ScriptedExtractor::new(FxHashMap::default()));
        let outcome = mapper(extractor.clone())
            .map_document(&chunks(15), &no_candidates(15), 0.5, None, None)
            .await;
        // Default batch size of 10 splits 15 chunks into two attempts.
        assert_eq!(extractor.batch_calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.request_count, 2);
        assert!(outcome.mappings.is_empty());
    }

    #[tokio::test]
    async fn cancelled_before_start_processes_nothing() {
        let signal = CancelSignal::new();
        signal.cancel();
        let extractor = Arc::new(ScriptedExtractor::new(FxHashMap::default()));

        let outcome = mapper(extractor.clone())
            .map_document(
                &chunks(3),
                &no_candidates(3),
                0.5,
                None,
                Some(signal.token()),
            )
            .await;

        assert!(outcome.cancelled);
        assert_eq!(outcome.request_count, 0);
        assert_eq!(extractor.batch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_between_batches_keeps_partial_results() {
        let mut script = FxHashMap::default();
        script.insert(0, vec![candidate("T1059", 0.9, "early")]);
        script.insert(12, vec![candidate("T1486", 0.9, "late")]);
        let extractor = Arc::new(ScriptedExtractor::new(script));

        let signal = CancelSignal::new();
        let token = signal.token();
        let mut observer = |processed: usize, _total: usize, _kept: usize| {
            if processed == 10 {
                signal.cancel();
            }
        };

        let outcome = mapper(extractor)
            .map_document(
                &chunks(15),
                &no_candidates(15),
                0.5,
                Some(&mut observer),
                Some(token),
            )
            .await;

        assert!(outcome.cancelled);
        // Only the first batch ran, so only its findings are present.
        assert_eq!(outcome.request_count, 1);
        assert_eq!(outcome.mappings.len(), 1);
        assert_eq!(outcome.mappings[0].technique_id, "T1059");
    }

    #[tokio::test]
    async fn empty_document_is_a_noop() {
        let extractor = Arc::new(ScriptedExtractor::new(FxHashMap::default()));
        let outcome = mapper(extractor)
            .map_document(&[], &[], 0.5, None, None)
            .await;
        assert!(outcome.mappings.is_empty());
        assert_eq!(outcome.request_count, 0);
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn candidate_context_reaches_the_extractor() {
        let extractor = Arc::new(ScriptedExtractor::new(FxHashMap::default()));
        let with_candidates = vec![
            vec![RetrievedCandidate {
                technique_id: "T1566".to_string(),
                name: "Phishing".to_string(),
                tactics: vec!["initial-access".to_string()],
                description: "sends deceptive messages".to_string(),
                similarity_score: 0.8,
            }],
            Vec::new(),
        ];

        mapper(extractor.clone())
            .map_document(&chunks(2), &with_candidates, 0.5, None, None)
            .await;

        let contexts = extractor.seen_contexts.lock();
        assert!(contexts[0].contains("T1566"));
        assert!(contexts[1].contains("No candidate techniques"));
    }
}
