//! End-to-end pipeline tests over stub seams.
//!
//! The index and extractor are replaced with deterministic stubs and the
//! whitespace tokenizer pins chunk boundaries, so these tests exercise the
//! real segmentation, retrieval, batching, and consolidation wiring without
//! network access.

mod common;
use common::*;

use std::sync::Arc;

use attackmap::cancel::CancelSignal;
use attackmap::pipeline::{AnalysisOptions, MappingPipeline};
use attackmap::segmenter::WhitespaceTokenizer;

async fn stub_pipeline(extractor: Arc<KeywordExtractor>) -> MappingPipeline {
    let index = Arc::new(StaticIndex::new(vec![
        hit("T1059", "Command and Scripting Interpreter", "execution", 0.2),
        hit("T1566", "Phishing", "initial-access", 0.4),
        hit("T1003", "OS Credential Dumping", "credential-access", 0.6),
    ]));
    MappingPipeline::builder(offline_config())
        .with_index(index)
        .with_extractor(extractor)
        .with_tokenizer(Arc::new(WhitespaceTokenizer))
        .build()
        .await
        .unwrap()
}

fn keyword_rules() -> Vec<(&'static str, attackmap::types::MappingCandidate)> {
    vec![
        (
            "PowerShell",
            candidate("T1059", 0.85, "ran PowerShell loaders", &["execution"]),
        ),
        (
            "phishing",
            candidate("T1566", 0.7, "phishing email delivery", &["initial-access"]),
        ),
    ]
}

#[tokio::test]
async fn maps_and_consolidates_across_chunks() {
    let extractor = Arc::new(KeywordExtractor::new(keyword_rules()));
    let pipeline = stub_pipeline(extractor.clone()).await;

    let analysis = pipeline
        .analyze_text(
            &sample_report(),
            Some("report.txt"),
            AnalysisOptions::default(),
        )
        .await;

    assert_eq!(analysis.chunk_count, 3);
    assert_eq!(analysis.request_count, 1, "three chunks fit one batch");
    assert!(!analysis.cancelled);
    assert_eq!(analysis.source, "report.txt");

    // One record per technique, highest confidence first.
    assert_eq!(analysis.mappings.len(), 2);
    assert_eq!(analysis.mappings[0].technique_id, "T1059");
    assert_eq!(analysis.mappings[0].confidence, 0.85);
    assert_eq!(analysis.mappings[1].technique_id, "T1566");

    // T1059 was sighted in two chunks; both passages are kept.
    assert_eq!(
        analysis.mappings[0].evidence,
        "ran PowerShell loaders | ran PowerShell loaders"
    );

    // Every chunk received a formatted candidate context from the index.
    let contexts = extractor.contexts.lock();
    assert_eq!(contexts.len(), 3);
    for context in contexts.iter() {
        assert!(context.contains("T1059"), "context: {context}");
        assert!(context.contains("tactics: execution"), "context: {context}");
    }
}

#[tokio::test]
async fn progress_fires_once_per_chunk_in_order() {
    let extractor = Arc::new(KeywordExtractor::new(keyword_rules()));
    let pipeline = stub_pipeline(extractor).await;

    let mut seen: Vec<(usize, usize, usize)> = Vec::new();
    let mut progress = |done: usize, total: usize, found: usize| {
        seen.push((done, total, found));
    };
    let analysis = pipeline
        .analyze_text(
            &sample_report(),
            None,
            AnalysisOptions {
                progress: Some(&mut progress),
                ..AnalysisOptions::default()
            },
        )
        .await;

    assert_eq!(analysis.chunk_count, 3);
    assert_eq!(seen.len(), 3);
    for (position, (done, total, _)) in seen.iter().enumerate() {
        assert_eq!(*done, position + 1);
        assert_eq!(*total, 3);
    }
    // Chunks 0 and 2 mention PowerShell, chunk 1 mentions phishing.
    let found: Vec<usize> = seen.iter().map(|(_, _, found)| *found).collect();
    assert_eq!(found, vec![1, 1, 1]);
}

#[tokio::test]
async fn weak_candidates_fall_below_the_confidence_floor() {
    let extractor = Arc::new(KeywordExtractor::new(vec![
        (
            "PowerShell",
            candidate("T1059", 0.85, "strong sighting", &["execution"]),
        ),
        (
            "beaconing",
            candidate("T1071", 0.3, "too weak to keep", &["command-and-control"]),
        ),
    ]));
    let pipeline = stub_pipeline(extractor).await;

    let analysis = pipeline
        .analyze_text(&sample_report(), None, AnalysisOptions::default())
        .await;

    let ids: Vec<&str> = analysis
        .mappings
        .iter()
        .map(|m| m.technique_id.as_str())
        .collect();
    assert_eq!(ids, vec!["T1059"]);
}

#[tokio::test]
async fn cancellation_between_batches_keeps_partial_results() {
    let extractor = Arc::new(KeywordExtractor::new(keyword_rules()));

    let index = Arc::new(StaticIndex::new(vec![hit(
        "T1059",
        "Command and Scripting Interpreter",
        "execution",
        0.2,
    )]));
    let mut config = offline_config();
    config.batch_size = 1;
    let pipeline = MappingPipeline::builder(config)
        .with_index(index)
        .with_extractor(extractor)
        .with_tokenizer(Arc::new(WhitespaceTokenizer))
        .build()
        .await
        .unwrap();

    let signal = CancelSignal::new();
    let token = signal.token();
    let mut progress = |done: usize, _total: usize, _found: usize| {
        if done == 1 {
            signal.cancel();
        }
    };
    let analysis = pipeline
        .analyze_text(
            &sample_report(),
            None,
            AnalysisOptions {
                progress: Some(&mut progress),
                cancel: Some(token),
                ..AnalysisOptions::default()
            },
        )
        .await;

    assert!(analysis.cancelled);
    // Only the first single-chunk batch ran.
    assert_eq!(analysis.request_count, 1);
    assert_eq!(analysis.mappings.len(), 1);
    assert_eq!(analysis.mappings[0].technique_id, "T1059");
}

#[tokio::test]
async fn tactic_filter_narrows_the_candidate_context() {
    let extractor = Arc::new(KeywordExtractor::new(keyword_rules()));
    let pipeline = stub_pipeline(extractor.clone()).await;

    pipeline
        .analyze_text(
            &sample_report(),
            None,
            AnalysisOptions {
                tactic_filter: Some(vec!["credential-access".to_string()]),
                ..AnalysisOptions::default()
            },
        )
        .await;

    let contexts = extractor.contexts.lock();
    assert_eq!(contexts.len(), 3);
    for context in contexts.iter() {
        assert!(context.contains("T1003"), "context: {context}");
        assert!(!context.contains("T1059"), "context: {context}");
        assert!(!context.contains("T1566"), "context: {context}");
    }
}

#[tokio::test]
async fn empty_document_yields_no_mappings() {
    let extractor = Arc::new(KeywordExtractor::new(keyword_rules()));
    let pipeline = stub_pipeline(extractor).await;

    let analysis = pipeline
        .analyze_text("", None, AnalysisOptions::default())
        .await;

    assert_eq!(analysis.chunk_count, 1);
    assert!(analysis.mappings.is_empty());
    assert!(!analysis.cancelled);
    assert_eq!(analysis.source, "inline text");
}

#[tokio::test]
async fn analyze_reads_local_text_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("incident.txt");
    std::fs::write(&path, sample_report()).unwrap();

    let extractor = Arc::new(KeywordExtractor::new(keyword_rules()));
    let pipeline = stub_pipeline(extractor).await;

    let analysis = pipeline
        .analyze(path.to_str().unwrap(), AnalysisOptions::default())
        .await
        .unwrap();

    assert_eq!(analysis.title.as_deref(), Some("incident"));
    assert_eq!(analysis.chunk_count, 3);
    assert!(
        analysis
            .mappings
            .iter()
            .any(|m| m.technique_id == "T1059")
    );
}
