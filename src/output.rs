//! Report rendering.
//!
//! Four formats over the same [`DocumentAnalysis`]: machine-readable JSON,
//! spreadsheet-friendly CSV, human-readable Markdown, and an ATT&CK
//! Navigator layer for visual triage. All renderers are pure string
//! builders; writing to disk or stdout is the caller's business.

use std::borrow::Cow;
use std::str::FromStr;

use serde_json::json;
use unicode_segmentation::UnicodeSegmentation;

use crate::config::ATTACK_VERSION;
use crate::pipeline::DocumentAnalysis;
use crate::types::PipelineError;

const NAVIGATOR_VERSION: &str = "5.3.0";
const LAYER_FORMAT_VERSION: &str = "4.5";
const LAYER_GRADIENT: [&str; 3] = ["#ffffff", "#42a5f5", "#ff4444"];

/// Confidence at or above this renders as "high".
const HIGH_CONFIDENCE: f32 = 0.8;
/// Confidence at or above this renders as "medium"; below is "low".
const MEDIUM_CONFIDENCE: f32 = 0.5;

/// CSV evidence cells are clipped to this many graphemes.
const CSV_EVIDENCE_LIMIT: usize = 500;
/// Navigator layer comments are clipped to this many graphemes.
const NAVIGATOR_COMMENT_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Csv,
    Markdown,
    Navigator,
}

impl OutputFormat {
    /// File extension for reports in this format. Navigator layers are
    /// JSON documents.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json | Self::Navigator => "json",
            Self::Csv => "csv",
            Self::Markdown => "md",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Markdown => "markdown",
            Self::Navigator => "navigator",
        })
    }
}

impl FromStr for OutputFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            "markdown" | "md" => Ok(Self::Markdown),
            "navigator" => Ok(Self::Navigator),
            other => Err(PipelineError::Config(format!(
                "unsupported output format '{other}' (expected json, csv, markdown, or navigator)"
            ))),
        }
    }
}

/// Render an analysis in the requested format.
pub fn render(analysis: &DocumentAnalysis, format: OutputFormat) -> Result<String, PipelineError> {
    match format {
        OutputFormat::Json => render_json(analysis),
        OutputFormat::Csv => Ok(render_csv(analysis)),
        OutputFormat::Markdown => Ok(render_markdown(analysis)),
        OutputFormat::Navigator => render_navigator(analysis),
    }
}

pub fn confidence_band(confidence: f32) -> &'static str {
    if confidence >= HIGH_CONFIDENCE {
        "high"
    } else if confidence >= MEDIUM_CONFIDENCE {
        "medium"
    } else {
        "low"
    }
}

fn report_name(analysis: &DocumentAnalysis) -> &str {
    analysis.title.as_deref().unwrap_or(&analysis.source)
}

// ── JSON ────────────────────────────────────────────────────────────────

fn render_json(analysis: &DocumentAnalysis) -> Result<String, PipelineError> {
    let mappings: Vec<serde_json::Value> = analysis
        .mappings
        .iter()
        .map(|mapping| {
            json!({
                "technique_id": mapping.technique_id,
                "technique_name": mapping.technique_name,
                "confidence": mapping.confidence,
                "band": confidence_band(mapping.confidence),
                "tactics": mapping.tactics,
                "evidence": mapping.evidence,
            })
        })
        .collect();

    let report = json!({
        "id": analysis.id,
        "source": analysis.source,
        "title": analysis.title,
        "generated_at": analysis.generated_at.to_rfc3339(),
        "attack_version": ATTACK_VERSION,
        "chunk_count": analysis.chunk_count,
        "request_count": analysis.request_count,
        "cancelled": analysis.cancelled,
        "elapsed_ms": analysis.elapsed_ms,
        "mappings": mappings,
    });
    serde_json::to_string_pretty(&report)
        .map_err(|err| PipelineError::Output(err.to_string()))
}

// ── CSV ─────────────────────────────────────────────────────────────────

fn csv_escape(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

/// Clip to a grapheme boundary so multi-byte evidence never gets cut
/// mid-character.
fn truncate_graphemes(text: &str, limit: usize) -> Cow<'_, str> {
    let mut seen = 0usize;
    for (offset, _grapheme) in text.grapheme_indices(true) {
        seen += 1;
        if seen > limit {
            return Cow::Owned(format!("{}...", &text[..offset]));
        }
    }
    Cow::Borrowed(text)
}

fn render_csv(analysis: &DocumentAnalysis) -> String {
    let mut out = String::from("technique_id,technique_name,confidence,band,tactics,evidence\n");
    for mapping in &analysis.mappings {
        let evidence = truncate_graphemes(&mapping.evidence, CSV_EVIDENCE_LIMIT);
        let row = [
            Cow::Borrowed(mapping.technique_id.as_str()),
            csv_escape(&mapping.technique_name),
            Cow::Owned(format!("{:.2}", mapping.confidence)),
            Cow::Borrowed(confidence_band(mapping.confidence)),
            csv_escape(&mapping.tactics.join(",")).into_owned().into(),
            csv_escape(&evidence).into_owned().into(),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

// ── Markdown ────────────────────────────────────────────────────────────

fn confidence_bar(confidence: f32) -> String {
    let filled = ((confidence * 10.0).round() as usize).min(10);
    format!("{}{}", "█".repeat(filled), "░".repeat(10 - filled))
}

fn markdown_cell(text: &str) -> String {
    text.replace('|', "\\|").replace(['\n', '\r'], " ")
}

fn render_markdown(analysis: &DocumentAnalysis) -> String {
    let mut out = format!("# ATT&CK Mapping: {}\n\n", report_name(analysis));
    out.push_str(&format!("- Source: {}\n", analysis.source));
    out.push_str(&format!(
        "- Generated: {}\n",
        analysis.generated_at.format("%Y-%m-%d %H:%M UTC")
    ));
    out.push_str(&format!("- ATT&CK version: {ATTACK_VERSION}\n"));
    out.push_str(&format!("- Chunks analyzed: {}\n", analysis.chunk_count));
    out.push_str(&format!(
        "- Extraction requests: {}\n",
        analysis.request_count
    ));
    out.push_str(&format!("- Techniques found: {}\n", analysis.mappings.len()));
    if analysis.cancelled {
        out.push_str("- Processing was cancelled before completion; results are partial.\n");
    }

    if analysis.mappings.is_empty() {
        out.push_str("\nNo techniques were mapped.\n");
        return out;
    }

    // Group under each mapping's first tactic, in order of first appearance.
    let mut tactic_order: Vec<&str> = Vec::new();
    for mapping in &analysis.mappings {
        let tactic = mapping
            .tactics
            .first()
            .map(String::as_str)
            .unwrap_or("untagged");
        if !tactic_order.contains(&tactic) {
            tactic_order.push(tactic);
        }
    }

    out.push_str("\n## Techniques by Tactic\n");
    for tactic in tactic_order {
        out.push_str(&format!("\n### {tactic}\n\n"));
        out.push_str("| Technique | Confidence | Evidence |\n");
        out.push_str("|---|---|---|\n");
        for mapping in &analysis.mappings {
            let first = mapping
                .tactics
                .first()
                .map(String::as_str)
                .unwrap_or("untagged");
            if first != tactic {
                continue;
            }
            out.push_str(&format!(
                "| {} {} | {} {:.2} ({}) | {} |\n",
                mapping.technique_id,
                markdown_cell(&mapping.technique_name),
                confidence_bar(mapping.confidence),
                mapping.confidence,
                confidence_band(mapping.confidence),
                markdown_cell(&mapping.evidence),
            ));
        }
    }
    out
}

// ── Navigator layer ─────────────────────────────────────────────────────

fn render_navigator(analysis: &DocumentAnalysis) -> Result<String, PipelineError> {
    let techniques: Vec<serde_json::Value> = analysis
        .mappings
        .iter()
        .map(|mapping| {
            json!({
                "techniqueID": mapping.technique_id,
                "score": (mapping.confidence * 100.0).round() as u32,
                "comment": truncate_graphemes(&mapping.evidence, NAVIGATOR_COMMENT_LIMIT),
            })
        })
        .collect();

    let layer = json!({
        "name": format!("ATT&CK mapping: {}", report_name(analysis)),
        "versions": {
            "attack": ATTACK_VERSION,
            "navigator": NAVIGATOR_VERSION,
            "layer": LAYER_FORMAT_VERSION,
        },
        "domain": "enterprise-attack",
        "description": format!(
            "Automated technique mapping for {} ({} chunks)",
            analysis.source, analysis.chunk_count
        ),
        "sorting": 3,
        "techniques": techniques,
        "gradient": {
            "colors": LAYER_GRADIENT,
            "minValue": 0,
            "maxValue": 100,
        },
    });
    serde_json::to_string_pretty(&layer).map_err(|err| PipelineError::Output(err.to_string()))
}
