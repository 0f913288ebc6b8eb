//! Prompt assembly and response parsing shared by all extractor backends.
//!
//! Models are asked for strict JSON, but replies still arrive fenced in
//! markdown or wrapped in prose often enough that parsing strips fences and
//! falls back to the outermost brace pair before deserializing. Individual
//! records that fail validation are dropped with a warning rather than
//! failing the chunk.

use serde::Deserialize;

use crate::types::{MappingCandidate, PipelineError};

pub const SYSTEM_PROMPT: &str = "\
You are a cybersecurity analyst who maps threat intelligence text onto MITRE ATT&CK techniques.
You are given a report excerpt and a list of candidate techniques. Identify which candidates the excerpt actually describes. Do not invent technique ids that are not in the candidate list.
Respond with JSON only, no prose, matching this schema:
{\"mappings\": [{\"technique_id\": \"T1059\", \"technique_name\": \"Command and Scripting Interpreter\", \"confidence\": 0.8, \"evidence\": \"short verbatim quote from the excerpt\", \"tactics\": [\"execution\"]}]}
confidence must be between 0 and 1. evidence must quote the excerpt. Respond with {\"mappings\": []} when no candidate applies.";

/// Build the user message for one chunk.
pub fn build_user_prompt(text: &str, context: &str) -> String {
    format!(
        "Candidate techniques:\n\n{context}\n\nReport excerpt:\n\n{text}\n\n\
         Map the excerpt onto the candidate techniques."
    )
}

#[derive(Debug, Deserialize)]
struct ExtractionPayload {
    #[serde(default)]
    mappings: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawMapping {
    technique_id: String,
    technique_name: String,
    confidence: f32,
    #[serde(default)]
    evidence: String,
    #[serde(default)]
    tactics: Vec<String>,
}

/// Strip markdown fences and surrounding prose down to the JSON object.
fn extract_json_block(raw: &str) -> &str {
    let trimmed = raw.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.strip_suffix("```").unwrap_or(rest))
        .unwrap_or(trimmed)
        .trim();
    match (unfenced.find('{'), unfenced.rfind('}')) {
        (Some(start), Some(end)) if start < end => &unfenced[start..=end],
        _ => unfenced,
    }
}

/// Parse a model reply into validated mapping candidates.
///
/// Returns `Err` only when the reply holds no parseable JSON object at all;
/// malformed or out-of-range records inside a parseable reply are skipped.
pub fn parse_mappings(raw: &str) -> Result<Vec<MappingCandidate>, PipelineError> {
    let payload: ExtractionPayload =
        serde_json::from_str(extract_json_block(raw)).map_err(|err| {
            PipelineError::Extraction(format!("unparseable extraction response: {err}"))
        })?;

    let mut mappings = Vec::with_capacity(payload.mappings.len());
    for value in payload.mappings {
        let record: RawMapping = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed extraction record");
                continue;
            }
        };
        match MappingCandidate::new(
            record.technique_id,
            record.technique_name,
            record.confidence,
            record.evidence,
            record.tactics,
        ) {
            Ok(mapping) => mappings.push(mapping),
            Err(err) => {
                tracing::warn!(error = %err, "dropping out-of-range extraction record");
            }
        }
    }
    Ok(mappings)
}
