//! STIX bundle parsing for the ATT&CK taxonomy.
//!
//! Only the fields the pipeline needs are modeled; everything else in the
//! bundle is ignored by serde. An `attack-pattern` object becomes a
//! [`TaxonomyEntry`] when it carries a `mitre-attack` external reference
//! with an external id.

use serde::Deserialize;

use crate::types::{PipelineError, TaxonomyEntry};

#[derive(Debug, Deserialize)]
struct StixBundle {
    objects: Vec<StixObject>,
}

#[derive(Debug, Deserialize)]
struct StixObject {
    #[serde(rename = "type")]
    object_type: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    external_references: Vec<ExternalReference>,
    #[serde(default)]
    kill_chain_phases: Vec<KillChainPhase>,
    #[serde(default, rename = "x_mitre_deprecated")]
    deprecated: bool,
}

#[derive(Debug, Deserialize)]
struct ExternalReference {
    source_name: String,
    #[serde(default)]
    external_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KillChainPhase {
    kill_chain_name: String,
    phase_name: String,
}

/// Parse a raw STIX bundle into taxonomy entries.
///
/// Deprecated techniques are kept with their flag set; filtering happens at
/// the catalog layer so callers can still inspect them.
pub fn parse_bundle(raw: &str) -> Result<Vec<TaxonomyEntry>, PipelineError> {
    let bundle: StixBundle = serde_json::from_str(raw)?;
    Ok(bundle
        .objects
        .into_iter()
        .filter_map(entry_from_object)
        .collect())
}

fn entry_from_object(object: StixObject) -> Option<TaxonomyEntry> {
    if object.object_type != "attack-pattern" {
        return None;
    }
    let id = object
        .external_references
        .iter()
        .find(|reference| reference.source_name == "mitre-attack")
        .and_then(|reference| reference.external_id.clone())?;
    let name = object.name?;
    let tactics = object
        .kill_chain_phases
        .iter()
        .filter(|phase| phase.kill_chain_name == "mitre-attack")
        .map(|phase| phase.phase_name.clone())
        .collect();

    Some(TaxonomyEntry {
        id,
        name,
        tactics,
        description: object.description.unwrap_or_default(),
        deprecated: object.deprecated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bundle() -> String {
        serde_json::json!({
            "type": "bundle",
            "objects": [
                {
                    "type": "attack-pattern",
                    "name": "Phishing",
                    "description": "Adversaries may send phishing messages.",
                    "external_references": [
                        {"source_name": "mitre-attack", "external_id": "T1566"},
                        {"source_name": "capec", "external_id": "CAPEC-98"}
                    ],
                    "kill_chain_phases": [
                        {"kill_chain_name": "mitre-attack", "phase_name": "initial-access"},
                        {"kill_chain_name": "other-chain", "phase_name": "ignored"}
                    ]
                },
                {
                    "type": "attack-pattern",
                    "name": "Spearphishing Attachment",
                    "description": "A sub-technique of phishing.",
                    "x_mitre_deprecated": true,
                    "external_references": [
                        {"source_name": "mitre-attack", "external_id": "T1566.001"}
                    ],
                    "kill_chain_phases": [
                        {"kill_chain_name": "mitre-attack", "phase_name": "initial-access"}
                    ]
                },
                {
                    "type": "intrusion-set",
                    "name": "Not A Technique"
                },
                {
                    "type": "attack-pattern",
                    "name": "No External Id",
                    "external_references": [
                        {"source_name": "capec", "external_id": "CAPEC-1"}
                    ]
                }
            ]
        })
        .to_string()
    }

    #[test]
    fn parses_attack_patterns_only() {
        let entries = parse_bundle(&sample_bundle()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "T1566");
        assert_eq!(entries[1].id, "T1566.001");
    }

    #[test]
    fn keeps_mitre_kill_chain_phases_only() {
        let entries = parse_bundle(&sample_bundle()).unwrap();
        assert_eq!(entries[0].tactics, vec!["initial-access".to_string()]);
    }

    #[test]
    fn carries_deprecated_flag() {
        let entries = parse_bundle(&sample_bundle()).unwrap();
        assert!(!entries[0].deprecated);
        assert!(entries[1].deprecated);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(parse_bundle("{not stix").is_err());
    }

    #[test]
    fn missing_description_becomes_empty() {
        let raw = serde_json::json!({
            "objects": [{
                "type": "attack-pattern",
                "name": "Bare",
                "external_references": [
                    {"source_name": "mitre-attack", "external_id": "T9999"}
                ]
            }]
        })
        .to_string();
        let entries = parse_bundle(&raw).unwrap();
        assert_eq!(entries[0].description, "");
        assert!(entries[0].tactics.is_empty());
    }
}
