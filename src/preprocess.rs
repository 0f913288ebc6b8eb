//! Document text cleanup and sanity checks ahead of segmentation.
//!
//! Fetched documents arrive with markup residue, entity escapes, and ragged
//! whitespace. [`clean`] canonicalizes the text so sentence boundaries are
//! trustworthy; [`validate`] flags inputs not worth running the pipeline on.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

/// Minimum character count below which a document is rejected.
pub const DEFAULT_MIN_LENGTH: usize = 100;

static ENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&(#x?[0-9a-fA-F]+|[a-zA-Z]+);").unwrap());
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Canonicalize raw document text.
///
/// Entities are decoded before tags are stripped, so escaped markup is
/// removed rather than leaking through as literal angle brackets. Whitespace
/// runs collapse to single spaces and the result is trimmed.
pub fn clean(text: &str) -> String {
    let decoded = decode_entities(text);
    let untagged = strip_tags(&decoded);
    let collapsed = WS_RE.replace_all(&untagged, " ");
    collapsed.trim().to_string()
}

/// Decode named and numeric HTML entities.
///
/// Returns `Cow::Borrowed` when nothing needs decoding. Unknown named
/// entities are preserved verbatim.
fn decode_entities(input: &str) -> Cow<'_, str> {
    if !input.contains('&') {
        return Cow::Borrowed(input);
    }

    let result = ENTITY_RE.replace_all(input, |caps: &regex::Captures<'_>| {
        let inner = &caps[1];
        if let Some(hex) = inner.strip_prefix("#x").or_else(|| inner.strip_prefix("#X")) {
            u32::from_str_radix(hex, 16)
                .ok()
                .and_then(char::from_u32)
                .map_or_else(|| caps[0].to_string(), |c| c.to_string())
        } else if let Some(dec) = inner.strip_prefix('#') {
            dec.parse::<u32>()
                .ok()
                .and_then(char::from_u32)
                .map_or_else(|| caps[0].to_string(), |c| c.to_string())
        } else {
            match inner {
                "amp" => "&".to_string(),
                "lt" => "<".to_string(),
                "gt" => ">".to_string(),
                "quot" => "\"".to_string(),
                "apos" => "'".to_string(),
                "nbsp" => " ".to_string(),
                "mdash" => "\u{2014}".to_string(),
                "ndash" => "\u{2013}".to_string(),
                "hellip" => "\u{2026}".to_string(),
                _ => caps[0].to_string(),
            }
        }
    });

    match result {
        Cow::Borrowed(_) => Cow::Borrowed(input),
        Cow::Owned(s) if s == input => Cow::Borrowed(input),
        Cow::Owned(s) => Cow::Owned(s),
    }
}

/// Replace markup tags with spaces so adjacent words stay separated.
fn strip_tags(input: &str) -> Cow<'_, str> {
    if !input.contains('<') {
        return Cow::Borrowed(input);
    }
    TAG_RE.replace_all(input, " ")
}

/// Outcome of a pre-segmentation content check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentCheck {
    /// Usable content, possibly with a non-fatal observation.
    Valid { warning: Option<String> },
    /// Content the pipeline should not be run on.
    Invalid { reason: String },
}

impl ContentCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, ContentCheck::Valid { .. })
    }

    /// The warning or rejection message, when one exists.
    pub fn note(&self) -> Option<&str> {
        match self {
            ContentCheck::Valid { warning } => warning.as_deref(),
            ContentCheck::Invalid { reason } => Some(reason),
        }
    }
}

/// Judge whether cleaned text is worth processing.
///
/// Empty and sub-`min_length` documents are rejected. Documents that are
/// mostly non-ASCII pass with a warning: the extraction prompt is tuned for
/// English reporting, so results may be weak but are not refused.
pub fn validate(text: &str, min_length: usize) -> ContentCheck {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ContentCheck::Invalid {
            reason: "empty content".to_string(),
        };
    }
    if trimmed.chars().count() < min_length {
        return ContentCheck::Invalid {
            reason: format!("content shorter than {min_length} characters"),
        };
    }

    let total = text.chars().count();
    let non_ascii = text.chars().filter(|c| !c.is_ascii()).count();
    if non_ascii * 2 > total {
        return ContentCheck::Valid {
            warning: Some("content is mostly non-ASCII".to_string()),
        };
    }

    ContentCheck::Valid { warning: None }
}
