//! Pipeline configuration.
//!
//! Settings resolve in order (later wins):
//!
//! 1. Compiled defaults
//! 2. Environment variables (`ATTACKMAP_*`, loaded through dotenvy)
//! 3. Caller overrides (CLI flags or direct field assignment)
//!
//! Provider credentials are not stored here: extractor and embedding clients
//! read their API keys from the conventional environment variables
//! (`OPENAI_API_KEY`, `ANTHROPIC_API_KEY`) at construction time.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::PipelineError;

/// Default STIX bundle for the enterprise ATT&CK matrix.
pub const DEFAULT_STIX_URL: &str =
    "https://raw.githubusercontent.com/mitre/cti/master/enterprise-attack/enterprise-attack.json";

/// ATT&CK release the bundled defaults target.
pub const ATTACK_VERSION: &str = "18.1";

/// Which extraction backend to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    OpenAi,
    Anthropic,
    Ollama,
}

impl Default for ExtractorKind {
    fn default() -> Self {
        Self::OpenAi
    }
}

impl FromStr for ExtractorKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(PipelineError::Config(format!(
                "unsupported extractor '{other}' (expected openai, anthropic, or ollama)"
            ))),
        }
    }
}

/// Which embedding backend to use for index population and queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingKind {
    OpenAi,
    Ollama,
    /// Deterministic local hashing, for offline runs and tests.
    Hash,
}

impl Default for EmbeddingKind {
    fn default() -> Self {
        Self::OpenAi
    }
}

impl FromStr for EmbeddingKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            "hash" => Ok(Self::Hash),
            other => Err(PipelineError::Config(format!(
                "unsupported embedding provider '{other}' (expected openai, ollama, or hash)"
            ))),
        }
    }
}

/// Extraction backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    pub kind: ExtractorKind,
    /// Model identifier; `None` selects the backend's default model
    pub model: Option<String>,
    /// Endpoint override, mainly for self-hosted or proxied backends
    pub base_url: Option<String>,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            kind: ExtractorKind::default(),
            model: None,
            base_url: None,
            timeout_secs: 120,
        }
    }
}

/// Embedding backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub kind: EmbeddingKind,
    /// Model identifier; `None` selects the backend's default model
    pub model: Option<String>,
    /// Endpoint override
    pub base_url: Option<String>,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            kind: EmbeddingKind::default(),
            model: None,
            base_url: None,
            timeout_secs: 60,
        }
    }
}

/// Taxonomy acquisition and index persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonomyConfig {
    /// STIX bundle location
    pub stix_url: String,
    /// Directory for the cached bundle and the technique index
    pub data_dir: PathBuf,
    /// Re-download and re-embed even when cached artifacts exist
    pub force_reload: bool,
}

impl Default for TaxonomyConfig {
    fn default() -> Self {
        Self {
            stix_url: DEFAULT_STIX_URL.to_string(),
            data_dir: PathBuf::from("attackmap_data"),
            force_reload: false,
        }
    }
}

impl TaxonomyConfig {
    /// Path of the sqlite technique index inside `data_dir`.
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join("techniques.db")
    }
}

/// Top-level pipeline tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Target chunk size in tokens
    pub chunk_size: usize,
    /// Token budget carried over between consecutive chunks
    pub chunk_overlap: usize,
    /// Candidates requested from the index per chunk
    pub top_k: usize,
    /// Minimum similarity for parent techniques
    pub similarity_threshold: f32,
    /// Minimum similarity for sub-techniques (must not be looser)
    pub subtechnique_threshold: f32,
    /// Minimum extractor confidence kept during consolidation
    pub min_confidence: f32,
    /// Chunks per bulk extraction call
    pub batch_size: usize,
    /// Concurrent index queries during batch retrieval
    pub retrieval_concurrency: usize,
    /// Concurrent extractor calls inside one bulk request
    pub extraction_concurrency: usize,
    /// Character budget for the candidate context handed to the extractor
    pub context_max_chars: usize,
    pub extractor: ExtractorConfig,
    pub embedding: EmbeddingConfig,
    pub taxonomy: TaxonomyConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            top_k: 10,
            similarity_threshold: 0.3,
            subtechnique_threshold: 0.5,
            min_confidence: 0.5,
            batch_size: 10,
            retrieval_concurrency: 8,
            extraction_concurrency: 4,
            context_max_chars: 8_000,
            extractor: ExtractorConfig::default(),
            embedding: EmbeddingConfig::default(),
            taxonomy: TaxonomyConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Check cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.chunk_size == 0 {
            return Err(PipelineError::Config("chunk_size must be at least 1".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(PipelineError::Config(format!(
                "chunk_overlap {} must be smaller than chunk_size {}",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.top_k == 0 {
            return Err(PipelineError::Config("top_k must be at least 1".into()));
        }
        for (name, value) in [
            ("similarity_threshold", self.similarity_threshold),
            ("subtechnique_threshold", self.subtechnique_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(PipelineError::Config(format!(
                    "{name} {value} must lie in (0, 1]"
                )));
            }
        }
        if self.subtechnique_threshold < self.similarity_threshold {
            return Err(PipelineError::Config(format!(
                "subtechnique_threshold {} must be at least similarity_threshold {}",
                self.subtechnique_threshold, self.similarity_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(PipelineError::Config(format!(
                "min_confidence {} must lie in [0, 1]",
                self.min_confidence
            )));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::Config("batch_size must be at least 1".into()));
        }
        if self.retrieval_concurrency == 0 || self.extraction_concurrency == 0 {
            return Err(PipelineError::Config(
                "concurrency limits must be at least 1".into(),
            ));
        }
        if self.context_max_chars == 0 {
            return Err(PipelineError::Config(
                "context_max_chars must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Builder resolving defaults and environment overrides.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    base: PipelineConfig,
    use_env: bool,
}

impl ConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: PipelineConfig::default(),
            use_env: false,
        }
    }

    /// Start from an existing configuration instead of the defaults.
    #[must_use]
    pub fn from_config(config: PipelineConfig) -> Self {
        Self {
            base: config,
            use_env: false,
        }
    }

    /// Enable `ATTACKMAP_*` environment overrides, e.g.:
    /// - `ATTACKMAP_CHUNK_SIZE=750`
    /// - `ATTACKMAP_EXTRACTOR=anthropic`
    /// - `ATTACKMAP_DATA_DIR=/var/cache/attackmap`
    #[must_use]
    pub fn with_env(mut self) -> Self {
        self.use_env = true;
        self
    }

    /// Resolve and validate the final configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] for unparseable overrides or
    /// inconsistent values.
    pub fn build(mut self) -> Result<PipelineConfig, PipelineError> {
        if self.use_env {
            dotenvy::dotenv().ok();

            apply_env("ATTACKMAP_CHUNK_SIZE", &mut self.base.chunk_size)?;
            apply_env("ATTACKMAP_CHUNK_OVERLAP", &mut self.base.chunk_overlap)?;
            apply_env("ATTACKMAP_TOP_K", &mut self.base.top_k)?;
            apply_env(
                "ATTACKMAP_SIMILARITY_THRESHOLD",
                &mut self.base.similarity_threshold,
            )?;
            apply_env(
                "ATTACKMAP_SUBTECHNIQUE_THRESHOLD",
                &mut self.base.subtechnique_threshold,
            )?;
            apply_env("ATTACKMAP_MIN_CONFIDENCE", &mut self.base.min_confidence)?;
            apply_env("ATTACKMAP_BATCH_SIZE", &mut self.base.batch_size)?;
            apply_env("ATTACKMAP_EXTRACTOR", &mut self.base.extractor.kind)?;
            apply_env_opt("ATTACKMAP_EXTRACTOR_MODEL", &mut self.base.extractor.model);
            apply_env_opt(
                "ATTACKMAP_EXTRACTOR_BASE_URL",
                &mut self.base.extractor.base_url,
            );
            apply_env("ATTACKMAP_EMBEDDINGS", &mut self.base.embedding.kind)?;
            apply_env_opt("ATTACKMAP_EMBEDDING_MODEL", &mut self.base.embedding.model);
            apply_env_opt(
                "ATTACKMAP_EMBEDDING_BASE_URL",
                &mut self.base.embedding.base_url,
            );
            if let Ok(url) = std::env::var("ATTACKMAP_STIX_URL") {
                self.base.taxonomy.stix_url = url;
            }
            if let Ok(dir) = std::env::var("ATTACKMAP_DATA_DIR") {
                self.base.taxonomy.data_dir = PathBuf::from(dir);
            }
        }

        self.base.validate()?;
        Ok(self.base)
    }
}

fn apply_env<T>(key: &str, slot: &mut T) -> Result<(), PipelineError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(key) {
        *slot = raw.parse().map_err(|err| {
            PipelineError::Config(format!("cannot parse {key}='{raw}': {err}"))
        })?;
    }
    Ok(())
}

fn apply_env_opt(key: &str, slot: &mut Option<String>) {
    if let Ok(raw) = std::env::var(key) {
        *slot = Some(raw);
    }
}
