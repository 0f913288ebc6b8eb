//! ATT&CK taxonomy acquisition.
//!
//! The enterprise matrix ships as a STIX 2.1 bundle. [`CatalogLoader`]
//! downloads it once and caches the raw JSON on disk, so repeated runs work
//! offline until `force_reload` is set. Parsing lives in [`stix`].

pub mod stix;

use std::path::PathBuf;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::fs;

use crate::config::TaxonomyConfig;
use crate::types::{PipelineError, TaxonomyEntry};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);
const BUNDLE_FILE: &str = "enterprise-attack.json";

/// Parsed technique catalog with id lookup.
#[derive(Debug, Clone)]
pub struct TechniqueCatalog {
    entries: Vec<TaxonomyEntry>,
    by_id: FxHashMap<String, usize>,
}

impl TechniqueCatalog {
    pub fn new(entries: Vec<TaxonomyEntry>) -> Self {
        let by_id = entries
            .iter()
            .enumerate()
            .map(|(position, entry)| (entry.id.clone(), position))
            .collect();
        Self { entries, by_id }
    }

    /// Entries that have not been deprecated upstream. Only these reach the
    /// vector index.
    pub fn active(&self) -> Vec<TaxonomyEntry> {
        self.entries
            .iter()
            .filter(|entry| !entry.deprecated)
            .cloned()
            .collect()
    }

    pub fn get(&self, technique_id: &str) -> Option<&TaxonomyEntry> {
        self.by_id
            .get(technique_id)
            .and_then(|position| self.entries.get(*position))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Downloads the STIX bundle and turns it into a [`TechniqueCatalog`].
pub struct CatalogLoader {
    client: reqwest::Client,
    config: TaxonomyConfig,
}

impl CatalogLoader {
    pub fn new(config: TaxonomyConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()?;
        Ok(Self { client, config })
    }

    /// Load the catalog, hitting the network only on a cache miss or when
    /// `force_reload` is set.
    pub async fn load(&self) -> Result<TechniqueCatalog, PipelineError> {
        let raw = self.fetch_bundle().await?;
        let entries = stix::parse_bundle(&raw)?;
        if entries.is_empty() {
            return Err(PipelineError::Taxonomy(
                "bundle contained no attack-pattern objects".into(),
            ));
        }
        let catalog = TechniqueCatalog::new(entries);
        tracing::info!(
            total = catalog.len(),
            active = catalog.active().len(),
            "taxonomy catalog loaded"
        );
        Ok(catalog)
    }

    fn cache_path(&self) -> PathBuf {
        self.config.data_dir.join(BUNDLE_FILE)
    }

    async fn fetch_bundle(&self) -> Result<String, PipelineError> {
        let cache_path = self.cache_path();
        if !self.config.force_reload && cache_path.exists() {
            tracing::debug!(path = %cache_path.display(), "using cached taxonomy bundle");
            return Ok(fs::read_to_string(&cache_path).await?);
        }

        tracing::info!(url = %self.config.stix_url, "downloading taxonomy bundle");
        let response = self
            .client
            .get(&self.config.stix_url)
            .send()
            .await?
            .error_for_status()?;
        let raw = response.text().await?;

        if let Some(parent) = cache_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&cache_path, &raw).await?;
        tracing::debug!(path = %cache_path.display(), bytes = raw.len(), "taxonomy bundle cached");
        Ok(raw)
    }
}
