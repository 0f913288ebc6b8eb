//! Embedding providers.
//!
//! Everything behind [`EmbeddingProvider`] turns text into a dense vector.
//! Two remote backends (OpenAI, Ollama) cover real deployments; the hashing
//! provider gives deterministic vectors for offline runs and tests without
//! pulling in a model runtime.
//!
//! [`CachedEmbeddings`] wraps any provider with an in-memory cache so the
//! same query text is only embedded once per process.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};
use serde::Deserialize;
use serde_json::json;

use crate::config::{EmbeddingConfig, EmbeddingKind};
use crate::types::PipelineError;

const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com";
const OPENAI_DEFAULT_MODEL: &str = "text-embedding-3-small";
const OPENAI_DIMENSIONS: usize = 1536;

const OLLAMA_DEFAULT_BASE: &str = "http://localhost:11434";
const OLLAMA_DEFAULT_MODEL: &str = "nomic-embed-text";
const OLLAMA_DIMENSIONS: usize = 768;

const HASH_DIMENSIONS: usize = 384;

/// Turns text into a dense vector suitable for cosine retrieval.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, PipelineError>;

    /// Embed many texts. Backends with a batch endpoint override this; the
    /// default loops over [`EmbeddingProvider::embed`].
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }

    /// Width of the produced vectors.
    fn dimensions(&self) -> usize;

    /// Short identifier for logs.
    fn id(&self) -> &str;
}

/// Build the provider selected by configuration.
pub fn build_provider(
    config: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingProvider>, PipelineError> {
    let provider: Arc<dyn EmbeddingProvider> = match config.kind {
        EmbeddingKind::OpenAi => Arc::new(OpenAiEmbeddings::from_config(config)?),
        EmbeddingKind::Ollama => Arc::new(OllamaEmbeddings::from_config(config)?),
        EmbeddingKind::Hash => Arc::new(HashEmbeddings::new()),
    };
    Ok(provider)
}

// ── OpenAI ──────────────────────────────────────────────────────────────

pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingRow {
    embedding: Vec<f32>,
}

impl OpenAiEmbeddings {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self, PipelineError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| PipelineError::Config("OPENAI_API_KEY is not set".into()))?;
        Self::new(config, api_key)
    }

    pub fn new(config: &EmbeddingConfig, api_key: String) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_BASE.to_string()),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_MODEL.to_string()),
            api_key,
        })
    }

    async fn request(&self, input: serde_json::Value) -> Result<Vec<Vec<f32>>, PipelineError> {
        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": input }))
            .send()
            .await?
            .error_for_status()?;
        let body: OpenAiEmbeddingResponse = response.json().await?;
        Ok(body.data.into_iter().map(|row| row.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
        let mut vectors = self.request(json!(text)).await?;
        vectors
            .pop()
            .ok_or_else(|| PipelineError::Embedding("empty embedding response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.request(json!(texts)).await?;
        if vectors.len() != texts.len() {
            return Err(PipelineError::Embedding(format!(
                "requested {} embeddings, received {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        OPENAI_DIMENSIONS
    }

    fn id(&self) -> &str {
        "openai"
    }
}

// ── Ollama ──────────────────────────────────────────────────────────────

pub struct OllamaEmbeddings {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbeddings {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| OLLAMA_DEFAULT_BASE.to_string()),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| OLLAMA_DEFAULT_MODEL.to_string()),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&json!({ "model": self.model, "prompt": text }))
            .send()
            .await?
            .error_for_status()?;
        let body: OllamaEmbeddingResponse = response.json().await?;
        if body.embedding.is_empty() {
            return Err(PipelineError::Embedding("empty embedding response".into()));
        }
        Ok(body.embedding)
    }

    fn dimensions(&self) -> usize {
        OLLAMA_DIMENSIONS
    }

    fn id(&self) -> &str {
        "ollama"
    }
}

// ── Hashing fallback ────────────────────────────────────────────────────

/// Deterministic bag-of-words embedding.
///
/// Each lowercased whitespace token hashes to a bucket and a sign; the
/// resulting vector is L2-normalized. No semantic power, but identical input
/// always yields an identical vector, which is what index round-trips and
/// offline runs need.
pub struct HashEmbeddings {
    dimensions: usize,
}

impl HashEmbeddings {
    pub fn new() -> Self {
        Self {
            dimensions: HASH_DIMENSIONS,
        }
    }

    #[must_use]
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions.max(1);
        self
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut values = vec![0.0f32; self.dimensions];
        for token in text.split_whitespace() {
            let mut hasher = FxHasher::default();
            token.to_lowercase().hash(&mut hasher);
            let code = hasher.finish();
            let bucket = (code >> 1) as usize % self.dimensions;
            let sign = if code & 1 == 0 { 1.0 } else { -1.0 };
            values[bucket] += sign;
        }
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut values {
                *value /= norm;
            }
        }
        values
    }
}

impl Default for HashEmbeddings {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
        Ok(self.vectorize(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn id(&self) -> &str {
        "hash"
    }
}

// ── Caching wrapper ─────────────────────────────────────────────────────

/// Memoizes embeddings by exact input text.
pub struct CachedEmbeddings {
    inner: Arc<dyn EmbeddingProvider>,
    cache: RwLock<FxHashMap<String, Vec<f32>>>,
}

impl CachedEmbeddings {
    pub fn new(inner: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            inner,
            cache: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn cached_count(&self) -> usize {
        self.cache.read().len()
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
        if let Some(vector) = self.cache.read().get(text) {
            return Ok(vector.clone());
        }
        let vector = self.inner.embed(text).await?;
        self.cache.write().insert(text.to_string(), vector.clone());
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut missing: Vec<usize> = Vec::new();
        {
            let cache = self.cache.read();
            for (position, text) in texts.iter().enumerate() {
                match cache.get(text) {
                    Some(vector) => vectors[position] = Some(vector.clone()),
                    None => missing.push(position),
                }
            }
        }

        if !missing.is_empty() {
            let pending: Vec<String> = missing.iter().map(|&p| texts[p].clone()).collect();
            let fresh = self.inner.embed_batch(&pending).await?;
            let mut cache = self.cache.write();
            for (&position, vector) in missing.iter().zip(fresh) {
                cache.insert(texts[position].clone(), vector.clone());
                vectors[position] = Some(vector);
            }
        }

        vectors
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| PipelineError::Embedding("missing embedding in batch".into()))
            })
            .collect()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn id(&self) -> &str {
        self.inner.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embeddings_are_deterministic() {
        let provider = HashEmbeddings::new();
        let a = provider.embed("lateral movement over smb").await.unwrap();
        let b = provider.embed("lateral movement over smb").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), HASH_DIMENSIONS);
    }

    #[tokio::test]
    async fn hash_embeddings_are_normalized() {
        let provider = HashEmbeddings::new();
        let vector = provider.embed("credential dumping via lsass").await.unwrap();
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn hash_embeddings_empty_text_is_zero_vector() {
        let provider = HashEmbeddings::new();
        let vector = provider.embed("").await.unwrap();
        assert!(vector.iter().all(|v| *v == 0.0));
    }

    #[tokio::test]
    async fn cache_serves_repeat_queries_without_inner_calls() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counting(AtomicUsize);

        #[async_trait]
        impl EmbeddingProvider for Counting {
            async fn embed(&self, _text: &str) -> Result<Vec<f32>, PipelineError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(vec![1.0, 0.0])
            }
            fn dimensions(&self) -> usize {
                2
            }
            fn id(&self) -> &str {
                "counting"
            }
        }

        let inner = Arc::new(Counting(AtomicUsize::new(0)));
        let cached = CachedEmbeddings::new(inner.clone());
        cached.embed("same text").await.unwrap();
        cached.embed("same text").await.unwrap();
        cached.embed("same text").await.unwrap();
        assert_eq!(inner.0.load(Ordering::SeqCst), 1);
        assert_eq!(cached.cached_count(), 1);
    }

    #[tokio::test]
    async fn cached_batch_only_fetches_missing_texts() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counting(AtomicUsize);

        #[async_trait]
        impl EmbeddingProvider for Counting {
            async fn embed(&self, _text: &str) -> Result<Vec<f32>, PipelineError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(vec![0.5])
            }
            fn dimensions(&self) -> usize {
                1
            }
            fn id(&self) -> &str {
                "counting"
            }
        }

        let inner = Arc::new(Counting(AtomicUsize::new(0)));
        let cached = CachedEmbeddings::new(inner.clone());
        cached.embed("alpha").await.unwrap();

        let batch = vec!["alpha".to_string(), "beta".to_string()];
        let vectors = cached.embed_batch(&batch).await.unwrap();
        assert_eq!(vectors.len(), 2);
        // alpha came from the cache, only beta hit the provider.
        assert_eq!(inner.0.load(Ordering::SeqCst), 2);
    }
}
