//! HTTP extractor backends.
//!
//! All three speak the same [`Extractor`] contract: build the shared
//! prompt, call the backend's completion endpoint with retries on transient
//! statuses, and hand the reply to [`prompt::parse_mappings`]. Batch
//! extraction fans individual calls out with bounded concurrency.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{ChunkOutcome, ExtractionRequest, Extractor, extract_concurrently, prompt};
use crate::config::{ExtractorConfig, ExtractorKind};
use crate::types::PipelineError;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 1000;
const RETRYABLE_STATUSES: [u16; 7] = [408, 429, 500, 502, 503, 504, 529];

const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com";
const OPENAI_DEFAULT_MODEL: &str = "gpt-5-nano";

const ANTHROPIC_DEFAULT_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_MAX_TOKENS: u32 = 4096;

const OLLAMA_DEFAULT_BASE: &str = "http://localhost:11434";
const OLLAMA_DEFAULT_MODEL: &str = "llama2";

/// Build the extractor selected by configuration.
pub fn build_extractor(
    config: &ExtractorConfig,
    concurrency: usize,
) -> Result<Arc<dyn Extractor>, PipelineError> {
    let extractor: Arc<dyn Extractor> = match config.kind {
        ExtractorKind::OpenAi => Arc::new(OpenAiExtractor::from_config(config, concurrency)?),
        ExtractorKind::Anthropic => {
            Arc::new(AnthropicExtractor::from_config(config, concurrency)?)
        }
        ExtractorKind::Ollama => Arc::new(OllamaExtractor::from_config(config, concurrency)?),
    };
    Ok(extractor)
}

/// Send a request, retrying transient failures with exponential backoff.
///
/// `build` is invoked once per attempt so the request body is rebuilt
/// rather than cloned.
async fn send_with_retry<F>(provider: &str, build: F) -> Result<reqwest::Response, PipelineError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut backoff = Duration::from_millis(INITIAL_BACKOFF_MS);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match build().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                if RETRYABLE_STATUSES.contains(&status.as_u16()) && attempt <= MAX_RETRIES {
                    tracing::warn!(
                        provider,
                        status = status.as_u16(),
                        attempt,
                        "retrying extraction request"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    continue;
                }
                let body: String = response
                    .text()
                    .await
                    .unwrap_or_default()
                    .chars()
                    .take(300)
                    .collect();
                return Err(PipelineError::Extraction(format!(
                    "{provider} returned {status}: {body}"
                )));
            }
            Err(err) => {
                if attempt <= MAX_RETRIES {
                    tracing::warn!(
                        provider,
                        error = %err,
                        attempt,
                        "retrying extraction request after transport error"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    continue;
                }
                return Err(err.into());
            }
        }
    }
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client, PipelineError> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

// ── OpenAI ──────────────────────────────────────────────────────────────

pub struct OpenAiExtractor {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    concurrency: usize,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

impl OpenAiExtractor {
    pub fn from_config(config: &ExtractorConfig, concurrency: usize) -> Result<Self, PipelineError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| PipelineError::Config("OPENAI_API_KEY is not set".into()))?;
        Self::new(config, api_key, concurrency)
    }

    pub fn new(
        config: &ExtractorConfig,
        api_key: String,
        concurrency: usize,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_BASE.to_string()),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_MODEL.to_string()),
            api_key,
            concurrency,
        })
    }
}

#[async_trait]
impl Extractor for OpenAiExtractor {
    async fn extract(&self, request: &ExtractionRequest) -> ChunkOutcome {
        let user_prompt = prompt::build_user_prompt(&request.text, &request.context);
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": prompt::SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt},
            ],
            "response_format": {"type": "json_object"},
        });
        let url = format!("{}/v1/chat/completions", self.base_url);

        let response = send_with_retry(self.name(), || {
            self.client.post(&url).bearer_auth(&self.api_key).json(&body)
        })
        .await?;
        let completion: ChatCompletionResponse = response.json().await?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| PipelineError::Extraction("completion had no choices".into()))?;
        tracing::debug!(chunk_index = request.chunk_index, "extraction response received");
        prompt::parse_mappings(&content)
    }

    async fn extract_batch(
        &self,
        requests: &[ExtractionRequest],
    ) -> Result<Vec<ChunkOutcome>, PipelineError> {
        Ok(extract_concurrently(self, requests, self.concurrency).await)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// ── Anthropic ───────────────────────────────────────────────────────────

pub struct AnthropicExtractor {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    concurrency: usize,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

impl AnthropicExtractor {
    pub fn from_config(config: &ExtractorConfig, concurrency: usize) -> Result<Self, PipelineError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| PipelineError::Config("ANTHROPIC_API_KEY is not set".into()))?;
        Self::new(config, api_key, concurrency)
    }

    pub fn new(
        config: &ExtractorConfig,
        api_key: String,
        concurrency: usize,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| ANTHROPIC_DEFAULT_BASE.to_string()),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| ANTHROPIC_DEFAULT_MODEL.to_string()),
            api_key,
            concurrency,
        })
    }
}

#[async_trait]
impl Extractor for AnthropicExtractor {
    async fn extract(&self, request: &ExtractionRequest) -> ChunkOutcome {
        let user_prompt = prompt::build_user_prompt(&request.text, &request.context);
        let body = json!({
            "model": self.model,
            "max_tokens": ANTHROPIC_MAX_TOKENS,
            "system": prompt::SYSTEM_PROMPT,
            "messages": [
                {"role": "user", "content": user_prompt},
            ],
        });
        let url = format!("{}/v1/messages", self.base_url);

        let response = send_with_retry(self.name(), || {
            self.client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
        })
        .await?;
        let message: MessagesResponse = response.json().await?;
        let content = message
            .content
            .into_iter()
            .map(|block| block.text)
            .find(|text| !text.is_empty())
            .ok_or_else(|| PipelineError::Extraction("message had no text content".into()))?;
        tracing::debug!(chunk_index = request.chunk_index, "extraction response received");
        prompt::parse_mappings(&content)
    }

    async fn extract_batch(
        &self,
        requests: &[ExtractionRequest],
    ) -> Result<Vec<ChunkOutcome>, PipelineError> {
        Ok(extract_concurrently(self, requests, self.concurrency).await)
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

// ── Ollama ──────────────────────────────────────────────────────────────

pub struct OllamaExtractor {
    client: reqwest::Client,
    base_url: String,
    model: String,
    concurrency: usize,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaExtractor {
    pub fn from_config(config: &ExtractorConfig, concurrency: usize) -> Result<Self, PipelineError> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| OLLAMA_DEFAULT_BASE.to_string()),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| OLLAMA_DEFAULT_MODEL.to_string()),
            concurrency,
        })
    }
}

#[async_trait]
impl Extractor for OllamaExtractor {
    async fn extract(&self, request: &ExtractionRequest) -> ChunkOutcome {
        let user_prompt = prompt::build_user_prompt(&request.text, &request.context);
        let full_prompt = format!("{}\n\n{user_prompt}", prompt::SYSTEM_PROMPT);
        let body = json!({
            "model": self.model,
            "prompt": full_prompt,
            "format": "json",
            "stream": false,
        });
        let url = format!("{}/api/generate", self.base_url);

        let response = send_with_retry(self.name(), || self.client.post(&url).json(&body)).await?;
        let generated: GenerateResponse = response.json().await?;
        tracing::debug!(chunk_index = request.chunk_index, "extraction response received");
        prompt::parse_mappings(&generated.response)
    }

    async fn extract_batch(
        &self,
        requests: &[ExtractionRequest],
    ) -> Result<Vec<ChunkOutcome>, PipelineError> {
        Ok(extract_concurrently(self, requests, self.concurrency).await)
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
