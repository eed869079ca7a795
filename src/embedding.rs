//! Embedding provider abstraction and HTTP implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and one HTTP client that speaks
//! two wire formats:
//! - **ollama**: `POST {base_url}/api/embed` with `{model, input}`.
//! - **openai**: `POST {base_url}/embeddings` with `{model, input}`,
//!   authenticated by `OPENAI_API_KEY`.
//!
//! Also provides the vector utilities used by embedding storage and
//! semantic search:
//! - [`cosine_similarity`]: similarity over the shared prefix of two vectors
//! - [`vec_to_blob`] / [`blob_to_vec`]: little-endian `f32` BLOB encoding
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingSettings;
use crate::error::{ArielError, Result};

const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";
const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1";

/// A black box that turns text into vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    /// Embed a batch of texts with `model`, returning one vector per input
    /// in input order.
    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single query text.
pub async fn embed_query(
    provider: &dyn EmbeddingProvider,
    model: &str,
    text: &str,
) -> Result<Vec<f32>> {
    provider
        .embed(model, &[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ArielError::Embedding("Empty embedding response".to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireFormat {
    Ollama,
    OpenAi,
}

/// HTTP embedding client for Ollama and OpenAI-compatible servers.
pub struct HttpEmbeddingProvider {
    format: WireFormat,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl HttpEmbeddingProvider {
    pub fn new(settings: &EmbeddingSettings) -> Result<Self> {
        let (format, default_url, api_key) = match settings.provider.as_str() {
            "ollama" => (WireFormat::Ollama, OLLAMA_DEFAULT_URL, None),
            "openai" => {
                let key = std::env::var("OPENAI_API_KEY").map_err(|_| {
                    ArielError::Configuration(
                        "OPENAI_API_KEY environment variable not set".to_string(),
                    )
                })?;
                (WireFormat::OpenAi, OPENAI_DEFAULT_URL, Some(key))
            }
            other => {
                return Err(ArielError::Configuration(format!(
                    "Unknown embedding provider: {}",
                    other
                )))
            }
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        Ok(Self {
            format,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| default_url.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            client,
            max_retries: settings.max_retries,
            retry_base_delay: Duration::from_secs(1),
        })
    }

    /// Override the first backoff step (later steps double it).
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    fn endpoint(&self) -> String {
        match self.format {
            WireFormat::Ollama => format!("{}/api/embed", self.base_url),
            WireFormat::OpenAi => format!("{}/embeddings", self.base_url),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn provider_name(&self) -> &str {
        match self.format {
            WireFormat::Ollama => "ollama",
            WireFormat::OpenAi => "openai",
        }
    }

    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": model,
            "input": texts,
        });
        let url = self.endpoint();
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = self.retry_base_delay * (1u32 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.post(&url).json(&body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        let vectors = match self.format {
                            WireFormat::Ollama => parse_ollama_response(&json)?,
                            WireFormat::OpenAi => parse_openai_response(&json)?,
                        };
                        if vectors.len() != texts.len() {
                            return Err(ArielError::Embedding(format!(
                                "expected {} embeddings, got {}",
                                texts.len(),
                                vectors.len()
                            )));
                        }
                        return Ok(vectors);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = ArielError::Embedding(format!(
                        "{} API error {}: {}",
                        self.provider_name(),
                        status,
                        body_text
                    ));

                    // Rate limited or server error: retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(attempt, %status, "embedding request failed, retrying");
                        last_err = Some(err);
                        continue;
                    }

                    return Err(err);
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "embedding connection error");
                    last_err = Some(ArielError::Embedding(format!(
                        "connection error (is the embedding server running at {}?): {}",
                        self.base_url, e
                    )));
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| ArielError::Embedding("embedding failed after retries".to_string())))
    }
}

fn parse_vector(value: &serde_json::Value) -> Result<Vec<f32>> {
    Ok(value
        .as_array()
        .ok_or_else(|| ArielError::Embedding("embedding is not an array".to_string()))?
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

/// Extracts `data[].embedding`, ordered by `data[].index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ArielError::Embedding("Invalid OpenAI response: missing data array".to_string()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item.get("embedding").ok_or_else(|| {
            ArielError::Embedding("Invalid OpenAI response: missing embedding".to_string())
        })?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, parse_vector(embedding)?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            ArielError::Embedding("Invalid Ollama response: missing embeddings array".to_string())
        })?
        .iter()
        .map(parse_vector)
        .collect()
}

/// Build the provider for the `text_embedding` module settings.
pub fn create_provider(settings: &EmbeddingSettings) -> Result<Arc<dyn EmbeddingProvider>> {
    Ok(Arc::new(HttpEmbeddingProvider::new(settings)?))
}

// ============ Vector utilities ============

/// Cosine similarity over the shared prefix of `a` and `b`.
///
/// Returns 0.0 when either vector is empty or has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for i in 0..n {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

/// Encode a vector as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vec.len() * 4);
    for &val in vec {
        blob.extend_from_slice(&val.to_le_bytes());
    }
    blob
}

/// Decode a BLOB written by [`vec_to_blob`]. Trailing bytes are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
