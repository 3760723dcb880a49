//! Remote embedding client for goal text
//!
//! Speaks the OpenAI-compatible embeddings wire shape (input/model request,
//! data/index response) so any hosted provider exposing that API can back
//! semantic goal matching.

use crate::config::EmbeddingConfig;
use crate::error::{KindredError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Maximum texts per batch request
const MAX_BATCH_SIZE: usize = 128;

/// Maximum retry attempts for rate limiting
const MAX_RETRIES: usize = 3;

/// Backoff base duration in milliseconds
const BACKOFF_BASE_MS: u64 = 1000;

/// Embedding service trait defining required operations
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts (batched)
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Embedding dimensionality
    fn dimensions(&self) -> usize;

    /// Model identifier sent to the provider
    fn model_name(&self) -> &str;
}

/// Remote embedding service client
pub struct RemoteEmbeddingService {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
    dimensions: usize,
}

/// Request payload for the embeddings endpoint
#[derive(Debug, Serialize)]
struct EmbedRequest {
    input: Vec<String>,
    model: String,
}

/// Response from the embeddings endpoint
#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<Usage>,
}

/// Individual embedding in response
#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Token usage reported by the provider
#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: usize,
}

/// Error response from the provider
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

impl RemoteEmbeddingService {
    /// Create a client from provider settings
    ///
    /// `dimensions` comes from the index configuration; vectors of any other
    /// length are rejected before they can reach the index.
    pub fn from_config(config: &EmbeddingConfig, dimensions: usize) -> Result<Self> {
        if !config.is_configured() {
            return Err(KindredError::Embedding(
                "No embedding provider configured".to_string(),
            ));
        }

        if config.api_key.is_empty() {
            return Err(KindredError::Embedding(
                "Embedding API key cannot be empty".to_string(),
            ));
        }

        if dimensions == 0 {
            return Err(KindredError::Embedding(
                "Embedding dimensions must be positive".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dimensions,
        })
    }

    /// Call the embeddings endpoint with retry on transient failures
    async fn call_api_with_retry(&self, texts: &[String]) -> Result<EmbedResponse> {
        let mut retries = 0;

        loop {
            match self.call_api(texts).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if retries >= MAX_RETRIES {
                        return Err(e);
                    }

                    let retryable = match &e {
                        KindredError::RateLimited(_) => true,
                        KindredError::Http(http) => http.is_timeout(),
                        _ => false,
                    };

                    if !retryable {
                        return Err(e);
                    }

                    let backoff_ms = BACKOFF_BASE_MS * 2_u64.pow(retries as u32);
                    warn!(
                        "Embedding API call failed ({}), retrying after {}ms (attempt {}/{})",
                        e,
                        backoff_ms,
                        retries + 1,
                        MAX_RETRIES
                    );

                    sleep(Duration::from_millis(backoff_ms)).await;
                    retries += 1;
                }
            }
        }
    }

    /// Single call to the embeddings endpoint
    async fn call_api(&self, texts: &[String]) -> Result<EmbedResponse> {
        debug!(
            "Calling embedding API: {} texts, model: {}",
            texts.len(),
            self.model
        );

        let request = EmbedRequest {
            input: texts.to_vec(),
            model: self.model.clone(),
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.api_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();

        match status {
            StatusCode::OK => {
                let parsed: EmbedResponse = response.json().await?;
                debug!(
                    "Generated {} embeddings ({} tokens)",
                    parsed.data.len(),
                    parsed.usage.as_ref().map(|u| u.total_tokens).unwrap_or(0)
                );
                Ok(parsed)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(KindredError::Embedding(
                "Invalid or missing embedding API key".to_string(),
            )),
            StatusCode::TOO_MANY_REQUESTS => Err(KindredError::RateLimited(
                "Embedding provider rate limit exceeded".to_string(),
            )),
            StatusCode::BAD_REQUEST => {
                let message = match response.json::<ErrorResponse>().await {
                    Ok(parsed) => parsed
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "Bad request".to_string()),
                    Err(_) => "Bad request".to_string(),
                };
                Err(KindredError::Embedding(format!(
                    "Embedding request rejected: {}",
                    message
                )))
            }
            _ => {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                Err(KindredError::Embedding(format!(
                    "Embedding API error (status {}): {}",
                    status, body
                )))
            }
        }
    }

    /// Validate text before sending to the provider
    fn validate_text(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(KindredError::Embedding(
                "Cannot embed empty text".to_string(),
            ));
        }
        Ok(())
    }

    /// Validate an embedding returned by the provider
    fn validate_embedding(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimensions {
            return Err(KindredError::Embedding(format!(
                "Expected {} dimensions, got {}",
                self.dimensions,
                embedding.len()
            )));
        }

        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(KindredError::Embedding(
                "Embedding contains non-finite values".to_string(),
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl EmbeddingService for RemoteEmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.validate_text(text)?;

        let response = self.call_api_with_retry(&[text.to_string()]).await?;

        let data = response.data.into_iter().next().ok_or_else(|| {
            KindredError::Embedding("Provider returned no embeddings".to_string())
        })?;

        self.validate_embedding(&data.embedding)?;
        Ok(data.embedding)
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        for text in texts {
            self.validate_text(text)?;
        }

        let mut results = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(MAX_BATCH_SIZE) {
            let inputs: Vec<String> = chunk.iter().map(|t| t.to_string()).collect();
            let response = self.call_api_with_retry(&inputs).await?;

            if response.data.len() != chunk.len() {
                return Err(KindredError::Embedding(format!(
                    "Provider returned {} embeddings for {} texts",
                    response.data.len(),
                    chunk.len()
                )));
            }

            // Providers may reorder results; the index field restores input order
            let mut data = response.data;
            data.sort_by_key(|d| d.index);

            for item in data {
                self.validate_embedding(&item.embedding)?;
                results.push(item.embedding);
            }
        }

        Ok(results)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
