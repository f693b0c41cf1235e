use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Embedder, OPENAI_BACKEND, SemanticModelConfig};

/// Blocking client for OpenAI-compatible `/embeddings` endpoints.
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    config: SemanticModelConfig,
    max_retries: usize,
}

impl OpenAiEmbedder {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        dimensions: Option<usize>,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing OpenAI API key");
        anyhow::ensure!(!model.trim().is_empty(), "missing OpenAI model name");

        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid OpenAI API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build embeddings HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            config: SemanticModelConfig {
                model_id: model.trim().to_string(),
                model_name: model.trim().to_string(),
                dimensions,
                normalization: "provider".to_string(),
                backend: OPENAI_BACKEND.to_string(),
            },
            max_retries: max_retries.max(1),
        })
    }

    fn should_retry(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    fn retry_backoff(attempt: usize) -> Duration {
        let capped = attempt.min(5) as u32;
        Duration::from_millis(500 * (1 << capped))
    }
}

impl Embedder for OpenAiEmbedder {
    fn config(&self) -> &SemanticModelConfig {
        &self.config
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.config.model_name,
            input: [text],
            dimensions: self.config.dimensions,
        };

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let retries_left = attempt < self.max_retries;

            match self.client.post(&self.endpoint).json(&request).send() {
                Ok(resp) if resp.status().is_success() => {
                    let parsed: EmbeddingResponse = resp
                        .json()
                        .context("failed to parse embeddings response")?;
                    return parsed
                        .data
                        .into_iter()
                        .next()
                        .map(|entry| entry.embedding)
                        .context("embeddings response contained no vectors");
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp
                        .text()
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if Self::should_retry(status) && retries_left {
                        warn!(%status, attempt, "embeddings request rejected; retrying");
                        thread::sleep(Self::retry_backoff(attempt));
                        continue;
                    }
                    anyhow::bail!("embeddings request failed ({status}): {body}");
                }
                Err(err) => {
                    if (err.is_timeout() || err.is_connect()) && retries_left {
                        warn!(error = %err, attempt, "embeddings request errored; retrying");
                        thread::sleep(Self::retry_backoff(attempt));
                        continue;
                    }
                    return Err(err).context("failed to call embeddings endpoint");
                }
            }
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}
