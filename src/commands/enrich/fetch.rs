use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

pub const DEFAULT_FETCH_RETRIES: usize = 3;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_FETCH_RETRY_DELAY_MS: u64 = 1000;

/// Retrieves a JSON document. `None` means the address was unfetchable.
pub trait MetadataFetcher {
    fn fetch_json(&self, address: &str) -> Option<Value>;
}

#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    pub retries: usize,
    pub timeout: Duration,
    pub retry_delay: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_FETCH_RETRIES,
            timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            retry_delay: Duration::from_millis(DEFAULT_FETCH_RETRY_DELAY_MS),
        }
    }
}

pub struct HttpMetadataFetcher {
    client: Client,
    policy: FetchPolicy,
}

impl HttpMetadataFetcher {
    pub fn new(policy: FetchPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(policy.timeout)
            .build()
            .context("failed to build metadata HTTP client")?;
        Ok(Self {
            client,
            policy: FetchPolicy {
                retries: policy.retries.max(1),
                ..policy
            },
        })
    }

    fn attempt(&self, address: &str) -> Result<Value, String> {
        let resp = self
            .client
            .get(address)
            .send()
            .map_err(|err| format!("transport error: {err}"))?;

        let status = resp.status();
        if status != StatusCode::OK {
            return Err(format!("unexpected status {status}"));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !is_json_content_type(&content_type) {
            return Err(format!("non-json content type '{content_type}'"));
        }

        resp.json::<Value>()
            .map_err(|err| format!("invalid json body: {err}"))
    }
}

impl MetadataFetcher for HttpMetadataFetcher {
    fn fetch_json(&self, address: &str) -> Option<Value> {
        for attempt in 1..=self.policy.retries {
            match self.attempt(address) {
                Ok(value) => {
                    debug!(address, attempt, "fetched metadata");
                    return Some(value);
                }
                Err(reason) => {
                    warn!(
                        address,
                        attempt,
                        retries = self.policy.retries,
                        %reason,
                        "metadata fetch attempt failed"
                    );
                    if attempt < self.policy.retries {
                        thread::sleep(self.policy.retry_delay);
                    }
                }
            }
        }
        None
    }
}

/// Accepts `application/json` and structured `+json` media types, ignoring parameters.
pub fn is_json_content_type(raw: &str) -> bool {
    let essence = raw
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "application/json"
        || (essence.starts_with("application/") && essence.ends_with("+json"))
}
