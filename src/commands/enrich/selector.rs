use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub const DEFAULT_SELECTOR_ENDPOINT: &str = "http://localhost:11434/api/generate";
pub const DEFAULT_SELECTOR_MODEL: &str = "llama3";
pub const DEFAULT_SELECTOR_TIMEOUT_SECS: u64 = 30;

const SELECTION_INSTRUCTION: &str = "You are a data extraction assistant. Given a JSON NFT metadata, return only field names useful for description.";
const LIST_MARKERS: &[char] = &['-', '*', '•'];

/// Chooses which top-level metadata fields are worth describing.
///
/// Best-effort: implementations swallow their own failures and answer with an empty list.
pub trait FieldSelector {
    fn label(&self) -> String;

    fn select_fields(&self, metadata: &Map<String, Value>) -> Vec<String>;
}

/// Field selection through an Ollama-style `/api/generate` endpoint.
pub struct OllamaFieldSelector {
    client: Client,
    endpoint: String,
    model: String,
}

impl OllamaFieldSelector {
    pub fn new(endpoint: &str, model: &str, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(!model.trim().is_empty(), "missing field selector model name");
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build field selector HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            model: model.trim().to_string(),
        })
    }

    fn request_fields(&self, metadata: &Map<String, Value>) -> Result<Vec<String>> {
        let serialized = serde_json::to_string_pretty(metadata)
            .context("failed to serialize metadata for field selection")?;
        let prompt = format!("{SELECTION_INSTRUCTION}\n{serialized}");
        let body = GenerateRequest {
            model: &self.model,
            prompt: &prompt,
            system: "",
            stream: false,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .context("failed to call field selector")?
            .error_for_status()
            .context("field selector returned an error status")?;
        let parsed: GenerateResponse = resp
            .json()
            .context("failed to parse field selector response")?;

        Ok(parse_field_list(&parsed.response))
    }
}

impl FieldSelector for OllamaFieldSelector {
    fn label(&self) -> String {
        format!("ollama:{}", self.model)
    }

    fn select_fields(&self, metadata: &Map<String, Value>) -> Vec<String> {
        match self.request_fields(metadata) {
            Ok(fields) => {
                debug!(fields = ?fields, "field selector answered");
                fields
            }
            Err(err) => {
                warn!(error = %err, "field selection failed; continuing without fields");
                Vec::new()
            }
        }
    }
}

/// Selector used when field selection is switched off.
pub struct DisabledFieldSelector;

impl FieldSelector for DisabledFieldSelector {
    fn label(&self) -> String {
        "off".to_string()
    }

    fn select_fields(&self, _metadata: &Map<String, Value>) -> Vec<String> {
        Vec::new()
    }
}

/// Splits a free-text model answer into field names, one per non-empty line.
pub fn parse_field_list(response: &str) -> Vec<String> {
    response
        .lines()
        .map(|line| {
            line.trim()
                .trim_matches(|character: char| {
                    LIST_MARKERS.contains(&character) || character.is_whitespace()
                })
                .to_string()
        })
        .filter(|field| !field.is_empty())
        .collect()
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}
