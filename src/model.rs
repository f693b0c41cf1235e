use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

const CAPTION_ERROR_PREFIX: &str = "ERROR:";
const CAPTION_PLACEHOLDER: &str = "N/A";

/// One line of the captioned input batch.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub id: String,
    #[serde(default)]
    pub token_uri: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub image_caption: Option<String>,
    #[serde(default)]
    pub nft_metadata: Option<NftMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NftMetadata {
    #[serde(default)]
    pub token_uri: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl AssetRecord {
    pub fn resolved_token_uri(&self) -> Option<String> {
        let nested = self
            .nft_metadata
            .as_ref()
            .and_then(|meta| meta.token_uri.as_deref());
        non_blank(nested.or(self.token_uri.as_deref()))
    }

    pub fn resolved_name(&self) -> Option<String> {
        let nested = self.nft_metadata.as_ref().and_then(|meta| meta.name.as_deref());
        non_blank(nested.or(self.name.as_deref()))
    }

    /// Captioner error strings and merge placeholders count as no caption.
    pub fn resolved_caption(&self) -> Option<String> {
        let caption = non_blank(self.image_caption.as_deref())?;
        if caption.starts_with(CAPTION_ERROR_PREFIX) || caption == CAPTION_PLACEHOLDER {
            return None;
        }
        Some(caption)
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedVectorRecord {
    pub id: String,
    pub description_text: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichPaths {
    pub input_path: String,
    pub vectors_path: String,
    pub failures_path: String,
    pub checkpoint_path: String,
    pub manifest_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichCounts {
    pub input_lines: usize,
    pub invalid_lines: usize,
    pub skipped_processed: usize,
    pub skipped_duplicate: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errored: usize,
    pub recovered_failures: usize,
    pub failed_by_stage: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichModelInfo {
    pub model_id: String,
    pub model_name: String,
    pub embedding_dim: Option<usize>,
    pub backend: String,
    pub selector: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub input_sha256: String,
    pub last_processed_id: Option<String>,
    pub paths: EnrichPaths,
    pub model: EnrichModelInfo,
    pub counts: EnrichCounts,
    pub duration_ms: u128,
    pub warnings: Vec<String>,
}
