//! Embedding backends used by the enrichment pipeline's embed stage.

mod local;
mod openai;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub use local::LocalHashEmbedder;
pub use openai::OpenAiEmbedder;

pub const DEFAULT_MODEL_ID: &str = "miniLM-L6-v2-local-v1";
pub const DEFAULT_MODEL_NAME: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub const DEFAULT_EMBEDDING_DIM: usize = 384;
pub const DEFAULT_NORMALIZATION: &str = "l2";
pub const LOCAL_HASH_BACKEND: &str = "local-hash-v1";
pub const OPENAI_BACKEND: &str = "openai-compatible";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticModelConfig {
    pub model_id: String,
    pub model_name: String,
    /// `None` lets the first returned vector fix the dimension for the run.
    pub dimensions: Option<usize>,
    pub normalization: String,
    pub backend: String,
}

/// Text-to-vector capability. Vectors from one embedder share a dimension.
pub trait Embedder {
    fn config(&self) -> &SemanticModelConfig;

    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

pub fn resolve_local_model_config(
    model_id: &str,
    dimensions: Option<usize>,
) -> SemanticModelConfig {
    let trimmed = model_id.trim();
    let resolved_id = if trimmed.is_empty() {
        DEFAULT_MODEL_ID
    } else {
        trimmed
    };

    let model_name = if resolved_id == DEFAULT_MODEL_ID {
        DEFAULT_MODEL_NAME
    } else {
        resolved_id
    };

    SemanticModelConfig {
        model_id: resolved_id.to_string(),
        model_name: model_name.to_string(),
        dimensions: Some(dimensions.unwrap_or(DEFAULT_EMBEDDING_DIM)),
        normalization: DEFAULT_NORMALIZATION.to_string(),
        backend: LOCAL_HASH_BACKEND.to_string(),
    }
}

pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<&str>>().join(" ")
}
