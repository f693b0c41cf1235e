use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use anyhow::Result;

use super::{DEFAULT_EMBEDDING_DIM, Embedder, SemanticModelConfig, normalize_whitespace};

const MIN_DIMENSIONS: usize = 8;

/// Feature-hashing embedder: words and adjacent word pairs are hashed into signed buckets, then
/// the vector is L2-normalized.
///
/// Buckets come from `DefaultHasher`, whose output is only stable within one Rust toolchain.
/// Vectors written by binaries built with different toolchains are not comparable.
pub struct LocalHashEmbedder {
    config: SemanticModelConfig,
    dimensions: usize,
}

impl LocalHashEmbedder {
    pub fn new(mut config: SemanticModelConfig) -> Self {
        let dimensions = config
            .dimensions
            .unwrap_or(DEFAULT_EMBEDDING_DIM)
            .max(MIN_DIMENSIONS);
        config.dimensions = Some(dimensions);
        Self { config, dimensions }
    }
}

impl Embedder for LocalHashEmbedder {
    fn config(&self) -> &SemanticModelConfig {
        &self.config
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0_f32; self.dimensions];

        for feature in hashed_features(text) {
            let hash = stable_hash(&feature);
            let index = (hash as usize) % self.dimensions;
            let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            let weight = 1.0 + (((hash >> 48) & 0xFF) as f32 / 255.0);
            vector[index] += sign * weight;
        }

        l2_normalize(&mut vector);
        Ok(vector)
    }
}

fn stable_hash(value: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

fn hashed_features(text: &str) -> Vec<String> {
    let words = normalize_whitespace(text)
        .split(' ')
        .map(|word| {
            word.chars()
                .filter(|character| character.is_alphanumeric())
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .filter(|word| !word.is_empty())
        .collect::<Vec<String>>();

    let mut features = Vec::<String>::with_capacity(words.len() * 2);
    for pair in words.windows(2) {
        features.push(format!("w:{}", pair[0]));
        features.push(format!("b:{}_{}", pair[0], pair[1]));
    }
    if let Some(last) = words.last() {
        features.push(format!("w:{last}"));
    }
    features
}

fn l2_normalize(values: &mut [f32]) {
    let norm = values
        .iter()
        .map(|value| f64::from(*value) * f64::from(*value))
        .sum::<f64>()
        .sqrt() as f32;

    if norm > 0.0 {
        for value in values {
            *value /= norm;
        }
    }
}
