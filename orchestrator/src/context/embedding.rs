//! Text embedding for similarity retrieval.

use anyhow::Result;
use sha2::{Digest, Sha256};

/// Turns text into a fixed-length vector.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimension(&self) -> usize;

    /// Identifies the model so cached embeddings from another model are never reused.
    fn model_id(&self) -> String;
}

/// Deterministic offline embedder: signed feature hashing of lowercase word
/// tokens and their bigrams, L2-normalized.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        let hash = u64::from_le_bytes(raw);
        let index = (hash % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        let tokens = tokenize(text);

        for token in &tokens {
            let (index, sign) = self.bucket(token);
            vector[index] += sign;
        }
        for pair in tokens.windows(2) {
            let (index, sign) = self.bucket(&format!("{} {}", pair[0], pair[1]));
            vector[index] += 0.5 * sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> String {
        format!("hashing-v1-{}", self.dimension)
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}
