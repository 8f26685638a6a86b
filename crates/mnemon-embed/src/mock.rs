use crate::Result;
use crate::traits::EmbeddingProvider;
use sha2::{Digest, Sha256};

/// Deterministic offline embeddings: the vector is derived from a hash of
/// the input text, so identical texts embed identically and similar runs are
/// reproducible in tests.
pub struct MockEmbeddingProvider {
    dimension: usize,
}

impl MockEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

impl EmbeddingProvider for MockEmbeddingProvider {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = Vec::with_capacity(self.dimension);
                let mut counter = 0u32;
                while vector.len() < self.dimension {
                    let mut hasher = Sha256::new();
                    hasher.update(text.as_bytes());
                    hasher.update(counter.to_be_bytes());
                    let digest = hasher.finalize();
                    for chunk in digest.chunks_exact(4) {
                        if vector.len() == self.dimension {
                            break;
                        }
                        let raw = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                        // Map to [-1, 1].
                        vector.push((raw as f32 / u32::MAX as f32) * 2.0 - 1.0);
                    }
                    counter += 1;
                }
                vector
            })
            .collect())
    }

    fn model_name(&self) -> &str {
        "mock-embed"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
