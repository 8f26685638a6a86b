use crate::Result;

/// A backend that turns text into fixed-dimension float vectors.
///
/// Responsibilities:
/// - Batch embedding of input texts, order-preserving
/// - Advertise its model name and output dimension so stored embeddings can
///   be checked for staleness
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts; the output has one vector per input, in
    /// input order.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Model identifier stored alongside every vector.
    fn model_name(&self) -> &str;

    /// Output vector dimension.
    fn dimension(&self) -> usize;
}
