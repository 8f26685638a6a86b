mod error;
mod http;
mod mock;
mod traits;

pub use error::{Error, Result};
pub use http::HttpEmbeddingProvider;
pub use mock::MockEmbeddingProvider;
pub use traits::EmbeddingProvider;

use serde::{Deserialize, Serialize};

/// Backend selection, enumerated by configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum EmbeddingBackend {
    /// Local or remote HTTP endpoint speaking the embeddings JSON shape.
    Http {
        endpoint: String,
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    },
    /// Deterministic in-process vectors, for tests and offline runs.
    Mock {
        #[serde(default = "default_mock_dimension")]
        dimension: usize,
    },
}

fn default_mock_dimension() -> usize {
    64
}

/// Instantiate the configured backend.
pub fn build_provider(backend: &EmbeddingBackend) -> Box<dyn EmbeddingProvider> {
    match backend {
        EmbeddingBackend::Http {
            endpoint,
            model,
            api_key,
        } => Box::new(HttpEmbeddingProvider::new(
            endpoint.clone(),
            model.clone(),
            api_key.clone(),
        )),
        EmbeddingBackend::Mock { dimension } => {
            Box::new(MockEmbeddingProvider::new(*dimension))
        }
    }
}
