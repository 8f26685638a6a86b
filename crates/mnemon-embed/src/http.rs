use crate::traits::EmbeddingProvider;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

/// Embeddings over HTTP. Works against local servers (ollama-style) and
/// hosted APIs that accept `{"model": ..., "input": [...]}` and answer with
/// `{"data": [{"embedding": [...]}, ...]}`.
pub struct HttpEmbeddingProvider {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dimension: OnceLock<usize>,
    client: reqwest::blocking::Client,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedItem>,
}

#[derive(Deserialize)]
struct EmbedItem {
    embedding: Vec<f32>,
}

impl HttpEmbeddingProvider {
    pub fn new(endpoint: String, model: String, api_key: Option<String>) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            endpoint,
            model,
            api_key,
            dimension: OnceLock::new(),
            client,
        }
    }

    fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut request = self.client.post(&self.endpoint).json(&EmbedRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::Response(format!(
                "HTTP {} from embedding backend: {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: EmbedResponse = response.json()?;
        if parsed.data.len() != texts.len() {
            return Err(Error::Response(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
    }
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let vectors = self.request(texts)?;

        if let Some(first) = vectors.first() {
            let dimension = *self.dimension.get_or_init(|| first.len());
            for vector in &vectors {
                if vector.len() != dimension {
                    return Err(Error::Response(format!(
                        "inconsistent embedding dimension: {} vs {}",
                        vector.len(),
                        dimension
                    )));
                }
            }
        }

        Ok(vectors)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension.get().copied().unwrap_or(0)
    }
}
