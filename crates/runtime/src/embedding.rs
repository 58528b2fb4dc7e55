//! Concrete `EmbeddingProvider` backed by Ollama's `/api/embeddings`
//! endpoint. Failures are swallowed to `Err` rather than panicking — the
//! system is designed to run fine with embeddings simply absent.

use async_trait::async_trait;
use std::time::Duration;
use vesper_thinker::EmbeddingProvider;

pub struct OllamaEmbeddingProvider {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaEmbeddingProvider {
    pub fn new(base_url: impl AsRef<str>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(5)).build().unwrap_or_default();
        let url = format!("{}/api/embeddings", base_url.as_ref().trim_end_matches('/'));
        Self { client, url, model: model.into() }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddingProvider {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let body = serde_json::json!({ "model": self.model, "prompt": text });
        let response = self.client.post(&self.url).json(&body).send().await?;
        let json: serde_json::Value = response.json().await?;
        let embedding: Vec<f32> = json["embedding"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("ollama embeddings response missing `embedding` array"))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();
        if embedding.is_empty() {
            anyhow::bail!("ollama returned an empty embedding");
        }
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_is_built_from_base_url() {
        let provider = OllamaEmbeddingProvider::new("http://localhost:11434/", "nomic-embed-text");
        assert_eq!(provider.url, "http://localhost:11434/api/embeddings");
    }
}
