//! Embedding provider interface.
//!
//! The embedding model itself is out of scope (an external collaborator);
//! this trait is the narrow seam the extractor and prompt assembly call
//! through to get a query/document vector, mirroring the `CostLedger`
//! injection pattern in `vesper_llm::router`.

use async_trait::async_trait;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    /// Batched form. Default implementation just calls `embed` sequentially;
    /// real providers (e.g. a batching HTTP endpoint) should override this.
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}
