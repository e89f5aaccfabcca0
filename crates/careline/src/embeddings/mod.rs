pub mod openai;

use async_trait::async_trait;

use crate::error::Result;

pub use openai::OpenAIEmbedder;

/// Unified embedding model trait
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Embed one text into a vector of length [`EmbeddingModel::dimension`].
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Batch embed documents for ingestion
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Embedding vector dimension
    fn dimension(&self) -> usize;
}
