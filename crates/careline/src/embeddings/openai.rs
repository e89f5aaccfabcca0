//! Remote embeddings over the OpenAI `/embeddings` endpoint.

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::num::NonZeroUsize;
use std::sync::Arc;

use super::EmbeddingModel;
use crate::config::{EmbeddingConfig, LLMSettings};
use crate::error::{Error, Result};
use crate::llm::simple_external::{parse_json_response, post_json};

pub struct OpenAIEmbedder {
    client: Client,
    api_key: String,
    endpoint: String,
    model: String,
    dimension: usize,
    cache: Arc<RwLock<lru::LruCache<String, Vec<f32>>>>,
}

impl OpenAIEmbedder {
    pub fn new(llm: &LLMSettings, config: &EmbeddingConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| Error::External(format!("embedding client: {}", e)))?;
        let capacity = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            client,
            api_key: llm.api_key.clone(),
            endpoint: format!("{}/embeddings", llm.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            dimension: config.dimension,
            cache: Arc::new(RwLock::new(lru::LruCache::new(capacity))),
        })
    }

    async fn request(&self, inputs: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        let body = json!({ "model": self.model, "input": inputs });
        let response = post_json(&self.client, &self.endpoint, &self.api_key, &body).await?;
        let mut parsed: EmbeddingResponse = parse_json_response(response, &self.endpoint).await?;
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    fn check_dimension(&self, v: &[f32]) -> Result<()> {
        if v.len() != self.dimension {
            return Err(Error::External(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                v.len()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EmbeddingModel for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let cached = self.cache.write().get(text).cloned();
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let mut vectors = self.request(&[text]).await?;
        let embedding = vectors
            .pop()
            .ok_or_else(|| Error::External("embedding response had no data".into()))?;
        self.check_dimension(&embedding)?;

        self.cache.write().put(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let inputs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let vectors = self.request(&inputs).await?;
        if vectors.len() != texts.len() {
            return Err(Error::External(format!(
                "embedding response returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }
        for v in &vectors {
            self.check_dimension(v)?;
        }
        tracing::debug!(count = vectors.len(), "Embedded document batch");
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}
