use std::sync::Arc;

use crate::embeddings::EmbeddingModel;
use crate::error::Result;
use crate::storage::Store;
use crate::types::{DocumentFilter, RetrievalHit};

/// Dense retrieval over indexed chunks with a substring fallback.
#[derive(Clone)]
pub struct VectorRetriever {
    store: Store,
    embedder: Arc<dyn EmbeddingModel>,
}

impl VectorRetriever {
    pub fn new(store: Store, embedder: Arc<dyn EmbeddingModel>) -> Self {
        Self { store, embedder }
    }

    /// Hits with cosine similarity strictly above `threshold`, best first.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        threshold: f32,
        filter: &DocumentFilter,
    ) -> Result<Vec<RetrievalHit>> {
        if query.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let embedding = self.embedder.embed(query).await?;
        let hits = self
            .store
            .vector_search(embedding, k, threshold, filter.clone())
            .await?;
        tracing::debug!(
            query_chars = query.chars().count(),
            k,
            threshold,
            hits = hits.len(),
            top = hits.first().map(|h| h.similarity),
            "Vector retrieval"
        );
        Ok(hits)
    }

    pub async fn retrieve_by_keywords(
        &self,
        keywords: &[String],
        k: usize,
        filter: &DocumentFilter,
    ) -> Result<Vec<RetrievalHit>> {
        self.store
            .keyword_search(keywords.to_vec(), k, filter.clone())
            .await
    }

    /// Vector retrieval, falling back to keywords when it finds nothing or
    /// the embedding provider is down.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        threshold: f32,
        filter: &DocumentFilter,
    ) -> Result<Vec<RetrievalHit>> {
        match self.retrieve(query, k, threshold, filter).await {
            Ok(hits) if !hits.is_empty() => return Ok(hits),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Vector retrieval failed, falling back to keywords"),
        }
        let keywords: Vec<String> = query.split_whitespace().map(String::from).collect();
        self.retrieve_by_keywords(&keywords, k, filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seed_document, ConceptEmbedder};

    #[tokio::test]
    async fn retrieves_above_threshold_only() {
        let store = Store::open_in_memory().unwrap();
        let embedder: Arc<dyn EmbeddingModel> = Arc::new(ConceptEmbedder::new());
        seed_document(&store, embedder.as_ref(), "戒癮門診", "凱旋醫院 戒癮 治療 門診", "article").await;
        seed_document(&store, embedder.as_ref(), "天氣", "今天 晴天 出門", "article").await;

        let retriever = VectorRetriever::new(store, embedder);
        let hits = retriever
            .retrieve("戒癮 治療", 5, 0.45, &DocumentFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "戒癮門診");
        assert!(hits[0].similarity > 0.45);
    }

    #[tokio::test]
    async fn filter_excludes_other_categories() {
        let store = Store::open_in_memory().unwrap();
        let embedder: Arc<dyn EmbeddingModel> = Arc::new(ConceptEmbedder::new());
        seed_document(&store, embedder.as_ref(), "戒癮門診", "戒癮 治療", "article").await;
        let retriever = VectorRetriever::new(store, embedder);
        let filter = DocumentFilter {
            category: Some("contacts".into()),
            ..DocumentFilter::default()
        };
        assert!(retriever.retrieve("戒癮 治療", 5, 0.0, &filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_falls_back_to_keywords() {
        let store = Store::open_in_memory().unwrap();
        let embedder: Arc<dyn EmbeddingModel> = Arc::new(ConceptEmbedder::new());
        seed_document(&store, embedder.as_ref(), "喵喵專區", "關於喵喵的說明", "article").await;
        let retriever = VectorRetriever::new(store, embedder);
        // No concept overlap, so only the substring match can find it.
        let hits = retriever
            .search("喵喵", 5, 0.3, &DocumentFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].similarity, 1.0);
    }
}
