//! Knowledge base management: documents, their chunks and embeddings.
//!
//! Every write keeps the chunk set of a document equal to what the chunker
//! produces for its current title and content.

pub mod authority_sync;
pub mod contacts;
pub mod drug;

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::embeddings::EmbeddingModel;
use crate::error::{Error, Result};
use crate::processing::TextChunker;
use crate::rag::VectorRetriever;
use crate::storage::Store;
use crate::types::{
    DocumentFilter, DocumentUpdate, KnowledgeChunk, KnowledgeDocument, NewDocument, Paging,
    RetrievalHit,
};

#[derive(Clone)]
pub struct KnowledgeManager {
    store: Store,
    embedder: Arc<dyn EmbeddingModel>,
    chunker: TextChunker,
    retriever: VectorRetriever,
    search_threshold: f32,
}

impl KnowledgeManager {
    pub fn new(store: Store, embedder: Arc<dyn EmbeddingModel>, config: &AppConfig) -> Self {
        Self {
            retriever: VectorRetriever::new(store.clone(), embedder.clone()),
            store,
            embedder,
            chunker: TextChunker::from_config(&config.chunking),
            search_threshold: config.retrieval.search_threshold,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Create a document with its chunks in one transaction.
    pub async fn add_document(&self, new: NewDocument) -> Result<KnowledgeDocument> {
        validate(&new.title, &new.content)?;
        let now = Utc::now();
        let doc = KnowledgeDocument {
            id: Uuid::new_v4(),
            title: new.title.trim().to_string(),
            content: new.content.clone(),
            source: new.source.clone(),
            category: new.category.clone(),
            lang: new.lang.clone(),
            published_date: new.published_date,
            created_at: now,
            updated_at: now,
        };
        let chunks = self.build_chunks(&doc).await?;
        let chunk_count = chunks.len();
        self.store.insert_document(doc.clone(), chunks).await?;

        tracing::info!(
            doc_id = %doc.id,
            title = %doc.title,
            source = %doc.source,
            chunks = chunk_count,
            "Document indexed"
        );
        Ok(doc)
    }

    /// Apply a partial update. A changed title or content replaces the whole
    /// chunk set in the same transaction.
    pub async fn update_document(&self, id: Uuid, update: DocumentUpdate) -> Result<KnowledgeDocument> {
        let mut doc = self
            .store
            .get_document(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("document {}", id)))?;

        let mut rechunk = false;
        if let Some(title) = update.title {
            rechunk |= title.trim() != doc.title;
            doc.title = title.trim().to_string();
        }
        if let Some(content) = update.content {
            rechunk |= content != doc.content;
            doc.content = content;
        }
        if let Some(source) = update.source {
            rechunk |= source != doc.source;
            doc.source = source;
        }
        if let Some(category) = update.category {
            rechunk |= category != doc.category;
            doc.category = category;
        }
        if let Some(lang) = update.lang {
            rechunk |= lang != doc.lang;
            doc.lang = lang;
        }
        if update.published_date.is_some() {
            rechunk |= update.published_date != doc.published_date;
            doc.published_date = update.published_date;
        }
        validate(&doc.title, &doc.content)?;
        doc.updated_at = Utc::now();

        // Chunks carry a copy of the document fields in their metadata.
        let chunks = if rechunk {
            Some(self.build_chunks(&doc).await?)
        } else {
            None
        };
        let rebuilt = chunks.as_ref().map(Vec::len);
        self.store.update_document(doc.clone(), chunks).await?;

        tracing::info!(doc_id = %id, rechunked = ?rebuilt, "Document updated");
        Ok(doc)
    }

    pub async fn delete_document(&self, id: Uuid) -> Result<bool> {
        let deleted = self.store.delete_document(id).await?;
        if deleted {
            tracing::info!(doc_id = %id, "Document deleted");
        }
        Ok(deleted)
    }

    pub async fn get_document(&self, id: Uuid) -> Result<Option<KnowledgeDocument>> {
        self.store.get_document(id).await
    }

    pub async fn list_documents(
        &self,
        filter: DocumentFilter,
        paging: Paging,
    ) -> Result<(Vec<KnowledgeDocument>, usize)> {
        self.store.list_documents(filter, paging).await
    }

    /// Maintenance search: vector retrieval at the lower threshold, keywords
    /// when that finds nothing.
    pub async fn search(&self, query: &str, k: usize, filter: &DocumentFilter) -> Result<Vec<RetrievalHit>> {
        self.retriever
            .search(query, k, self.search_threshold, filter)
            .await
    }

    pub async fn search_by_keywords(
        &self,
        query: &str,
        k: usize,
        filter: &DocumentFilter,
    ) -> Result<Vec<RetrievalHit>> {
        let keywords: Vec<String> = query.split_whitespace().map(String::from).collect();
        self.retriever.retrieve_by_keywords(&keywords, k, filter).await
    }

    /// Insert, or replace the content of the document with the same
    /// `(source, title)`. Returns the document and whether it was created.
    pub async fn upsert_by_title(&self, new: NewDocument) -> Result<(KnowledgeDocument, bool)> {
        match self.store.find_document(&new.source, new.title.trim()).await? {
            Some(existing) => {
                let update = DocumentUpdate {
                    content: Some(new.content),
                    category: Some(new.category),
                    lang: Some(new.lang),
                    published_date: new.published_date,
                    ..DocumentUpdate::default()
                };
                Ok((self.update_document(existing.id, update).await?, false))
            }
            None => Ok((self.add_document(new).await?, true)),
        }
    }

    /// Delete the document with the given `(source, title)`, if any.
    pub async fn delete_by_title(&self, source: &str, title: &str) -> Result<bool> {
        match self.store.find_document(source, title).await? {
            Some(doc) => self.delete_document(doc.id).await,
            None => Ok(false),
        }
    }

    async fn build_chunks(&self, doc: &KnowledgeDocument) -> Result<Vec<KnowledgeChunk>> {
        let new = NewDocument {
            title: doc.title.clone(),
            content: doc.content.clone(),
            source: doc.source.clone(),
            category: doc.category.clone(),
            lang: doc.lang.clone(),
            published_date: doc.published_date,
        };
        let pieces = self.chunker.chunk_document(&new);
        let texts: Vec<String> = pieces.iter().map(|p| p.content.clone()).collect();
        let embeddings = self.embedder.embed_documents(&texts).await?;
        if embeddings.len() != pieces.len() {
            return Err(Error::Integrity(format!(
                "{} embeddings for {} chunks",
                embeddings.len(),
                pieces.len()
            )));
        }

        Ok(pieces
            .into_iter()
            .zip(embeddings)
            .map(|(piece, embedding)| KnowledgeChunk {
                document_id: doc.id,
                chunk_index: piece.index,
                content: piece.content,
                embedding,
                metadata: piece.metadata,
            })
            .collect())
    }
}

fn validate(title: &str, content: &str) -> Result<()> {
    if title.trim().is_empty() {
        return Err(Error::Validation("title is required".into()));
    }
    if content.trim().is_empty() {
        return Err(Error::Validation("content is required".into()));
    }
    Ok(())
}
