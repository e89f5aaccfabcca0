use chrono::NaiveDate;
use rusqlite::{params, params_from_iter, OptionalExtension, Row, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

use super::vector::{decode_f32_blob, encode_f32_blob, rank, Candidate};
use super::{from_micros, micros, uuid_col, Store};
use crate::error::{Error, Result};
use crate::types::{DocumentFilter, KnowledgeChunk, KnowledgeDocument, Paging, RetrievalHit};

const DOCUMENT_COLUMNS: &str =
    "d.id, d.title, d.content, d.source, d.category, d.lang, d.published_date, d.created_at, d.updated_at";

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<KnowledgeDocument> {
    let published: Option<String> = row.get(6)?;
    Ok(KnowledgeDocument {
        id: uuid_col(row, 0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        source: row.get(3)?,
        category: row.get(4)?,
        lang: row.get(5)?,
        published_date: published.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        created_at: from_micros(row.get(7)?),
        updated_at: from_micros(row.get(8)?),
    })
}

/// Chunks must belong to `doc_id` and carry indices `0..N-1` in order.
fn check_chunk_sequence(doc_id: Uuid, chunks: &[KnowledgeChunk]) -> Result<()> {
    for (expected, chunk) in chunks.iter().enumerate() {
        if chunk.document_id != doc_id {
            return Err(Error::Integrity(format!(
                "chunk {} belongs to {} not {}",
                chunk.chunk_index, chunk.document_id, doc_id
            )));
        }
        if chunk.chunk_index != expected {
            return Err(Error::Integrity(format!(
                "chunk indices for {} are not contiguous: expected {}, got {}",
                doc_id, expected, chunk.chunk_index
            )));
        }
    }
    Ok(())
}

fn insert_chunks(tx: &Transaction<'_>, chunks: &[KnowledgeChunk]) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT INTO knowledge_chunks (document_id, chunk_index, content, embedding, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for chunk in chunks {
        stmt.execute(params![
            chunk.document_id.to_string(),
            chunk.chunk_index as i64,
            chunk.content,
            encode_f32_blob(&chunk.embedding),
            serde_json::to_string(&chunk.metadata)?,
        ])?;
    }
    Ok(())
}

impl Store {
    /// Insert a document and its chunks in one transaction.
    pub async fn insert_document(
        &self,
        doc: KnowledgeDocument,
        chunks: Vec<KnowledgeChunk>,
    ) -> Result<()> {
        check_chunk_sequence(doc.id, &chunks)?;
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO knowledge_documents
                 (id, title, content, source, category, lang, published_date, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    doc.id.to_string(),
                    doc.title,
                    doc.content,
                    doc.source,
                    doc.category,
                    doc.lang,
                    doc.published_date.map(|d| d.format("%Y-%m-%d").to_string()),
                    micros(&doc.created_at),
                    micros(&doc.updated_at),
                ],
            )?;
            insert_chunks(&tx, &chunks)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Overwrite document fields. With `chunks`, the chunk set is replaced
    /// wholesale inside the same transaction.
    pub async fn update_document(
        &self,
        doc: KnowledgeDocument,
        chunks: Option<Vec<KnowledgeChunk>>,
    ) -> Result<()> {
        if let Some(chunks) = &chunks {
            check_chunk_sequence(doc.id, chunks)?;
        }
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE knowledge_documents
                 SET title = ?2, content = ?3, source = ?4, category = ?5, lang = ?6,
                     published_date = ?7, updated_at = ?8
                 WHERE id = ?1",
                params![
                    doc.id.to_string(),
                    doc.title,
                    doc.content,
                    doc.source,
                    doc.category,
                    doc.lang,
                    doc.published_date.map(|d| d.format("%Y-%m-%d").to_string()),
                    micros(&doc.updated_at),
                ],
            )?;
            if updated == 0 {
                return Err(Error::NotFound(format!("document {}", doc.id)));
            }
            if let Some(chunks) = chunks {
                tx.execute(
                    "DELETE FROM knowledge_chunks WHERE document_id = ?1",
                    params![doc.id.to_string()],
                )?;
                insert_chunks(&tx, &chunks)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Delete a document; chunks go with it through the foreign key.
    pub async fn delete_document(&self, id: Uuid) -> Result<bool> {
        self.call(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM knowledge_documents WHERE id = ?1",
                params![id.to_string()],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    pub async fn get_document(&self, id: Uuid) -> Result<Option<KnowledgeDocument>> {
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM knowledge_documents d WHERE d.id = ?1", DOCUMENT_COLUMNS),
                    params![id.to_string()],
                    document_from_row,
                )
                .optional()?)
        })
        .await
    }

    /// Exact `(source, title)` lookup.
    pub async fn find_document(&self, source: &str, title: &str) -> Result<Option<KnowledgeDocument>> {
        let (source, title) = (source.to_string(), title.to_string());
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM knowledge_documents d WHERE d.source = ?1 AND d.title = ?2
                         ORDER BY d.created_at ASC LIMIT 1",
                        DOCUMENT_COLUMNS
                    ),
                    params![source, title],
                    document_from_row,
                )
                .optional()?)
        })
        .await
    }

    /// Page through documents, newest first, returning the page and the total.
    pub async fn list_documents(
        &self,
        filter: DocumentFilter,
        paging: Paging,
    ) -> Result<(Vec<KnowledgeDocument>, usize)> {
        self.call(move |conn| {
            let (clause, mut values) = filter.to_sql_predicate(1);
            let where_sql = if clause.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clause)
            };

            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM knowledge_documents d {}", where_sql),
                params_from_iter(values.iter()),
                |r| r.get(0),
            )?;

            let n = values.len();
            values.push(paging.limit.to_string());
            values.push(paging.skip.to_string());
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM knowledge_documents d {} ORDER BY d.created_at DESC, d.id ASC
                 LIMIT CAST(?{} AS INTEGER) OFFSET CAST(?{} AS INTEGER)",
                DOCUMENT_COLUMNS,
                where_sql,
                n + 1,
                n + 2
            ))?;
            let docs = stmt
                .query_map(params_from_iter(values.iter()), document_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok((docs, total as usize))
        })
        .await
    }

    pub async fn chunks_for_document(&self, doc_id: Uuid) -> Result<Vec<KnowledgeChunk>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT document_id, chunk_index, content, embedding, metadata
                 FROM knowledge_chunks WHERE document_id = ?1 ORDER BY chunk_index ASC",
            )?;
            let rows = stmt
                .query_map(params![doc_id.to_string()], |row| {
                    Ok((
                        uuid_col(row, 0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(document_id, index, content, blob, metadata)| {
                    Ok(KnowledgeChunk {
                        document_id,
                        chunk_index: index as usize,
                        content,
                        embedding: decode_f32_blob(&blob)?,
                        metadata: serde_json::from_str(&metadata)?,
                    })
                })
                .collect()
        })
        .await
    }

    pub async fn count_chunks(&self, doc_id: Uuid) -> Result<usize> {
        self.call(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM knowledge_chunks WHERE document_id = ?1",
                params![doc_id.to_string()],
                |r| r.get(0),
            )?;
            Ok(n as usize)
        })
        .await
    }

    /// Exact cosine search over every chunk that passes `filter`.
    pub async fn vector_search(
        &self,
        query: Vec<f32>,
        k: usize,
        threshold: f32,
        filter: DocumentFilter,
    ) -> Result<Vec<RetrievalHit>> {
        self.call(move |conn| {
            let (clause, values) = filter.to_sql_predicate(1);
            let where_sql = if clause.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clause)
            };
            let mut stmt = conn.prepare(&format!(
                "SELECT c.document_id, c.chunk_index, c.content, c.embedding, c.metadata,
                        d.title, d.source, d.category
                 FROM knowledge_chunks c JOIN knowledge_documents d ON d.id = c.document_id
                 {}",
                where_sql
            ))?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    Ok((
                        uuid_col(row, 0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut candidates = Vec::with_capacity(rows.len());
            for (doc_id, index, content, blob, metadata, title, source, category) in rows {
                let metadata: HashMap<String, String> =
                    serde_json::from_str(&metadata).unwrap_or_default();
                candidates.push(Candidate {
                    key: (doc_id.to_string(), index as usize),
                    embedding: decode_f32_blob(&blob)?,
                    payload: RetrievalHit {
                        document_id: doc_id,
                        chunk_index: index as usize,
                        content,
                        title,
                        source,
                        category,
                        similarity: 0.0,
                        metadata,
                    },
                });
            }

            Ok(rank(&query, candidates, k, threshold)
                .into_iter()
                .map(|(score, mut hit)| {
                    hit.similarity = score;
                    hit
                })
                .collect())
        })
        .await
    }

    /// Substring OR-match over title and chunk content, newest documents
    /// first. Every hit reports similarity 1.0.
    pub async fn keyword_search(
        &self,
        keywords: Vec<String>,
        k: usize,
        filter: DocumentFilter,
    ) -> Result<Vec<RetrievalHit>> {
        let keywords: Vec<String> = keywords
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        self.call(move |conn| {
            let mut values: Vec<String> = Vec::new();
            let mut ors = Vec::new();
            for kw in &keywords {
                values.push(format!("%{}%", escape_like(kw)));
                let n = values.len();
                ors.push(format!(
                    "d.title LIKE ?{n} ESCAPE '\\' OR c.content LIKE ?{n} ESCAPE '\\'"
                ));
            }
            let (clause, filter_values) = filter.to_sql_predicate(values.len() + 1);
            values.extend(filter_values);
            let mut where_sql = format!("WHERE ({})", ors.join(" OR "));
            if !clause.is_empty() {
                where_sql.push_str(" AND ");
                where_sql.push_str(&clause);
            }
            values.push(k.to_string());
            let mut stmt = conn.prepare(&format!(
                "SELECT c.document_id, c.chunk_index, c.content, c.metadata, d.title, d.source, d.category
                 FROM knowledge_chunks c JOIN knowledge_documents d ON d.id = c.document_id
                 {}
                 ORDER BY d.created_at DESC, c.chunk_index ASC
                 LIMIT CAST(?{} AS INTEGER)",
                where_sql,
                values.len()
            ))?;
            let hits = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    let metadata: String = row.get(3)?;
                    Ok(RetrievalHit {
                        document_id: uuid_col(row, 0)?,
                        chunk_index: row.get::<_, i64>(1)? as usize,
                        content: row.get(2)?,
                        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                        title: row.get(4)?,
                        source: row.get(5)?,
                        category: row.get(6)?,
                        similarity: 1.0,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(hits)
        })
        .await
    }
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn doc(title: &str, source: &str) -> KnowledgeDocument {
        let now = Utc::now();
        KnowledgeDocument {
            id: Uuid::new_v4(),
            title: title.into(),
            content: format!("{} 內容", title),
            source: source.into(),
            category: "general".into(),
            lang: "zh-TW".into(),
            published_date: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn chunk(doc_id: Uuid, index: usize, content: &str, embedding: Vec<f32>) -> KnowledgeChunk {
        KnowledgeChunk {
            document_id: doc_id,
            chunk_index: index,
            content: content.into(),
            embedding,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn delete_cascades_to_chunks() {
        let store = Store::open_in_memory().unwrap();
        let d = doc("凱旋醫院", "manual");
        let id = d.id;
        store
            .insert_document(d, vec![chunk(id, 0, "a", vec![1.0, 0.0]), chunk(id, 1, "b", vec![0.0, 1.0])])
            .await
            .unwrap();
        assert_eq!(store.count_chunks(id).await.unwrap(), 2);

        assert!(store.delete_document(id).await.unwrap());
        assert_eq!(store.count_chunks(id).await.unwrap(), 0);
        assert!(!store.delete_document(id).await.unwrap());
    }

    #[tokio::test]
    async fn non_contiguous_chunks_are_rejected() {
        let store = Store::open_in_memory().unwrap();
        let d = doc("x", "manual");
        let id = d.id;
        let err = store
            .insert_document(d, vec![chunk(id, 1, "a", vec![1.0])])
            .await;
        assert!(matches!(err, Err(Error::Integrity(_))));
        assert!(store.get_document(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_replaces_chunk_set() {
        let store = Store::open_in_memory().unwrap();
        let mut d = doc("x", "manual");
        let id = d.id;
        store
            .insert_document(d.clone(), vec![chunk(id, 0, "a", vec![1.0]), chunk(id, 1, "b", vec![1.0])])
            .await
            .unwrap();
        d.content = "new".into();
        store
            .update_document(d, Some(vec![chunk(id, 0, "new", vec![1.0])]))
            .await
            .unwrap();
        let chunks = store.chunks_for_document(id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "new");
    }

    #[tokio::test]
    async fn reserved_contact_titles_are_unique() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_document(doc("機構聯絡資訊: A", "authoritative_contacts"), vec![])
            .await
            .unwrap();
        let dup = store
            .insert_document(doc("機構聯絡資訊: A", "authoritative_contacts"), vec![])
            .await;
        assert!(dup.is_err());
        // Other sources may repeat titles.
        store.insert_document(doc("同名", "manual"), vec![]).await.unwrap();
        store.insert_document(doc("同名", "manual"), vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn vector_search_respects_filter_and_threshold() {
        let store = Store::open_in_memory().unwrap();
        let a = doc("A", "manual");
        let b = doc("B", "drug_database");
        let (ida, idb) = (a.id, b.id);
        store.insert_document(a, vec![chunk(ida, 0, "a0", vec![1.0, 0.0])]).await.unwrap();
        store.insert_document(b, vec![chunk(idb, 0, "b0", vec![0.9, 0.1])]).await.unwrap();

        let hits = store
            .vector_search(vec![1.0, 0.0], 5, 0.45, DocumentFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "a0");
        assert!(hits[0].similarity >= hits[1].similarity);

        let hits = store
            .vector_search(vec![1.0, 0.0], 5, 0.45, DocumentFilter::source("drug_database"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "B");

        let hits = store
            .vector_search(vec![0.0, 1.0], 5, 0.45, DocumentFilter::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn keyword_search_matches_title_or_content() {
        let store = Store::open_in_memory().unwrap();
        let a = doc("凱旋醫院", "manual");
        let ida = a.id;
        store.insert_document(a, vec![chunk(ida, 0, "電話 07-751-3171", vec![1.0])]).await.unwrap();
        let b = doc("其他", "manual");
        let idb = b.id;
        store.insert_document(b, vec![chunk(idb, 0, "沒有關係", vec![1.0])]).await.unwrap();

        let hits = store
            .keyword_search(vec!["凱旋".into(), "不存在".into()], 5, DocumentFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].similarity, 1.0);

        let hits = store
            .keyword_search(vec!["電話".into()], 5, DocumentFilter::source("other"))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn keyword_search_with_many_keywords_and_filters() {
        let store = Store::open_in_memory().unwrap();
        let d = doc("凱旋醫院", "manual");
        let id = d.id;
        store.insert_document(d, vec![chunk(id, 0, "電話 07-751-3171", vec![1.0])]).await.unwrap();

        let filter = DocumentFilter {
            category: Some("general".into()),
            lang: None,
            source: Some("manual".into()),
        };
        let mut keywords: Vec<String> = ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        keywords.push("凱旋".into());

        let hits = store.keyword_search(keywords, 5, filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, id);
    }

    #[tokio::test]
    async fn list_documents_pages_with_total() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..3 {
            store.insert_document(doc(&format!("d{}", i), "drug_database"), vec![]).await.unwrap();
        }
        store.insert_document(doc("other", "manual"), vec![]).await.unwrap();
        let (page, total) = store
            .list_documents(DocumentFilter::source("drug_database"), Paging { skip: 1, limit: 1 })
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 1);
    }
}
