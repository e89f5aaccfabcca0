use axum::{
    extract::{Path, Query, State as AxumState},
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};

use careline::types::{
    DocumentFilter, DocumentUpdate, KnowledgeDocument, NewDocument, Paging, RetrievalHit,
};
use careline::Uuid;

use crate::api_error::{parse_id, ApiError, ApiResult};
use crate::state::AppState;

const DEFAULT_SEARCH_K: usize = 5;
const MAX_SEARCH_K: usize = 50;

#[derive(Debug, Deserialize)]
struct DocumentQuery {
    source: Option<String>,
    category: Option<String>,
    lang: Option<String>,
    skip: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: String,
    k: Option<usize>,
    category: Option<String>,
    lang: Option<String>,
    source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DocumentList {
    pub documents: Vec<KnowledgeDocument>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
struct SearchResults {
    query: String,
    results: Vec<RetrievalHit>,
}

#[derive(Debug, Serialize)]
pub struct Deleted {
    pub message: String,
    pub id: Uuid,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/knowledge/documents", get(list_documents).post(add_document))
        .route(
            "/knowledge/documents/:id",
            get(get_document).put(update_document).delete(delete_document),
        )
        .route("/knowledge/search", get(search))
}

async fn add_document(
    AxumState(state): AxumState<AppState>,
    Json(new): Json<NewDocument>,
) -> ApiResult<KnowledgeDocument> {
    Ok(Json(state.knowledge.add_document(new).await?))
}

async fn list_documents(
    AxumState(state): AxumState<AppState>,
    Query(query): Query<DocumentQuery>,
) -> ApiResult<DocumentList> {
    let filter = DocumentFilter {
        category: query.category,
        lang: query.lang,
        source: query.source,
    };
    let default = Paging::default();
    let paging = Paging {
        skip: query.skip.unwrap_or(default.skip),
        limit: query.limit.unwrap_or(default.limit).clamp(1, 500),
    };
    let (documents, total) = state.knowledge.list_documents(filter, paging).await?;
    Ok(Json(DocumentList { documents, total }))
}

async fn get_document(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult<KnowledgeDocument> {
    let id = parse_id(&id)?;
    state
        .knowledge
        .get_document(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("document {} not found", id)))
}

async fn update_document(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
    Json(update): Json<DocumentUpdate>,
) -> ApiResult<KnowledgeDocument> {
    let id = parse_id(&id)?;
    Ok(Json(state.knowledge.update_document(id, update).await?))
}

async fn delete_document(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Deleted> {
    let id = parse_id(&id)?;
    if !state.knowledge.delete_document(id).await? {
        return Err(ApiError::not_found(format!("document {} not found", id)));
    }
    Ok(Json(Deleted {
        message: "document deleted".to_string(),
        id,
    }))
}

async fn search(
    AxumState(state): AxumState<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<SearchResults> {
    let q = query.q.trim().to_string();
    if q.is_empty() {
        return Err(ApiError::bad_request("q must not be empty"));
    }
    let k = query.k.unwrap_or(DEFAULT_SEARCH_K).clamp(1, MAX_SEARCH_K);
    let filter = DocumentFilter {
        category: query.category,
        lang: query.lang,
        source: query.source,
    };
    let results = state.knowledge.search(&q, k, &filter).await?;
    Ok(Json(SearchResults { query: q, results }))
}
