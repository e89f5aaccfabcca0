use axum::{
    extract::{Multipart, Path, Query, State as AxumState},
    response::Json,
    routing::{delete, get, post},
    Router,
};

use careline::knowledge::drug::{DrugTemplate, ImportReport};

use super::knowledge::{Deleted, DocumentList};
use super::{read_upload_form, PageQuery};
use crate::api_error::{parse_id, ApiResult};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/knowledge/drug/upload-excel", post(upload_excel))
        .route("/knowledge/drug/upload-json", post(upload_json))
        .route("/knowledge/drug/template", get(template))
        .route("/knowledge/drug/list", get(list))
        .route("/knowledge/drug/:id", delete(remove))
}

async fn upload_excel(
    AxumState(state): AxumState<AppState>,
    multipart: Multipart,
) -> ApiResult<ImportReport> {
    let form = read_upload_form(multipart).await?;
    tracing::info!(filename = %form.filename, bytes = form.bytes.len(), "Drug workbook received");
    Ok(Json(state.drugs.upload_excel(&form.bytes).await?))
}

async fn upload_json(
    AxumState(state): AxumState<AppState>,
    multipart: Multipart,
) -> ApiResult<ImportReport> {
    let form = read_upload_form(multipart).await?;
    tracing::info!(filename = %form.filename, bytes = form.bytes.len(), "Drug JSON received");
    Ok(Json(state.drugs.upload_json(&form.bytes).await?))
}

async fn template(AxumState(state): AxumState<AppState>) -> Json<DrugTemplate> {
    Json(state.drugs.template())
}

async fn list(
    AxumState(state): AxumState<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult<DocumentList> {
    let (documents, total) = state.drugs.list(query.paging()).await?;
    Ok(Json(DocumentList { documents, total }))
}

async fn remove(AxumState(state): AxumState<AppState>, Path(id): Path<String>) -> ApiResult<Deleted> {
    let id = parse_id(&id)?;
    state.drugs.delete(id).await?;
    Ok(Json(Deleted {
        message: "drug document deleted".to_string(),
        id,
    }))
}
