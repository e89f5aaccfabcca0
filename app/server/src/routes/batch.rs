use axum::{
    extract::{Multipart, Path, Query, State as AxumState},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};

use careline::indexing::{BatchStatusView, UploadAccepted, UploadRequest};
use careline::types::{BatchTask, UploadRecord, UploadType};
use careline::Uuid;

use super::{read_upload_form, PageQuery};
use crate::api_error::{parse_id, ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct CreateBatch {
    file_count: i64,
}

#[derive(Debug, Serialize)]
struct BatchCreated {
    batch_id: Uuid,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct BatchList {
    batches: Vec<BatchTask>,
    total: usize,
}

#[derive(Debug, Serialize)]
struct BatchDeleted {
    message: String,
    batch_id: Uuid,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/batch/create", post(create_batch))
        .route("/batch/list", get(list_batches))
        .route("/batch/file/:id/status", get(file_status))
        .route("/batch/:id/upload", post(upload_file))
        .route("/batch/:id/status", get(batch_status))
        .route("/batch/:id", delete(delete_batch))
}

async fn create_batch(
    AxumState(state): AxumState<AppState>,
    Json(payload): Json<CreateBatch>,
) -> ApiResult<BatchCreated> {
    let total = u32::try_from(payload.file_count)
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| ApiError::bad_request("file_count must be a positive integer"))?;
    let batch = state.uploads.create_batch(total).await?;
    Ok(Json(BatchCreated {
        batch_id: batch.id,
        status: "created",
    }))
}

async fn upload_file(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
    multipart: Multipart,
) -> ApiResult<UploadAccepted> {
    let batch_id = parse_id(&id)?;
    let form = read_upload_form(multipart).await?;

    let upload_type = match form.field("upload_type") {
        Some(raw) => Some(
            UploadType::parse(&raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown upload_type: {}", raw)))?,
        ),
        None => None,
    };
    let request = UploadRequest {
        filename: form.filename.clone(),
        relative_path: form.field("relative_path"),
        upload_type,
        category: form.field("category").unwrap_or_else(|| "general".to_string()),
        source: form.field("source").unwrap_or_else(|| "upload".to_string()),
        lang: form
            .field("lang")
            .unwrap_or_else(careline::types::default_lang),
    };

    let accepted = state
        .uploads
        .upload_file_to_batch(batch_id, form.bytes, request)
        .await?;
    Ok(Json(accepted))
}

async fn batch_status(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult<BatchStatusView> {
    let batch_id = parse_id(&id)?;
    Ok(Json(state.uploads.batch_status(batch_id).await?))
}

async fn file_status(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult<UploadRecord> {
    let upload_id = parse_id(&id)?;
    Ok(Json(state.uploads.file_status(upload_id).await?))
}

async fn list_batches(
    AxumState(state): AxumState<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult<BatchList> {
    let (batches, total) = state.uploads.list_batches(query.paging()).await?;
    Ok(Json(BatchList { batches, total }))
}

async fn delete_batch(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult<BatchDeleted> {
    let batch_id = parse_id(&id)?;
    state.uploads.delete_batch(batch_id).await?;
    Ok(Json(BatchDeleted {
        message: "batch deleted; files kept".to_string(),
        batch_id,
    }))
}
