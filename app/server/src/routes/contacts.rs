use axum::{
    extract::{Path, State as AxumState},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;

use careline::types::{AuthoritativeContact, ContactInput};

use crate::api_error::{parse_id, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct RepairReport {
    synced_count: usize,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/contacts", get(list_contacts).post(create_contact))
        .route("/contacts/sync/repair", post(repair))
        .route(
            "/contacts/:id",
            get(get_contact).put(update_contact).delete(delete_contact),
        )
}

async fn list_contacts(AxumState(state): AxumState<AppState>) -> ApiResult<Vec<AuthoritativeContact>> {
    Ok(Json(state.contacts.list().await?))
}

async fn create_contact(
    AxumState(state): AxumState<AppState>,
    Json(input): Json<ContactInput>,
) -> ApiResult<AuthoritativeContact> {
    Ok(Json(state.contacts.create(input).await?))
}

async fn get_contact(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult<AuthoritativeContact> {
    let id = parse_id(&id)?;
    Ok(Json(state.contacts.get(id).await?))
}

async fn update_contact(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ContactInput>,
) -> ApiResult<AuthoritativeContact> {
    let id = parse_id(&id)?;
    Ok(Json(state.contacts.update(id, input).await?))
}

async fn delete_contact(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult<AuthoritativeContact> {
    let id = parse_id(&id)?;
    Ok(Json(state.contacts.delete(id).await?))
}

async fn repair(AxumState(state): AxumState<AppState>) -> ApiResult<RepairReport> {
    let synced_count = state.contacts.repair().await?;
    Ok(Json(RepairReport { synced_count }))
}
