use axum::{
    extract::{Path, State as AxumState},
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use serde_json::Value;

use careline::memory::{checkpoint, format_for_prompt};
use careline::types::{Conversation, Turn};

use crate::api_error::{parse_id, ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct ConversationView {
    #[serde(flatten)]
    conversation: Conversation,
    turns: Vec<Turn>,
}

#[derive(Debug, Serialize)]
struct MemoryView {
    conversation_id: careline::Uuid,
    formatted: String,
    checkpoint: Value,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/conversations/:id", get(get_conversation))
        .route("/conversations/:id/memory", get(get_memory))
}

async fn get_conversation(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ConversationView> {
    let id = parse_id(&id)?;
    let conversation = state
        .store
        .get_conversation(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("conversation {} not found", id)))?;
    let turns = state.store.list_turns(id).await?;
    Ok(Json(ConversationView { conversation, turns }))
}

async fn get_memory(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult<MemoryView> {
    let id = parse_id(&id)?;
    if state.store.get_conversation(id).await?.is_none() {
        return Err(ApiError::not_found(format!("conversation {} not found", id)));
    }
    let snapshot = state.memory.load_memory(id, true).await;
    Ok(Json(MemoryView {
        conversation_id: id,
        formatted: format_for_prompt(&snapshot),
        checkpoint: checkpoint(&snapshot),
    }))
}
