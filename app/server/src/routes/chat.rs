use axum::{
    extract::State as AxumState,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::time::Duration;

use careline::chat::{fallback_reply, ChatRequest};
use careline::rag::RiskLevel;
use careline::{Error, Uuid};

use crate::state::AppState;

const CHAT_TIMEOUT: Duration = Duration::from_secs(60);

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/chat", post(chat))
        .route("/health", get(health))
}

async fn chat(AxumState(state): AxumState<AppState>, Json(mut payload): Json<ChatRequest>) -> Response {
    // Assigned up front so a timed-out turn can still name its conversation.
    let conversation_id = *payload.conversation_id.get_or_insert_with(Uuid::new_v4);
    tracing::info!(conversation_id = %conversation_id, user_id = %payload.user_id, "Chat request");

    match tokio::time::timeout(CHAT_TIMEOUT, state.chat.process_message(payload)).await {
        Ok(Ok(reply)) => Json(reply).into_response(),
        Ok(Err(failure)) => {
            let status = if matches!(failure.error, Error::Validation(_)) {
                StatusCode::BAD_REQUEST
            } else {
                tracing::error!(conversation_id = %failure.conversation_id, error = %failure.error, "Chat turn failed");
                StatusCode::INTERNAL_SERVER_ERROR
            };
            let body = json!({
                "conversation_id": failure.conversation_id,
                "reply": failure.reply,
                "detail": failure.error.to_string(),
            });
            (status, Json(body)).into_response()
        }
        Err(_) => {
            tracing::warn!(conversation_id = %conversation_id, "Chat request timeout after 60 seconds");
            let body = json!({
                "conversation_id": conversation_id,
                "reply": fallback_reply(RiskLevel::None),
                "detail": "request timed out",
            });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
