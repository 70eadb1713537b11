use crate::config::AppState;
use crate::ctx::Ctx;
use crate::error::Result;
use crate::models::{Message, Reaction, SendMessageInput, TypingIndicator};
use crate::realtime::relay_typing;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub before: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ReactRequest {
    pub emoji: String,
}

#[derive(Debug, Serialize)]
pub struct ReactResponse {
    pub message_id: String,
    pub reactions: Vec<Reaction>,
}

#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    pub message_ids: Vec<String>,
}

/// Store a message, settle the sender's typing state and wake the assistant
///
/// Shared by the REST endpoint and the `send_message` socket frame.
pub async fn post_message(
    state: &AppState,
    sender_id: &str,
    conversation_id: &str,
    input: SendMessageInput,
) -> Result<Message> {
    let message = state
        .messages
        .send(conversation_id, sender_id, input)
        .await?;

    if let Some(stopped) = state.typing.stop(conversation_id, sender_id) {
        relay_typing(state, stopped).await;
    }

    if let Some(ai) = &state.ai_manager {
        ai.on_new_message(&message);
    }

    Ok(message)
}

/// GET /api/conversations/{id}/messages
pub async fn list_messages(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
    ctx: Ctx,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>> {
    let messages = state
        .messages
        .list(
            &conversation_id,
            ctx.user_id(),
            query.before.as_deref(),
            query.limit,
        )
        .await?;
    Ok(Json(messages))
}

/// POST /api/conversations/{id}/messages
pub async fn send_message(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
    ctx: Ctx,
    Json(input): Json<SendMessageInput>,
) -> Result<(StatusCode, Json<Message>)> {
    info!("POST /api/conversations/{}/messages", conversation_id);

    let message = post_message(&state, ctx.user_id(), &conversation_id, input).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// POST /api/conversations/{id}/read
pub async fn mark_read(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
    ctx: Ctx,
) -> Result<Json<MarkReadResponse>> {
    let message_ids = state
        .messages
        .mark_read(&conversation_id, ctx.user_id())
        .await?;
    Ok(Json(MarkReadResponse { message_ids }))
}

/// GET /api/conversations/{id}/typing
pub async fn typing_users(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
    ctx: Ctx,
) -> Result<Json<Vec<TypingIndicator>>> {
    // Membership check only; the conversation body is discarded.
    state
        .conversations
        .get_for(&conversation_id, ctx.user_id())
        .await?;
    Ok(Json(state.typing.active(&conversation_id)))
}

/// POST /api/messages/{id}/reactions
pub async fn react(
    Path(message_id): Path<String>,
    State(state): State<AppState>,
    ctx: Ctx,
    Json(req): Json<ReactRequest>,
) -> Result<Json<ReactResponse>> {
    info!("POST /api/messages/{}/reactions - {}", message_id, req.emoji);

    let reactions = state
        .messages
        .react(&message_id, ctx.user_id(), &req.emoji)
        .await?;
    Ok(Json(ReactResponse {
        message_id,
        reactions,
    }))
}

/// DELETE /api/messages/{id}
pub async fn delete_message(
    Path(message_id): Path<String>,
    State(state): State<AppState>,
    ctx: Ctx,
) -> Result<StatusCode> {
    info!("DELETE /api/messages/{}", message_id);

    state.messages.delete(&message_id, ctx.user_id()).await?;
    Ok(StatusCode::NO_CONTENT)
}
