//! Conversation handlers
//!
//! Membership changes in groups leave a `system` message behind so the
//! history shows who did what.

use crate::config::AppState;
use crate::ctx::Ctx;
use crate::error::{Error, Result};
use crate::models::{Conversation, MessageKind};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct CreateDirectRequest {
    pub peer_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub participant_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct AddMembersRequest {
    pub user_ids: Vec<String>,
}

fn created_status(created: bool) -> StatusCode {
    if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    }
}

async fn username(state: &AppState, user_id: &str) -> String {
    state
        .auth
        .get_user(user_id)
        .await
        .map(|u| u.username)
        .unwrap_or_else(|_| "someone".to_string())
}

async fn system_notice(
    state: &AppState,
    conversation_id: &str,
    actor_id: &str,
    text: String,
) -> Result<()> {
    state
        .messages
        .post_as(conversation_id, actor_id, MessageKind::System, &text)
        .await?;
    Ok(())
}

/// GET /api/conversations
pub async fn list_conversations(
    State(state): State<AppState>,
    ctx: Ctx,
) -> Result<Json<Vec<Conversation>>> {
    let conversations = state.conversations.list_for_user(ctx.user_id()).await?;
    Ok(Json(conversations))
}

/// GET /api/conversations/{id}
pub async fn get_conversation(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
    ctx: Ctx,
) -> Result<Json<Conversation>> {
    let conversation = state
        .conversations
        .get_for(&conversation_id, ctx.user_id())
        .await?;
    Ok(Json(conversation))
}

/// POST /api/conversations/direct
pub async fn create_direct(
    State(state): State<AppState>,
    ctx: Ctx,
    Json(req): Json<CreateDirectRequest>,
) -> Result<(StatusCode, Json<Conversation>)> {
    info!("POST /api/conversations/direct - {} -> {}", ctx.user_id(), req.peer_id);

    let (conversation, created) = state
        .conversations
        .create_direct(ctx.user_id(), &req.peer_id)
        .await?;
    if created {
        state.conversations.notify(&conversation.id).await?;
    }
    Ok((created_status(created), Json(conversation)))
}

/// POST /api/conversations/group
pub async fn create_group(
    State(state): State<AppState>,
    ctx: Ctx,
    Json(req): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<Conversation>)> {
    info!("POST /api/conversations/group - {}", req.name);

    let conversation = state
        .conversations
        .create_group(ctx.user_id(), &req.name, &req.participant_ids)
        .await?;

    let creator = username(&state, ctx.user_id()).await;
    system_notice(
        &state,
        &conversation.id,
        ctx.user_id(),
        format!("{} created the group \"{}\"", creator, req.name.trim()),
    )
    .await?;
    state.conversations.notify(&conversation.id).await?;

    let conversation = state
        .conversations
        .get_for(&conversation.id, ctx.user_id())
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

/// POST /api/conversations/ai
pub async fn create_ai(
    State(state): State<AppState>,
    ctx: Ctx,
) -> Result<(StatusCode, Json<Conversation>)> {
    let ai = state
        .ai_manager
        .as_ref()
        .ok_or_else(|| Error::ServiceUnavailable("The assistant is not configured".to_string()))?;

    let (conversation, created) = state
        .conversations
        .get_or_create_ai(ctx.user_id(), &ai.bot().id)
        .await?;
    if created {
        info!("[@{}] New conversation with {}", ai.bot().username, ctx.user_id());
    }
    Ok((created_status(created), Json(conversation)))
}

/// PUT /api/conversations/{id}/name
pub async fn rename(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
    ctx: Ctx,
    Json(req): Json<RenameRequest>,
) -> Result<Json<Conversation>> {
    info!("PUT /api/conversations/{}/name", conversation_id);

    let name = state
        .conversations
        .rename(&conversation_id, ctx.user_id(), &req.name)
        .await?;

    let actor = username(&state, ctx.user_id()).await;
    system_notice(
        &state,
        &conversation_id,
        ctx.user_id(),
        format!("{} renamed the group to \"{}\"", actor, name),
    )
    .await?;
    state.conversations.notify(&conversation_id).await?;

    let conversation = state
        .conversations
        .get_for(&conversation_id, ctx.user_id())
        .await?;
    Ok(Json(conversation))
}

/// POST /api/conversations/{id}/members
pub async fn add_members(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
    ctx: Ctx,
    Json(req): Json<AddMembersRequest>,
) -> Result<Json<Conversation>> {
    info!("POST /api/conversations/{}/members", conversation_id);

    let added = state
        .conversations
        .add_members(&conversation_id, ctx.user_id(), &req.user_ids)
        .await?;

    if !added.is_empty() {
        let actor = username(&state, ctx.user_id()).await;
        let mut names = Vec::with_capacity(added.len());
        for user_id in &added {
            names.push(username(&state, user_id).await);
        }
        system_notice(
            &state,
            &conversation_id,
            ctx.user_id(),
            format!("{} added {}", actor, names.join(", ")),
        )
        .await?;
        state.conversations.notify(&conversation_id).await?;
    }

    let conversation = state
        .conversations
        .get_for(&conversation_id, ctx.user_id())
        .await?;
    Ok(Json(conversation))
}

/// DELETE /api/conversations/{id}/members/{user_id}
pub async fn remove_member(
    Path((conversation_id, user_id)): Path<(String, String)>,
    State(state): State<AppState>,
    ctx: Ctx,
) -> Result<Json<Conversation>> {
    info!("DELETE /api/conversations/{}/members/{}", conversation_id, user_id);

    state
        .conversations
        .remove_member(&conversation_id, ctx.user_id(), &user_id)
        .await?;

    let actor = username(&state, ctx.user_id()).await;
    let removed = username(&state, &user_id).await;
    system_notice(
        &state,
        &conversation_id,
        ctx.user_id(),
        format!("{} removed {}", actor, removed),
    )
    .await?;
    state.conversations.notify(&conversation_id).await?;

    let conversation = state
        .conversations
        .get_for(&conversation_id, ctx.user_id())
        .await?;
    Ok(Json(conversation))
}

/// POST /api/conversations/{id}/leave
pub async fn leave(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
    ctx: Ctx,
) -> Result<StatusCode> {
    info!("POST /api/conversations/{}/leave - {}", conversation_id, ctx.user_id());

    let new_admin = state
        .conversations
        .leave(&conversation_id, ctx.user_id())
        .await?;

    let remaining = state.conversations.participant_ids(&conversation_id).await?;
    if !remaining.is_empty() {
        let leaver = username(&state, ctx.user_id()).await;
        let mut text = format!("{} left the group", leaver);
        if let Some(admin_id) = new_admin {
            text.push_str(&format!("; {} is now the admin", username(&state, &admin_id).await));
        }
        system_notice(&state, &conversation_id, ctx.user_id(), text).await?;
        state.conversations.notify(&conversation_id).await?;
    }

    Ok(StatusCode::NO_CONTENT)
}
