//! HTTP routes
//!
//! Public auth endpoints and `/uploads/{name}` need no token; everything
//! else under `/api` and the upload endpoint go through `mw_require_auth`.
//! The WebSocket authenticates itself from its query string.

use crate::ai;
use crate::auth::handlers as auth_handlers;
use crate::auth::middleware::mw_require_auth;
use crate::config::AppState;
use crate::conversations::handlers as conversation_handlers;
use crate::messages::handlers as message_handlers;
use crate::realtime::socket::ws_handler;
use crate::uploads::handlers as upload_handlers;
use axum::{
    extract::{DefaultBodyLimit, State},
    middleware,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Multipart framing on top of the file itself
const MULTIPART_OVERHEAD: usize = 64 * 1024;

fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/api/auth/signup", post(auth_handlers::signup))
        .route("/api/auth/verify-email", post(auth_handlers::verify_email))
        .route("/api/auth/resend-otp", post(auth_handlers::resend_otp))
        .route("/api/auth/login", post(auth_handlers::login))
        .route("/api/auth/forgot-password", post(auth_handlers::forgot_password))
        .route("/api/auth/reset-password", post(auth_handlers::reset_password))
        .route("/uploads/{name}", get(upload_handlers::get_upload))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
}

fn protected_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        // Account
        .route("/api/auth/logout", post(auth_handlers::logout))
        .route("/api/auth/me", get(auth_handlers::me))
        .route("/api/auth/profile", put(auth_handlers::update_profile))
        .route("/api/auth/password", put(auth_handlers::change_password))
        .route("/api/users", get(auth_handlers::list_users))
        // Conversations
        .route(
            "/api/conversations",
            get(conversation_handlers::list_conversations),
        )
        .route(
            "/api/conversations/direct",
            post(conversation_handlers::create_direct),
        )
        .route(
            "/api/conversations/group",
            post(conversation_handlers::create_group),
        )
        .route("/api/conversations/ai", post(conversation_handlers::create_ai))
        .route(
            "/api/conversations/{id}",
            get(conversation_handlers::get_conversation),
        )
        .route(
            "/api/conversations/{id}/name",
            put(conversation_handlers::rename),
        )
        .route(
            "/api/conversations/{id}/members",
            post(conversation_handlers::add_members),
        )
        .route(
            "/api/conversations/{id}/members/{user_id}",
            delete(conversation_handlers::remove_member),
        )
        .route(
            "/api/conversations/{id}/leave",
            post(conversation_handlers::leave),
        )
        // Messages
        .route(
            "/api/conversations/{id}/messages",
            get(message_handlers::list_messages).post(message_handlers::send_message),
        )
        .route(
            "/api/conversations/{id}/read",
            post(message_handlers::mark_read),
        )
        .route(
            "/api/conversations/{id}/typing",
            get(message_handlers::typing_users),
        )
        .route(
            "/api/messages/{id}/reactions",
            post(message_handlers::react),
        )
        .route("/api/messages/{id}", delete(message_handlers::delete_message))
        // Assistant
        .route("/api/ai", get(ai::status))
        // Uploads
        .route(
            "/uploads",
            post(upload_handlers::upload).layer(DefaultBodyLimit::max(
                state.uploads.max_bytes() + MULTIPART_OVERHEAD,
            )),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), mw_require_auth))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(public_routes())
        .merge(protected_routes(&state))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": state.hub.connection_count(),
        "online_users": state.hub.online_users().len(),
        "ai_enabled": state.ai_manager.is_some(),
    }))
}
