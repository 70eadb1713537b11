//! Auth handlers

use super::otp::OtpPurpose;
use crate::config::AppState;
use crate::ctx::Ctx;
use crate::error::Result;
use crate::models::UserInfo;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailRequest {
    pub email: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct ResendOtpRequest {
    pub email: String,
    #[serde(default = "default_purpose")]
    pub purpose: OtpPurpose,
}

fn default_purpose() -> OtpPurpose {
    OtpPurpose::VerifyEmail
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub email: String,
    pub code: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    pub username: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub q: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserInfo,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

/// POST /api/auth/signup
pub async fn signup(
    State(state): State<AppState>,
    Json(req): Json<SignupRequest>,
) -> Result<(StatusCode, Json<MessageResponse>)> {
    info!("POST /api/auth/signup - {}", req.email);

    let user = state
        .auth
        .signup(&req.email, &req.username, &req.password)
        .await?;

    Ok((
        StatusCode::CREATED,
        MessageResponse::new(format!("Verification code sent to {}", user.email)),
    ))
}

/// POST /api/auth/verify-email
pub async fn verify_email(
    State(state): State<AppState>,
    Json(req): Json<VerifyEmailRequest>,
) -> Result<Json<AuthResponse>> {
    info!("POST /api/auth/verify-email - {}", req.email);

    let (user, session) = state.auth.verify_email(&req.email, &req.code).await?;
    Ok(Json(AuthResponse {
        token: session.token,
        user,
    }))
}

/// POST /api/auth/resend-otp
pub async fn resend_otp(
    State(state): State<AppState>,
    Json(req): Json<ResendOtpRequest>,
) -> Result<Json<MessageResponse>> {
    info!("POST /api/auth/resend-otp - {} ({})", req.email, req.purpose.as_str());

    state.auth.resend_otp(&req.email, req.purpose).await?;
    Ok(MessageResponse::new("If the address is registered, a new code is on its way"))
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>> {
    info!("POST /api/auth/login - {}", req.email);

    let (user, session) = state.auth.login(&req.email, &req.password).await?;
    Ok(Json(AuthResponse {
        token: session.token,
        user,
    }))
}

/// POST /api/auth/forgot-password
pub async fn forgot_password(
    State(state): State<AppState>,
    Json(req): Json<ForgotPasswordRequest>,
) -> Result<Json<MessageResponse>> {
    info!("POST /api/auth/forgot-password - {}", req.email);

    state.auth.forgot_password(&req.email).await?;
    Ok(MessageResponse::new("If the address is registered, a reset code is on its way"))
}

/// POST /api/auth/reset-password
pub async fn reset_password(
    State(state): State<AppState>,
    Json(req): Json<ResetPasswordRequest>,
) -> Result<Json<MessageResponse>> {
    info!("POST /api/auth/reset-password - {}", req.email);

    let user_id = state
        .auth
        .reset_password(&req.email, &req.code, &req.new_password)
        .await?;
    state.hub.close_user(&user_id);
    Ok(MessageResponse::new("Password updated, please log in again"))
}

/// POST /api/auth/logout
pub async fn logout(State(state): State<AppState>, ctx: Ctx) -> Result<StatusCode> {
    info!("POST /api/auth/logout");
    state.auth.logout(ctx.token()).await?;
    state.hub.close_session(ctx.token());
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/auth/me
pub async fn me(State(state): State<AppState>, ctx: Ctx) -> Result<Json<UserInfo>> {
    // If we are here, 'ctx' contains a valid user_id confirmed by middleware.
    let user = state.auth.get_user(ctx.user_id()).await?;
    Ok(Json(user))
}

/// PUT /api/auth/profile
pub async fn update_profile(
    State(state): State<AppState>,
    ctx: Ctx,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<Json<UserInfo>> {
    info!("PUT /api/auth/profile - {}", ctx.user_id());

    let user = state
        .auth
        .update_profile(ctx.user_id(), req.username, req.bio, req.avatar_url)
        .await?;
    Ok(Json(user))
}

/// PUT /api/auth/password
pub async fn change_password(
    State(state): State<AppState>,
    ctx: Ctx,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<StatusCode> {
    info!("PUT /api/auth/password - {}", ctx.user_id());

    state
        .auth
        .change_password(ctx.user_id(), &req.old_password, &req.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/users
pub async fn list_users(
    State(state): State<AppState>,
    ctx: Ctx,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<UserInfo>>> {
    let users = state
        .auth
        .list_users(ctx.user_id(), query.q.as_deref())
        .await?;
    Ok(Json(users))
}
