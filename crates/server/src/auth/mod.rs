//! Authentication Module
//!
//! Handles signup with email OTP verification, login, password reset and
//! session management. Users and sessions live in the shared SQLite pool.

pub mod handlers;
pub mod middleware;
pub mod otp;

use crate::config::ChatServerConfig;
use crate::error::{Error, Result};
use crate::mailer::Mailer;
use crate::models::{fmt_ts, parse_ts, Presence, UserInfo};
use bcrypt::{hash, verify};
use chrono::{DateTime, Duration, Utc};
use otp::{OtpPurpose, OtpStore};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

pub(crate) const USER_COLUMNS: &str =
    "id, email, username, avatar_url, bio, is_bot, is_online, last_seen, created_at";

/// Session token for authenticated requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct UserRow {
    id: String,
    email: String,
    username: String,
    avatar_url: Option<String>,
    bio: Option<String>,
    is_bot: bool,
    is_online: bool,
    last_seen: Option<String>,
    created_at: String,
}

impl From<UserRow> for UserInfo {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            username: row.username,
            avatar_url: row.avatar_url,
            bio: row.bio,
            is_bot: row.is_bot,
            is_online: row.is_online,
            last_seen: row.last_seen.as_deref().map(parse_ts),
            created_at: parse_ts(&row.created_at),
        }
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn is_valid_email(s: &str) -> bool {
    let s = s.trim();
    if s.is_empty() || s.contains(char::is_whitespace) {
        return false;
    }
    match s.find('@') {
        Some(at) if at > 0 && at < s.len() - 1 => {
            let domain = &s[at + 1..];
            !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        _ => false,
    }
}

pub fn validate_username(username: &str) -> Result<()> {
    let len = username.chars().count();
    if !(3..=30).contains(&len) {
        return Err(Error::BadRequest(
            "Username must be 3-30 characters".to_string(),
        ));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(Error::BadRequest(
            "Username may only contain letters, digits, '_' and '.'".to_string(),
        ));
    }
    Ok(())
}

/// Match `%`, `_` and `\` literally inside a LIKE pattern
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < 6 {
        return Err(Error::BadRequest(
            "Password must be at least 6 characters".to_string(),
        ));
    }
    Ok(())
}

/// Auth manager handles all authentication
pub struct AuthManager {
    pool: SqlitePool,
    otp: OtpStore,
    mailer: Arc<dyn Mailer>,
    session_ttl: Duration,
    bcrypt_cost: u32,
    /// In-memory session cache
    sessions: RwLock<HashMap<String, Session>>,
}

impl AuthManager {
    pub fn new(pool: SqlitePool, mailer: Arc<dyn Mailer>, config: &ChatServerConfig) -> Self {
        info!("[Auth] Initialized");
        Self {
            otp: OtpStore::new(
                pool.clone(),
                config.otp_ttl_minutes,
                config.otp_resend_cooldown_secs,
                config.otp_max_attempts,
            ),
            pool,
            mailer,
            session_ttl: Duration::days(config.session_ttl_days),
            bcrypt_cost: config.bcrypt_cost,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new (unverified) user and mail a verification code
    pub async fn signup(&self, email: &str, username: &str, password: &str) -> Result<UserInfo> {
        let email = normalize_email(email);
        let username = username.trim();

        if !is_valid_email(&email) {
            return Err(Error::BadRequest("Invalid email address".to_string()));
        }
        validate_username(username)?;
        validate_password(password)?;

        let existing: Option<(String, bool)> =
            sqlx::query_as("SELECT id, is_verified FROM users WHERE email = ?")
                .bind(&email)
                .fetch_optional(&self.pool)
                .await?;

        if let Some((_, true)) = existing {
            return Err(Error::Conflict("Email already registered".to_string()));
        }

        let taken: Option<(String,)> = sqlx::query_as("SELECT id FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        if let Some((owner,)) = &taken {
            if existing.as_ref().map(|(id, _)| id) != Some(owner) {
                return Err(Error::Conflict("Username already taken".to_string()));
            }
        }

        // Cooldown is checked before anything is written.
        let code = self.otp.issue(&email, OtpPurpose::VerifyEmail).await?;

        let password_hash = hash(password, self.bcrypt_cost)?;

        let user_id = match existing {
            Some((id, false)) => {
                sqlx::query("UPDATE users SET username = ?, password_hash = ? WHERE id = ?")
                    .bind(username)
                    .bind(&password_hash)
                    .bind(&id)
                    .execute(&self.pool)
                    .await?;
                info!("[Auth] Pending signup refreshed: {} ({})", username, email);
                id
            }
            _ => {
                let id = Uuid::new_v4().to_string();
                sqlx::query(
                    "INSERT INTO users (id, email, username, password_hash, is_verified, created_at) VALUES (?, ?, ?, ?, 0, ?)",
                )
                .bind(&id)
                .bind(&email)
                .bind(username)
                .bind(&password_hash)
                .bind(fmt_ts(&Utc::now()))
                .execute(&self.pool)
                .await?;
                info!("[Auth] User registered: {} ({})", username, email);
                id
            }
        };

        self.deliver_code(&email, &code, OtpPurpose::VerifyEmail).await?;

        self.get_user(&user_id).await
    }

    async fn deliver_code(&self, email: &str, code: &str, purpose: OtpPurpose) -> Result<()> {
        if let Err(e) = self.mailer.send_otp(email, code, purpose).await {
            error!("[Auth] Failed to send {} code to {}: {:#}", purpose.as_str(), email, e);
            // Let the user retry right away.
            self.otp.discard(email, purpose).await?;
            return Err(Error::ServiceUnavailable(
                "Could not send the code, please try again".to_string(),
            ));
        }
        Ok(())
    }

    /// Confirm the signup code and open a session
    pub async fn verify_email(&self, email: &str, code: &str) -> Result<(UserInfo, Session)> {
        let email = normalize_email(email);

        let row: Option<(String, bool)> =
            sqlx::query_as("SELECT id, is_verified FROM users WHERE email = ? AND is_bot = 0")
                .bind(&email)
                .fetch_optional(&self.pool)
                .await?;
        let (user_id, verified) = row.ok_or(Error::InvalidOtp)?;
        if verified {
            return Err(Error::BadRequest("Email already verified".to_string()));
        }

        self.otp.verify(&email, OtpPurpose::VerifyEmail, code).await?;

        sqlx::query("UPDATE users SET is_verified = 1 WHERE id = ?")
            .bind(&user_id)
            .execute(&self.pool)
            .await?;

        let session = self.create_session(&user_id).await?;
        info!("[Auth] Email verified: {}", email);

        Ok((self.get_user(&user_id).await?, session))
    }

    /// Re-issue a code subject to the cooldown
    pub async fn resend_otp(&self, email: &str, purpose: OtpPurpose) -> Result<()> {
        let email = normalize_email(email);

        let row: Option<(bool,)> =
            sqlx::query_as("SELECT is_verified FROM users WHERE email = ? AND is_bot = 0")
                .bind(&email)
                .fetch_optional(&self.pool)
                .await?;

        match (row, purpose) {
            (Some((false,)), OtpPurpose::VerifyEmail)
            | (Some((true,)), OtpPurpose::ResetPassword) => {
                let code = self.otp.issue(&email, purpose).await?;
                self.deliver_code(&email, &code, purpose).await
            }
            (Some((true,)), OtpPurpose::VerifyEmail) => {
                Err(Error::BadRequest("Email already verified".to_string()))
            }
            // Unknown addresses get the same answer as known ones.
            _ => Ok(()),
        }
    }

    /// Login user and create session
    pub async fn login(&self, email: &str, password: &str) -> Result<(UserInfo, Session)> {
        let email = normalize_email(email);

        let row: Option<(String, String, bool)> = sqlx::query_as(
            "SELECT id, password_hash, is_verified FROM users WHERE email = ? AND is_bot = 0",
        )
        .bind(&email)
        .fetch_optional(&self.pool)
        .await?;

        let (user_id, password_hash, verified) = row.ok_or(Error::LoginFail)?;

        if !verify(password, &password_hash)? {
            warn!("[Auth] Failed login attempt for {}", email);
            return Err(Error::LoginFail);
        }

        if !verified {
            return Err(Error::EmailNotVerified);
        }

        let session = self.create_session(&user_id).await?;
        let user = self.get_user(&user_id).await?;

        info!("[Auth] User logged in: {}", user.username);

        Ok((user, session))
    }

    /// Start a password reset; silent for unknown addresses
    pub async fn forgot_password(&self, email: &str) -> Result<()> {
        self.resend_otp(email, OtpPurpose::ResetPassword).await
    }

    /// Finish a password reset and drop every session of the user.
    /// Returns the user's id so open sockets can be closed as well.
    pub async fn reset_password(
        &self,
        email: &str,
        code: &str,
        new_password: &str,
    ) -> Result<String> {
        let email = normalize_email(email);
        validate_password(new_password)?;

        let row: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM users WHERE email = ? AND is_verified = 1 AND is_bot = 0",
        )
        .bind(&email)
        .fetch_optional(&self.pool)
        .await?;
        let (user_id,) = row.ok_or(Error::InvalidOtp)?;

        self.otp.verify(&email, OtpPurpose::ResetPassword, code).await?;

        sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
            .bind(hash(new_password, self.bcrypt_cost)?)
            .bind(&user_id)
            .execute(&self.pool)
            .await?;

        self.invalidate_user_sessions(&user_id).await?;
        info!("[Auth] Password reset for {}", email);
        Ok(user_id)
    }

    pub async fn change_password(
        &self,
        user_id: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<()> {
        validate_password(new_password)?;

        let (password_hash,): (String,) =
            sqlx::query_as("SELECT password_hash FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(Error::NotFound("User"))?;

        if !verify(old_password, &password_hash)? {
            return Err(Error::BadRequest("Current password is incorrect".to_string()));
        }

        sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
            .bind(hash(new_password, self.bcrypt_cost)?)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Create new session
    async fn create_session(&self, user_id: &str) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            token: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            expires_at: now + self.session_ttl,
        };

        sqlx::query(
            "INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&session.token)
        .bind(&session.user_id)
        .bind(fmt_ts(&session.created_at))
        .bind(fmt_ts(&session.expires_at))
        .execute(&self.pool)
        .await?;

        // Cache session
        self.sessions
            .write()
            .await
            .insert(session.token.clone(), session.clone());

        Ok(session)
    }

    /// Validate session token, returning the owner's id
    pub async fn validate_session(&self, token: &str) -> Result<String> {
        // Check cache first
        if let Some(session) = self.sessions.read().await.get(token) {
            if session.expires_at > Utc::now() {
                return Ok(session.user_id.clone());
            }
        }

        let row: Option<(String, String, String)> = sqlx::query_as(
            "SELECT user_id, created_at, expires_at FROM sessions WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        let (user_id, created_at, expires_at) = row.ok_or(Error::AuthFailInvalidSession)?;
        let expires_at = parse_ts(&expires_at);
        if expires_at <= Utc::now() {
            self.logout(token).await?;
            return Err(Error::AuthFailInvalidSession);
        }

        self.sessions.write().await.insert(
            token.to_string(),
            Session {
                token: token.to_string(),
                user_id: user_id.clone(),
                created_at: parse_ts(&created_at),
                expires_at,
            },
        );

        Ok(user_id)
    }

    /// Logout user (invalidate session)
    pub async fn logout(&self, token: &str) -> Result<()> {
        self.sessions.write().await.remove(token);

        sqlx::query("DELETE FROM sessions WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;

        info!("[Auth] Session invalidated");
        Ok(())
    }

    async fn invalidate_user_sessions(&self, user_id: &str) -> Result<()> {
        self.sessions
            .write()
            .await
            .retain(|_, s| s.user_id != user_id);

        sqlx::query("DELETE FROM sessions WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop sessions past their expiry, returning their tokens
    pub async fn purge_expired_sessions(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let expired: Vec<(String,)> =
            sqlx::query_as("DELETE FROM sessions WHERE expires_at <= ? RETURNING token")
                .bind(fmt_ts(&now))
                .fetch_all(&self.pool)
                .await?;

        let mut tokens: Vec<String> = expired.into_iter().map(|(token,)| token).collect();
        {
            let mut sessions = self.sessions.write().await;
            sessions.retain(|token, s| {
                if s.expires_at > now {
                    return true;
                }
                if !tokens.contains(token) {
                    tokens.push(token.clone());
                }
                false
            });
        }

        if !tokens.is_empty() {
            info!("[Auth] Purged {} expired session(s)", tokens.len());
        }
        Ok(tokens)
    }

    /// Get user by ID
    pub async fn get_user(&self, user_id: &str) -> Result<UserInfo> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS))
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(UserInfo::from).ok_or(Error::NotFound("User"))
    }

    /// Verified human users other than `exclude_id`, optionally filtered
    pub async fn list_users(&self, exclude_id: &str, query: Option<&str>) -> Result<Vec<UserInfo>> {
        let pattern = query
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(|q| format!("%{}%", escape_like(&q.to_lowercase())));

        let rows: Vec<UserRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM users
            WHERE is_verified = 1 AND is_bot = 0 AND id != ?
              AND (? IS NULL
                   OR lower(username) LIKE ? ESCAPE '\'
                   OR email LIKE ? ESCAPE '\')
            ORDER BY username
            LIMIT 50
            "#,
            USER_COLUMNS
        ))
        .bind(exclude_id)
        .bind(pattern.clone())
        .bind(pattern.clone())
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(UserInfo::from).collect())
    }

    /// Update the editable profile fields
    pub async fn update_profile(
        &self,
        user_id: &str,
        username: Option<String>,
        bio: Option<String>,
        avatar_url: Option<String>,
    ) -> Result<UserInfo> {
        if let Some(username) = username.as_deref().map(str::trim) {
            validate_username(username)?;
            let taken: Option<(String,)> =
                sqlx::query_as("SELECT id FROM users WHERE username = ? AND id != ?")
                    .bind(username)
                    .bind(user_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if taken.is_some() {
                return Err(Error::Conflict("Username already taken".to_string()));
            }
            sqlx::query("UPDATE users SET username = ? WHERE id = ?")
                .bind(username)
                .bind(user_id)
                .execute(&self.pool)
                .await?;
        }

        if let Some(bio) = bio {
            let bio = bio.trim();
            if bio.chars().count() > 200 {
                return Err(Error::BadRequest("Bio is limited to 200 characters".to_string()));
            }
            sqlx::query("UPDATE users SET bio = ? WHERE id = ?")
                .bind((!bio.is_empty()).then_some(bio))
                .bind(user_id)
                .execute(&self.pool)
                .await?;
        }

        if let Some(avatar_url) = avatar_url {
            let avatar_url = avatar_url.trim();
            sqlx::query("UPDATE users SET avatar_url = ? WHERE id = ?")
                .bind((!avatar_url.is_empty()).then_some(avatar_url))
                .bind(user_id)
                .execute(&self.pool)
                .await?;
        }

        self.get_user(user_id).await
    }

    /// Record presence and stamp last_seen
    pub async fn set_online(&self, user_id: &str, online: bool) -> Result<Presence> {
        let now = Utc::now();
        sqlx::query("UPDATE users SET is_online = ?, last_seen = ? WHERE id = ?")
            .bind(online)
            .bind(fmt_ts(&now))
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(Presence {
            user_id: user_id.to_string(),
            is_online: online,
            last_seen: Some(now),
        })
    }

    /// Nobody is connected right after a restart
    pub async fn reset_presence(&self) -> Result<()> {
        sqlx::query("UPDATE users SET is_online = 0 WHERE is_online = 1 AND is_bot = 0")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Make sure the assistant account exists
    pub async fn ensure_bot_user(&self, username: &str) -> Result<UserInfo> {
        let row: Option<(String, bool)> =
            sqlx::query_as("SELECT id, is_bot FROM users WHERE username = ?")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((id, true)) => self.get_user(&id).await,
            Some((_, false)) => Err(Error::Conflict(format!(
                "Username {} is taken by a regular account",
                username
            ))),
            None => {
                let id = Uuid::new_v4().to_string();
                sqlx::query(
                    "INSERT INTO users (id, email, username, password_hash, is_verified, is_bot, is_online, created_at) VALUES (?, ?, ?, '!', 1, 1, 1, ?)",
                )
                .bind(&id)
                .bind(format!("{}@bot.local", username))
                .bind(username)
                .bind(fmt_ts(&Utc::now()))
                .execute(&self.pool)
                .await?;
                info!("[Auth] Created bot user @{}", username);
                self.get_user(&id).await
            }
        }
    }
}
