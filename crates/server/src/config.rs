//! Chat server configuration

use std::path::PathBuf;
use std::sync::Arc;

use crate::ai::AiChatManager;
use crate::auth::AuthManager;
use crate::conversations::ConversationStore;
use crate::messages::MessageStore;
use crate::realtime::{Hub, TypingTracker};
use crate::uploads::UploadStore;

/// SMTP settings for OTP delivery
#[derive(Clone, Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    pub from: String,
}

/// Configuration for the Chat Server
#[derive(Clone, Debug)]
pub struct ChatServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Root data directory
    pub data_dir: PathBuf,
    /// SQLite connection string
    pub database_url: String,
    /// Uploaded image directory
    pub upload_dir: PathBuf,
    /// Max upload size in MB
    pub max_upload_mb: usize,
    /// Session lifetime in days
    pub session_ttl_days: i64,
    /// bcrypt work factor for password hashes
    pub bcrypt_cost: u32,
    /// OTP lifetime in minutes
    pub otp_ttl_minutes: i64,
    /// Wrong guesses allowed per code
    pub otp_max_attempts: i64,
    /// Minimum gap between two codes for the same address
    pub otp_resend_cooldown_secs: i64,
    /// SMTP relay; codes are only logged when unset
    pub smtp: Option<SmtpConfig>,
    /// OpenRouter API key; the assistant is disabled when unset
    pub openrouter_api_key: Option<String>,
    pub openrouter_base_url: String,
    pub openrouter_model: String,
    /// Username of the assistant bot
    pub ai_bot_username: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Default for ChatServerConfig {
    fn default() -> Self {
        Self::with_base_dir("data")
    }
}

impl ChatServerConfig {
    /// Create config with custom base directory
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let data_dir = base_dir.into();
        Self {
            port: 3001,
            database_url: format!(
                "sqlite://{}",
                data_dir
                    .join("chat.sqlite")
                    .to_string_lossy()
                    .replace('\\', "/")
            ),
            upload_dir: data_dir.join("uploads"),
            data_dir,
            max_upload_mb: 5,
            session_ttl_days: 7,
            bcrypt_cost: bcrypt::DEFAULT_COST,
            otp_ttl_minutes: 10,
            otp_max_attempts: 5,
            otp_resend_cooldown_secs: 60,
            smtp: None,
            openrouter_api_key: None,
            openrouter_base_url: "https://openrouter.ai/api/v1".to_string(),
            openrouter_model: "openai/gpt-4o-mini".to_string(),
            ai_bot_username: "assistant".to_string(),
        }
    }

    /// Build config from environment variables
    pub fn from_env() -> Self {
        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));
        let mut config = Self::with_base_dir(data_dir);

        config.port = env_or("PORT", config.port);
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(dir) = std::env::var("UPLOAD_DIR") {
            config.upload_dir = PathBuf::from(dir);
        }
        config.max_upload_mb = env_or("MAX_UPLOAD_MB", config.max_upload_mb);
        config.session_ttl_days = env_or("SESSION_TTL_DAYS", config.session_ttl_days);
        config.bcrypt_cost = env_or("BCRYPT_COST", config.bcrypt_cost);
        config.otp_ttl_minutes = env_or("OTP_TTL_MINUTES", config.otp_ttl_minutes);
        config.otp_max_attempts = env_or("OTP_MAX_ATTEMPTS", config.otp_max_attempts);
        config.otp_resend_cooldown_secs =
            env_or("OTP_RESEND_COOLDOWN_SECS", config.otp_resend_cooldown_secs);

        if let Ok(host) = std::env::var("SMTP_HOST") {
            let username = std::env::var("SMTP_USERNAME").unwrap_or_default();
            config.smtp = Some(SmtpConfig {
                host,
                port: std::env::var("SMTP_PORT").ok().and_then(|s| s.parse().ok()),
                password: std::env::var("SMTP_PASSWORD").unwrap_or_default(),
                from: std::env::var("SMTP_FROM").unwrap_or_else(|_| username.clone()),
                username,
            });
        }

        config.openrouter_api_key = std::env::var("OPENROUTER_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());
        if let Ok(url) = std::env::var("OPENROUTER_BASE_URL") {
            config.openrouter_base_url = url;
        }
        if let Ok(model) = std::env::var("OPENROUTER_MODEL") {
            config.openrouter_model = model;
        }
        if let Ok(name) = std::env::var("AI_BOT_USERNAME") {
            config.ai_bot_username = name;
        }

        config
    }

    /// Max upload size in bytes
    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb * 1024 * 1024
    }

    /// Ensure all directories exist
    pub async fn ensure_dirs(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        tokio::fs::create_dir_all(&self.upload_dir).await?;
        Ok(())
    }
}

/// App state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: ChatServerConfig,
    pub auth: Arc<AuthManager>,
    pub conversations: Arc<ConversationStore>,
    pub messages: Arc<MessageStore>,
    pub hub: Arc<Hub>,
    pub typing: Arc<TypingTracker>,
    pub uploads: Arc<UploadStore>,
    pub ai_manager: Option<Arc<AiChatManager>>,
}
