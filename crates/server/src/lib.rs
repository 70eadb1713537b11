//! Chat Server Library
//!
//! Accounts with email verification, direct / group / assistant
//! conversations, and real-time delivery over WebSocket, backed by SQLite.

pub mod ai;
pub mod auth;
pub mod config;
pub mod conversations;
pub mod ctx;
pub mod error;
pub mod mailer;
pub mod messages;
pub mod models;
pub mod realtime;
pub mod router;
pub mod store;
pub mod uploads;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ai::{AiBackend, AiChatManager, AiConfig, OpenRouterBackend};
use auth::AuthManager;
use config::{AppState, ChatServerConfig};
use conversations::ConversationStore;
use mailer::{LogMailer, Mailer, SmtpMailer};
use messages::MessageStore;
use realtime::{relay_typing, Hub, TypingTracker};
use sqlx::SqlitePool;
use uploads::UploadStore;

/// How often stale typing indicators are expired
const TYPING_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// How often expired sessions are purged
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Wire up every manager around one pool
pub async fn build_state(
    config: ChatServerConfig,
    pool: SqlitePool,
    mailer: Arc<dyn Mailer>,
    ai_backend: Option<Arc<dyn AiBackend>>,
) -> anyhow::Result<AppState> {
    let hub = Arc::new(Hub::new());
    let auth = Arc::new(AuthManager::new(pool.clone(), mailer, &config));
    let conversations = Arc::new(ConversationStore::new(pool.clone(), hub.clone()));
    let messages = Arc::new(MessageStore::new(pool, hub.clone()));
    let uploads = Arc::new(UploadStore::new(
        config.upload_dir.clone(),
        config.max_upload_bytes(),
    ));

    let ai_manager = match ai_backend {
        Some(backend) => {
            let bot = auth.ensure_bot_user(&config.ai_bot_username).await?;
            Some(Arc::new(AiChatManager::new(
                AiConfig::for_bot(&bot.username),
                backend,
                bot,
                messages.clone(),
                conversations.clone(),
                hub.clone(),
            )))
        }
        None => {
            info!("[AI] OPENROUTER_API_KEY not set, assistant disabled");
            None
        }
    };

    Ok(AppState {
        config,
        auth,
        conversations,
        messages,
        hub,
        typing: Arc::new(TypingTracker::new()),
        uploads,
        ai_manager,
    })
}

/// Expire typing indicators whose client went quiet
fn spawn_typing_sweeper(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TYPING_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            for expired in state.typing.sweep() {
                relay_typing(&state, expired).await;
            }
        }
    });
}

/// Purge expired sessions and close any socket still riding on one
fn spawn_session_sweeper(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            match state.auth.purge_expired_sessions().await {
                Ok(tokens) => {
                    for token in tokens {
                        state.hub.close_session(&token);
                    }
                }
                Err(e) => warn!("[Auth] Session sweep failed: {}", e),
            }
        }
    });
}

pub async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        // Already set, ignore
    }

    info!("=== Chat Server ===");

    let config = ChatServerConfig::from_env();
    config.ensure_dirs().await?;
    info!("Data directory: {:?}", config.data_dir);
    info!("Uploads directory: {:?}", config.upload_dir);

    let pool = store::connect(&config.database_url).await?;

    let mailer: Arc<dyn Mailer> = match &config.smtp {
        Some(smtp) => Arc::new(SmtpMailer::new(smtp)?),
        None => {
            warn!("[Mail] SMTP_HOST not set, codes will only be logged");
            Arc::new(LogMailer)
        }
    };

    let ai_backend = OpenRouterBackend::from_config(&config)
        .map(|backend| Arc::new(backend) as Arc<dyn AiBackend>);

    let state = build_state(config, pool, mailer, ai_backend).await?;
    state.auth.reset_presence().await?;
    spawn_typing_sweeper(state.clone());
    spawn_session_sweeper(state.clone());

    let port = state.config.port;
    let app = router::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
