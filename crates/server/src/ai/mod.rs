//! AI assistant
//!
//! The assistant is a regular (bot) user. It answers every message in an
//! `ai` conversation and any message that mentions `@<bot>` elsewhere.
//! Replies are produced off the request path: the hook spawns a task that
//! shows the bot typing, asks the backend, and posts the answer.

use crate::config::{AppState, ChatServerConfig};
use crate::conversations::ConversationStore;
use crate::messages::MessageStore;
use crate::models::{ConversationKind, Message, MessageKind, TypingIndicator, UserInfo};
use crate::realtime::{Hub, ServerEvent};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use axum::{extract::State, Json};
use chrono::Utc;
use genai::adapter::AdapterKind;
use genai::chat::{ChatMessage, ChatRequest};
use genai::resolver::{self, AuthData, Endpoint, ServiceTargetResolver};
use genai::{Client as GenAIClient, ModelIden, ServiceTarget};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const APOLOGY: &str =
    "Sorry, I couldn't come up with a reply right now. Please try again in a moment.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One entry of the prompt sent to the model
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

impl From<ChatTurn> for ChatMessage {
    fn from(turn: ChatTurn) -> Self {
        match turn.role {
            ChatRole::System => ChatMessage::system(turn.content),
            ChatRole::User => ChatMessage::user(turn.content),
            ChatRole::Assistant => ChatMessage::assistant(turn.content),
        }
    }
}

fn chat_request(turns: Vec<ChatTurn>) -> ChatRequest {
    ChatRequest::new(turns.into_iter().map(ChatMessage::from).collect())
}

#[async_trait]
pub trait AiBackend: Send + Sync {
    async fn complete(&self, turns: Vec<ChatTurn>) -> Result<String>;
}

/// GenAI client routed to OpenRouter's OpenAI-compatible API
pub struct OpenRouterBackend {
    client: GenAIClient,
    model: String,
}

impl OpenRouterBackend {
    /// None when no API key is configured
    pub fn from_config(config: &ChatServerConfig) -> Option<Self> {
        let api_key = config.openrouter_api_key.clone()?;
        // The OpenAI adapter joins `chat/completions` onto the endpoint.
        let base_url = format!("{}/", config.openrouter_base_url.trim_end_matches('/'));

        let resolver = ServiceTargetResolver::from_resolver_fn(
            move |target: ServiceTarget| -> std::result::Result<ServiceTarget, resolver::Error> {
                Ok(ServiceTarget {
                    endpoint: Endpoint::from_owned(base_url.clone()),
                    auth: AuthData::from_single(api_key.clone()),
                    model: ModelIden::new(AdapterKind::OpenAI, target.model.model_name),
                })
            },
        );
        let client = GenAIClient::builder()
            .with_service_target_resolver(resolver)
            .build();

        Some(Self {
            client,
            model: config.openrouter_model.clone(),
        })
    }
}

#[async_trait]
impl AiBackend for OpenRouterBackend {
    async fn complete(&self, turns: Vec<ChatTurn>) -> Result<String> {
        debug!("[AI] Calling {} with {} turns", self.model, turns.len());

        let response = self
            .client
            .exec_chat(&self.model, chat_request(turns), None)
            .await
            .map_err(|e| anyhow!("GenAI error: {}", e))?;

        response
            .first_text()
            .map(str::to_string)
            .context("Completion had no content")
    }
}

/// AI Assistant configuration
#[derive(Clone, Debug)]
pub struct AiConfig {
    pub system_prompt: String,
    /// Messages of history sent with each request
    pub history_limit: i64,
}

impl AiConfig {
    pub fn for_bot(username: &str) -> Self {
        Self {
            system_prompt: format!(
                "You are @{}, a friendly assistant inside a chat app. \
                 Keep answers short and use Markdown where it helps.",
                username
            ),
            history_limit: 20,
        }
    }
}

/// AI Chat Manager
pub struct AiChatManager {
    config: AiConfig,
    backend: Arc<dyn AiBackend>,
    bot: UserInfo,
    messages: Arc<MessageStore>,
    conversations: Arc<ConversationStore>,
    hub: Arc<Hub>,
}

impl AiChatManager {
    pub fn new(
        config: AiConfig,
        backend: Arc<dyn AiBackend>,
        bot: UserInfo,
        messages: Arc<MessageStore>,
        conversations: Arc<ConversationStore>,
        hub: Arc<Hub>,
    ) -> Self {
        hub.pin_online(&bot.id);
        info!("[@{}] AI Chat Manager initialized", bot.username);
        Self {
            config,
            backend,
            bot,
            messages,
            conversations,
            hub,
        }
    }

    pub fn bot(&self) -> &UserInfo {
        &self.bot
    }

    /// `@name` as a whole word, case-insensitive
    pub fn mentions_bot(&self, content: &str) -> bool {
        let needle = format!("@{}", self.bot.username.to_lowercase());
        let haystack = content.to_lowercase();
        haystack.match_indices(&needle).any(|(idx, _)| {
            haystack[idx + needle.len()..]
                .chars()
                .next()
                .map_or(true, |c| !(c.is_alphanumeric() || c == '_'))
        })
    }

    /// Hook for message processing - call this when new messages arrive
    pub fn on_new_message(self: &Arc<Self>, message: &Message) -> Option<JoinHandle<()>> {
        if message.sender_id == self.bot.id || message.kind == MessageKind::System {
            return None;
        }
        let manager = Arc::clone(self);
        let message = message.clone();
        Some(tokio::spawn(async move { manager.process_message(message).await }))
    }

    async fn process_message(&self, trigger: Message) {
        let kind = match self.conversations.kind(&trigger.conversation_id).await {
            Ok(kind) => kind,
            Err(e) => {
                warn!("[@{}] Could not load conversation: {}", self.bot.username, e);
                return;
            }
        };
        if kind != ConversationKind::Ai && !self.mentions_bot(&trigger.content) {
            return;
        }

        info!(
            "[@{}] Triggered in {} by {}",
            self.bot.username, trigger.conversation_id, trigger.sender_id
        );

        self.set_typing(&trigger.conversation_id, true).await;

        let reply = match self.generate_reply(&trigger.conversation_id, kind).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                warn!("[@{}] Empty completion", self.bot.username);
                APOLOGY.to_string()
            }
            Err(e) => {
                warn!("[@{}] Failed to generate response: {:#}", self.bot.username, e);
                APOLOGY.to_string()
            }
        };

        self.set_typing(&trigger.conversation_id, false).await;

        match self
            .messages
            .post_as(&trigger.conversation_id, &self.bot.id, MessageKind::Text, &reply)
            .await
        {
            Ok(msg) => info!("[@{}] Responded with {}", self.bot.username, msg.id),
            Err(e) => warn!("[@{}] Failed to post response: {}", self.bot.username, e),
        }
    }

    async fn set_typing(&self, conversation_id: &str, is_typing: bool) {
        let participants = match self.conversations.participant_ids(conversation_id).await {
            Ok(ids) => ids,
            Err(_) => return,
        };
        let event = ServerEvent::Typing(TypingIndicator {
            conversation_id: conversation_id.to_string(),
            user_id: self.bot.id.clone(),
            is_typing,
            timestamp: Utc::now(),
        });
        self.hub
            .send_to_users(participants.iter().filter(|id| **id != self.bot.id), &event);
    }

    /// System prompt followed by recent history, oldest first
    async fn build_prompt(
        &self,
        conversation_id: &str,
        kind: ConversationKind,
    ) -> Result<Vec<ChatTurn>> {
        let history = self
            .messages
            .recent(conversation_id, self.config.history_limit)
            .await?;

        // In shared conversations the model needs to know who is talking.
        let names: HashMap<String, String> = if kind == ConversationKind::Ai {
            HashMap::new()
        } else {
            self.conversations
                .participants(conversation_id)
                .await?
                .into_iter()
                .map(|u| (u.id, u.username))
                .collect()
        };

        let mut turns = vec![ChatTurn::new(ChatRole::System, &self.config.system_prompt)];
        for msg in history.iter().filter(|m| m.kind != MessageKind::System) {
            let mut content = msg.content.clone();
            if msg.kind == MessageKind::Image {
                content = format!("[shared an image] {}", content).trim_end().to_string();
            }
            if msg.sender_id == self.bot.id {
                turns.push(ChatTurn::new(ChatRole::Assistant, content));
            } else {
                let content = match names.get(&msg.sender_id) {
                    Some(name) => format!("{}: {}", name, content),
                    None => content,
                };
                turns.push(ChatTurn::new(ChatRole::User, content));
            }
        }
        Ok(turns)
    }

    async fn generate_reply(
        &self,
        conversation_id: &str,
        kind: ConversationKind,
    ) -> Result<String> {
        let turns = self.build_prompt(conversation_id, kind).await?;
        self.backend.complete(turns).await
    }
}

#[derive(Debug, Serialize)]
pub struct AiStatus {
    pub enabled: bool,
    pub bot: Option<UserInfo>,
}

/// GET /api/ai
pub async fn status(State(state): State<AppState>) -> Json<AiStatus> {
    Json(AiStatus {
        enabled: state.ai_manager.is_some(),
        bot: state.ai_manager.as_ref().map(|ai| ai.bot().clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::tests::seed;
    use crate::models::{fmt_ts, SendMessageInput};
    use crate::store::memory_pool;
    use parking_lot::Mutex;

    struct StubBackend {
        reply: Option<String>,
        seen: Mutex<Vec<Vec<ChatTurn>>>,
    }

    #[async_trait]
    impl AiBackend for StubBackend {
        async fn complete(&self, turns: Vec<ChatTurn>) -> Result<String> {
            self.seen.lock().push(turns);
            match &self.reply {
                Some(reply) => Ok(reply.clone()),
                None => Err(anyhow!("backend down")),
            }
        }
    }

    struct Fixture {
        manager: Arc<AiChatManager>,
        backend: Arc<StubBackend>,
        messages: Arc<MessageStore>,
        conversations: Arc<ConversationStore>,
        hub: Arc<Hub>,
    }

    async fn fixture(reply: Option<&str>) -> Fixture {
        let pool = memory_pool().await;
        seed(&pool).await;
        sqlx::query(
            "INSERT INTO users (id, email, username, password_hash, is_verified, is_bot, created_at) VALUES ('bot', 'assistant@bot.local', 'assistant', '!', 1, 1, ?)",
        )
        .bind(fmt_ts(&Utc::now()))
        .execute(&pool)
        .await
        .unwrap();

        let hub = Arc::new(Hub::new());
        let messages = Arc::new(MessageStore::new(pool.clone(), hub.clone()));
        let conversations = Arc::new(ConversationStore::new(pool, hub.clone()));
        let bot = UserInfo {
            id: "bot".into(),
            email: "assistant@bot.local".into(),
            username: "assistant".into(),
            avatar_url: None,
            bio: None,
            is_bot: true,
            is_online: true,
            last_seen: None,
            created_at: Utc::now(),
        };
        let backend = Arc::new(StubBackend {
            reply: reply.map(str::to_string),
            seen: Mutex::new(Vec::new()),
        });
        let manager = Arc::new(AiChatManager::new(
            AiConfig::for_bot("assistant"),
            backend.clone(),
            bot,
            messages.clone(),
            conversations.clone(),
            hub.clone(),
        ));
        Fixture {
            manager,
            backend,
            messages,
            conversations,
            hub,
        }
    }

    fn text(content: &str) -> SendMessageInput {
        SendMessageInput {
            content: Some(content.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_turns_become_chat_request() {
        let req = chat_request(vec![
            ChatTurn::new(ChatRole::System, "be brief"),
            ChatTurn::new(ChatRole::User, "hi"),
            ChatTurn::new(ChatRole::Assistant, "hello"),
        ]);
        assert_eq!(req.messages.len(), 3);
    }

    #[tokio::test]
    async fn test_mentions_bot_whole_word() {
        let f = fixture(Some("ok")).await;
        assert!(f.manager.mentions_bot("hey @Assistant, help"));
        assert!(f.manager.mentions_bot("@assistant"));
        assert!(!f.manager.mentions_bot("@assistants are great"));
        assert!(!f.manager.mentions_bot("assistant please"));
        assert!(f.hub.is_online("bot"));
    }

    #[tokio::test]
    async fn test_replies_in_ai_conversation() {
        let f = fixture(Some("  Hello there!  ")).await;
        let (conv, _) = f.conversations.get_or_create_ai("u1", "bot").await.unwrap();
        let msg = f.messages.send(&conv.id, "u1", text("hi bot")).await.unwrap();

        let mut alice = f.hub.connect("u1", "t-u1");
        f.manager.on_new_message(&msg).unwrap().await.unwrap();

        let history = f.messages.recent(&conv.id, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].sender_id, "bot");
        assert_eq!(history[1].content, "Hello there!");

        let seen = f.backend.seen.lock();
        assert_eq!(seen[0][0].role, ChatRole::System);
        assert_eq!(seen[0].last().unwrap(), &ChatTurn::new(ChatRole::User, "hi bot"));
        drop(seen);

        assert!(matches!(
            alice.rx.try_recv().unwrap(),
            ServerEvent::Typing(TypingIndicator { is_typing: true, .. })
        ));
        assert!(matches!(
            alice.rx.try_recv().unwrap(),
            ServerEvent::Typing(TypingIndicator { is_typing: false, .. })
        ));
        assert!(matches!(alice.rx.try_recv().unwrap(), ServerEvent::NewMessage(_)));
    }

    #[tokio::test]
    async fn test_bot_messages_do_not_trigger() {
        let f = fixture(Some("reply")).await;
        let (conv, _) = f.conversations.get_or_create_ai("u1", "bot").await.unwrap();
        let own = f
            .messages
            .post_as(&conv.id, "bot", MessageKind::Text, "from the bot")
            .await
            .unwrap();
        assert!(f.manager.on_new_message(&own).is_none());
    }

    #[tokio::test]
    async fn test_mention_in_direct_conversation() {
        let f = fixture(Some("On it")).await;

        let plain = f.messages.send("c1", "u1", text("just us")).await.unwrap();
        f.manager.on_new_message(&plain).unwrap().await.unwrap();
        assert!(f.backend.seen.lock().is_empty());

        let mention = f
            .messages
            .send("c1", "u2", text("@assistant what's 2+2?"))
            .await
            .unwrap();
        f.manager.on_new_message(&mention).unwrap().await.unwrap();

        let seen = f.backend.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0][1].content, "alice: just us");
        assert_eq!(seen[0][2].content, "bob: @assistant what's 2+2?");
        drop(seen);

        let history = f.messages.recent("c1", 10).await.unwrap();
        let reply = history.last().unwrap();
        assert_eq!(reply.content, "On it");
        assert_eq!(reply.sender_id, "bot");

        // The reply lands without the bot joining the conversation.
        let members = f.conversations.participant_ids("c1").await.unwrap();
        assert!(!members.contains(&reply.sender_id));
    }

    #[tokio::test]
    async fn test_backend_failure_posts_apology() {
        let f = fixture(None).await;
        let (conv, _) = f.conversations.get_or_create_ai("u2", "bot").await.unwrap();
        let msg = f.messages.send(&conv.id, "u2", text("hello?")).await.unwrap();
        f.manager.on_new_message(&msg).unwrap().await.unwrap();

        let history = f.messages.recent(&conv.id, 10).await.unwrap();
        assert_eq!(history.last().unwrap().content, APOLOGY);
        assert_eq!(history.last().unwrap().sender_id, "bot");
    }
}
