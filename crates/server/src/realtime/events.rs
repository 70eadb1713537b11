//! WebSocket frames
//!
//! Every frame is a JSON object `{"event": <name>, "data": <payload>}`.

use crate::models::{Conversation, Message, Presence, Reaction, TypingIndicator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server -> client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        user_id: String,
    },
    OnlineUsers {
        user_ids: Vec<String>,
    },
    Presence(Presence),
    NewMessage(Message),
    MessageDeleted {
        conversation_id: String,
        message_id: String,
    },
    MessagesRead {
        conversation_id: String,
        reader_id: String,
        message_ids: Vec<String>,
        read_at: DateTime<Utc>,
    },
    ReactionUpdated {
        conversation_id: String,
        message_id: String,
        reactions: Vec<Reaction>,
    },
    Typing(TypingIndicator),
    ConversationUpdated(Box<Conversation>),
    ConversationRemoved {
        conversation_id: String,
    },
    Pong,
    Error {
        message: String,
    },
}

/// Client -> server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    SendMessage {
        conversation_id: String,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        image_url: Option<String>,
        #[serde(default)]
        client_id: Option<String>,
    },
    Typing {
        conversation_id: String,
    },
    StopTyping {
        conversation_id: String,
    },
    MarkRead {
        conversation_id: String,
    },
    React {
        message_id: String,
        emoji: String,
    },
    Ping,
}
