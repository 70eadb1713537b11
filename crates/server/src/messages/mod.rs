//! Message storage, receipts and reactions
//!
//! Every mutation is written to SQLite first and then fanned out to the
//! conversation's participants through the hub.

pub mod handlers;

use crate::error::{Error, Result};
use crate::models::{
    fmt_ts, parse_ts, Message, MessageKind, ReadReceipt, Reaction, SendMessageInput,
};
use crate::realtime::{Hub, ServerEvent};
use crate::store;
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub const MAX_CONTENT_CHARS: usize = 4000;
pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 100;
const MAX_EMOJI_BYTES: usize = 32;

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, client_id, kind, content, image_url, created_at, deleted";

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    sender_id: String,
    client_id: Option<String>,
    kind: String,
    content: String,
    image_url: Option<String>,
    created_at: String,
    deleted: bool,
}

impl MessageRow {
    fn into_message(self) -> Message {
        Message {
            kind: self.kind.parse().unwrap_or_default(),
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            client_id: self.client_id,
            content: self.content,
            image_url: self.image_url,
            created_at: parse_ts(&self.created_at),
            deleted: self.deleted,
            read_by: Vec::new(),
            reactions: Vec::new(),
        }
    }
}

/// Fill in receipts and reactions for a batch of messages
async fn hydrate(pool: &SqlitePool, rows: Vec<MessageRow>) -> Result<Vec<Message>> {
    let mut messages: Vec<Message> = rows.into_iter().map(MessageRow::into_message).collect();
    if messages.is_empty() {
        return Ok(messages);
    }

    let mut reads: HashMap<String, Vec<ReadReceipt>> = HashMap::new();
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT message_id, user_id, read_at FROM message_reads WHERE message_id IN (",
    );
    let mut ids = qb.separated(", ");
    for m in &messages {
        ids.push_bind(m.id.clone());
    }
    qb.push(") ORDER BY read_at");
    let rows: Vec<(String, String, String)> = qb.build_query_as().fetch_all(pool).await?;
    for (message_id, user_id, read_at) in rows {
        reads.entry(message_id).or_default().push(ReadReceipt {
            user_id,
            read_at: parse_ts(&read_at),
        });
    }

    let mut reactions: HashMap<String, Vec<Reaction>> = HashMap::new();
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT message_id, user_id, emoji, created_at FROM message_reactions WHERE message_id IN (",
    );
    let mut ids = qb.separated(", ");
    for m in &messages {
        ids.push_bind(m.id.clone());
    }
    qb.push(") ORDER BY created_at");
    let rows: Vec<(String, String, String, String)> = qb.build_query_as().fetch_all(pool).await?;
    for (message_id, user_id, emoji, created_at) in rows {
        reactions.entry(message_id).or_default().push(Reaction {
            user_id,
            emoji,
            created_at: parse_ts(&created_at),
        });
    }

    for m in &mut messages {
        m.read_by = reads.remove(&m.id).unwrap_or_default();
        m.reactions = reactions.remove(&m.id).unwrap_or_default();
    }
    Ok(messages)
}

/// Load one message with receipts and reactions
pub(crate) async fn load_message(pool: &SqlitePool, message_id: &str) -> Result<Option<Message>> {
    let row: Option<MessageRow> =
        sqlx::query_as(&format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS))
            .bind(message_id)
            .fetch_optional(pool)
            .await?;

    Ok(match row {
        Some(row) => hydrate(pool, vec![row]).await?.pop(),
        None => None,
    })
}

/// Messages from others that `viewer_id` has not read
pub(crate) async fn unread_count(
    pool: &SqlitePool,
    conversation_id: &str,
    viewer_id: &str,
) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM messages m
        WHERE m.conversation_id = ? AND m.sender_id != ? AND m.deleted = 0 AND m.kind != 'system'
          AND NOT EXISTS (
              SELECT 1 FROM message_reads r WHERE r.message_id = m.id AND r.user_id = ?
          )
        "#,
    )
    .bind(conversation_id)
    .bind(viewer_id)
    .bind(viewer_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

fn normalize_input(input: SendMessageInput) -> Result<(MessageKind, String, Option<String>)> {
    let content = input.content.unwrap_or_default().trim().to_string();
    let image_url = input
        .image_url
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty());

    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(Error::BadRequest(format!(
            "Message is limited to {} characters",
            MAX_CONTENT_CHARS
        )));
    }

    match image_url {
        Some(url) => Ok((MessageKind::Image, content, Some(url))),
        None if content.is_empty() => Err(Error::BadRequest(
            "Message must have text or an image".to_string(),
        )),
        None => Ok((MessageKind::Text, content, None)),
    }
}

pub struct MessageStore {
    pool: SqlitePool,
    hub: Arc<Hub>,
}

impl MessageStore {
    pub fn new(pool: SqlitePool, hub: Arc<Hub>) -> Self {
        Self { pool, hub }
    }

    async fn ensure_participant(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(Error::NotFound("Conversation"));
        }
        if !store::is_participant(&self.pool, conversation_id, user_id).await? {
            return Err(Error::Forbidden(
                "You are not a member of this conversation".to_string(),
            ));
        }
        Ok(())
    }

    async fn fan_out(&self, conversation_id: &str, event: ServerEvent) -> Result<()> {
        let participants = store::participant_ids(&self.pool, conversation_id).await?;
        self.hub.send_to_users(&participants, &event);
        Ok(())
    }

    /// Post a message on behalf of a participant
    pub async fn send(
        &self,
        conversation_id: &str,
        sender_id: &str,
        input: SendMessageInput,
    ) -> Result<Message> {
        self.ensure_participant(conversation_id, sender_id).await?;

        let client_id = input
            .client_id
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        // A retried optimistic send resolves to the stored copy.
        if let Some(client_id) = &client_id {
            if let Some(existing) =
                self.by_client_id(conversation_id, sender_id, client_id).await?
            {
                debug!("Duplicate client_id {} resolved to {}", client_id, existing.id);
                return Ok(existing);
            }
        }

        let (kind, content, image_url) = normalize_input(input)?;
        self.insert(conversation_id, sender_id, kind, &content, image_url, client_id)
            .await
    }

    async fn by_client_id(
        &self,
        conversation_id: &str,
        sender_id: &str,
        client_id: &str,
    ) -> Result<Option<Message>> {
        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM messages WHERE conversation_id = ? AND sender_id = ? AND client_id = ?",
        )
        .bind(conversation_id)
        .bind(sender_id)
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;
        match existing {
            Some((id,)) => load_message(&self.pool, &id).await,
            None => Ok(None),
        }
    }

    /// Post without a membership check (system notices, assistant replies)
    pub async fn post_as(
        &self,
        conversation_id: &str,
        sender_id: &str,
        kind: MessageKind,
        content: &str,
    ) -> Result<Message> {
        self.insert(conversation_id, sender_id, kind, content, None, None)
            .await
    }

    async fn insert(
        &self,
        conversation_id: &str,
        sender_id: &str,
        kind: MessageKind,
        content: &str,
        image_url: Option<String>,
        client_id: Option<String>,
    ) -> Result<Message> {
        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            client_id,
            kind,
            content: content.to_string(),
            image_url,
            created_at: now,
            deleted: false,
            read_by: Vec::new(),
            reactions: Vec::new(),
        };

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO messages
                (id, conversation_id, sender_id, client_id, kind, content, image_url, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(&message.sender_id)
        .bind(&message.client_id)
        .bind(message.kind.as_str())
        .bind(&message.content)
        .bind(&message.image_url)
        .bind(fmt_ts(&now))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // Lost a race against the same client_id; the winner already fanned out.
        if inserted == 0 {
            tx.rollback().await?;
            if let Some(client_id) = &message.client_id {
                if let Some(existing) =
                    self.by_client_id(conversation_id, sender_id, client_id).await?
                {
                    debug!("Concurrent client_id {} resolved to {}", client_id, existing.id);
                    return Ok(existing);
                }
            }
            return Err(Error::Internal(format!("Message {} was not stored", message.id)));
        }

        sqlx::query("UPDATE conversations SET last_message_id = ?, updated_at = ? WHERE id = ?")
            .bind(&message.id)
            .bind(fmt_ts(&now))
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(
            "Added message {} to conversation {} ({})",
            message.id,
            conversation_id,
            message.kind.as_str()
        );

        self.fan_out(conversation_id, ServerEvent::NewMessage(message.clone()))
            .await?;

        Ok(message)
    }

    pub async fn get(&self, message_id: &str) -> Result<Message> {
        load_message(&self.pool, message_id)
            .await?
            .ok_or(Error::NotFound("Message"))
    }

    /// One page of history, oldest first
    pub async fn list(
        &self,
        conversation_id: &str,
        viewer_id: &str,
        before: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<Message>> {
        self.ensure_participant(conversation_id, viewer_id).await?;
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

        let mut rows: Vec<MessageRow> = match before {
            Some(before_id) => {
                let cursor: Option<(String, i64)> = sqlx::query_as(
                    "SELECT created_at, rowid FROM messages WHERE id = ? AND conversation_id = ?",
                )
                .bind(before_id)
                .bind(conversation_id)
                .fetch_optional(&self.pool)
                .await?;
                let (created_at, rowid) = cursor.ok_or(Error::NotFound("Message"))?;

                sqlx::query_as(&format!(
                    r#"
                    SELECT {} FROM messages
                    WHERE conversation_id = ?
                      AND (created_at < ? OR (created_at = ? AND rowid < ?))
                    ORDER BY created_at DESC, rowid DESC
                    LIMIT ?
                    "#,
                    MESSAGE_COLUMNS
                ))
                .bind(conversation_id)
                .bind(&created_at)
                .bind(&created_at)
                .bind(rowid)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {} FROM messages WHERE conversation_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
                    MESSAGE_COLUMNS
                ))
                .bind(conversation_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.reverse();
        hydrate(&self.pool, rows).await
    }

    /// Latest `limit` messages, oldest first, without a membership check
    pub async fn recent(&self, conversation_id: &str, limit: i64) -> Result<Vec<Message>> {
        let mut rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {} FROM messages WHERE conversation_id = ? AND deleted = 0 ORDER BY created_at DESC, rowid DESC LIMIT ?",
            MESSAGE_COLUMNS
        ))
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.reverse();
        Ok(rows.into_iter().map(MessageRow::into_message).collect())
    }

    /// Mark everything from others as read; returns the ids newly read
    pub async fn mark_read(&self, conversation_id: &str, reader_id: &str) -> Result<Vec<String>> {
        self.ensure_participant(conversation_id, reader_id).await?;

        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT m.id FROM messages m
            WHERE m.conversation_id = ? AND m.sender_id != ? AND m.deleted = 0
              AND NOT EXISTS (
                  SELECT 1 FROM message_reads r WHERE r.message_id = m.id AND r.user_id = ?
              )
            ORDER BY m.created_at, m.rowid
            "#,
        )
        .bind(conversation_id)
        .bind(reader_id)
        .bind(reader_id)
        .fetch_all(&self.pool)
        .await?;

        let message_ids: Vec<String> = rows.into_iter().map(|(id,)| id).collect();
        if message_ids.is_empty() {
            return Ok(message_ids);
        }

        let read_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        for id in &message_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at) VALUES (?, ?, ?)",
            )
            .bind(id)
            .bind(reader_id)
            .bind(fmt_ts(&read_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(
            "{} read {} messages in {}",
            reader_id,
            message_ids.len(),
            conversation_id
        );

        self.fan_out(
            conversation_id,
            ServerEvent::MessagesRead {
                conversation_id: conversation_id.to_string(),
                reader_id: reader_id.to_string(),
                message_ids: message_ids.clone(),
                read_at,
            },
        )
        .await?;

        Ok(message_ids)
    }

    /// Toggle or replace the caller's reaction; returns the new reaction list
    pub async fn react(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<Vec<Reaction>> {
        let emoji = emoji.trim();
        if emoji.is_empty() || emoji.len() > MAX_EMOJI_BYTES {
            return Err(Error::BadRequest("Invalid reaction".to_string()));
        }

        let message = self.get(message_id).await?;
        self.ensure_participant(&message.conversation_id, user_id)
            .await?;
        if message.deleted {
            return Err(Error::BadRequest("Message was deleted".to_string()));
        }

        let current = message
            .reactions
            .iter()
            .find(|r| r.user_id == user_id)
            .map(|r| r.emoji.as_str());

        if current == Some(emoji) {
            sqlx::query("DELETE FROM message_reactions WHERE message_id = ? AND user_id = ?")
                .bind(message_id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query(
                "INSERT OR REPLACE INTO message_reactions (message_id, user_id, emoji, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(message_id)
            .bind(user_id)
            .bind(emoji)
            .bind(fmt_ts(&Utc::now()))
            .execute(&self.pool)
            .await?;
        }

        let reactions = self.get(message_id).await?.reactions;

        self.fan_out(
            &message.conversation_id,
            ServerEvent::ReactionUpdated {
                conversation_id: message.conversation_id.clone(),
                message_id: message_id.to_string(),
                reactions: reactions.clone(),
            },
        )
        .await?;

        Ok(reactions)
    }

    /// Soft delete by the sender
    pub async fn delete(&self, message_id: &str, user_id: &str) -> Result<()> {
        let message = self.get(message_id).await?;
        if message.sender_id != user_id {
            return Err(Error::Forbidden(
                "You can only delete your own messages".to_string(),
            ));
        }
        if message.deleted {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE messages SET deleted = 1, content = '', image_url = NULL WHERE id = ?")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM message_reactions WHERE message_id = ?")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("Deleted message {} in {}", message_id, message.conversation_id);

        self.fan_out(
            &message.conversation_id,
            ServerEvent::MessageDeleted {
                conversation_id: message.conversation_id.clone(),
                message_id: message_id.to_string(),
            },
        )
        .await
    }
}
