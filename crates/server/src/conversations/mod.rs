//! Conversations and membership
//!
//! Direct conversations are unique per pair of users, enforced by a
//! `direct_key` column built from the sorted ids. The assistant
//! conversation reuses the same column with an `ai:` prefix so each user
//! owns at most one.

pub mod handlers;

use crate::auth::{UserRow, USER_COLUMNS};
use crate::error::{Error, Result};
use crate::messages::{load_message, unread_count};
use crate::models::{fmt_ts, parse_ts, Conversation, ConversationKind, UserInfo};
use crate::realtime::{Hub, ServerEvent};
use crate::store;
use chrono::Utc;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub const MAX_GROUP_NAME_CHARS: usize = 60;
/// Members besides the creator needed to start a group
pub const MIN_GROUP_PEERS: usize = 2;

const CONVERSATION_COLUMNS: &str =
    "c.id, c.kind, c.name, c.avatar_url, c.created_by, c.admin_id, c.last_message_id, c.created_at, c.updated_at";

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: String,
    kind: String,
    name: Option<String>,
    avatar_url: Option<String>,
    created_by: String,
    admin_id: Option<String>,
    last_message_id: Option<String>,
    created_at: String,
    updated_at: String,
}

fn direct_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}:{}", a, b)
    } else {
        format!("{}:{}", b, a)
    }
}

fn ai_key(owner_id: &str) -> String {
    format!("ai:{}", owner_id)
}

fn validate_group_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::BadRequest("Group name is required".to_string()));
    }
    if name.chars().count() > MAX_GROUP_NAME_CHARS {
        return Err(Error::BadRequest(format!(
            "Group name is limited to {} characters",
            MAX_GROUP_NAME_CHARS
        )));
    }
    Ok(name.to_string())
}

pub struct ConversationStore {
    pool: SqlitePool,
    hub: Arc<Hub>,
}

impl ConversationStore {
    pub fn new(pool: SqlitePool, hub: Arc<Hub>) -> Self {
        Self { pool, hub }
    }

    async fn row(&self, conversation_id: &str) -> Result<ConversationRow> {
        let row: Option<ConversationRow> = sqlx::query_as(&format!(
            "SELECT {} FROM conversations c WHERE c.id = ?",
            CONVERSATION_COLUMNS
        ))
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(Error::NotFound("Conversation"))
    }

    pub(crate) async fn participants(&self, conversation_id: &str) -> Result<Vec<UserInfo>> {
        let rows: Vec<UserRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM conversation_participants p
            JOIN users u ON u.id = p.user_id
            WHERE p.conversation_id = ?
            ORDER BY p.joined_at, p.rowid
            "#,
            USER_COLUMNS
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(UserInfo::from).collect())
    }

    /// Assemble the view of a conversation for one participant
    async fn view(&self, row: ConversationRow, viewer_id: &str) -> Result<Conversation> {
        let kind = row
            .kind
            .parse::<ConversationKind>()
            .map_err(Error::Internal)?;
        let participants = self.participants(&row.id).await?;
        let last_message = match &row.last_message_id {
            Some(id) => load_message(&self.pool, id).await?,
            None => None,
        };
        let unread_count = unread_count(&self.pool, &row.id, viewer_id).await?;

        Ok(Conversation {
            id: row.id,
            kind,
            name: row.name,
            avatar_url: row.avatar_url,
            created_by: row.created_by,
            admin_id: row.admin_id,
            participants,
            last_message,
            unread_count,
            created_at: parse_ts(&row.created_at),
            updated_at: parse_ts(&row.updated_at),
        })
    }

    /// Every id must name a verified human account
    async fn ensure_users(&self, user_ids: &[String]) -> Result<()> {
        for user_id in user_ids {
            let row: Option<(String,)> = sqlx::query_as(
                "SELECT id FROM users WHERE id = ? AND is_verified = 1 AND is_bot = 0",
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
            if row.is_none() {
                return Err(Error::NotFound("User"));
            }
        }
        Ok(())
    }

    async fn add_participant(
        tx: &mut Transaction<'_, Sqlite>,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id, joined_at) VALUES (?, ?, ?)",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(fmt_ts(&Utc::now()))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Insert a keyed conversation unless one already exists.
    /// Returns its id and whether it was created now.
    async fn insert_keyed(
        &self,
        kind: ConversationKind,
        key: &str,
        created_by: &str,
        members: [&str; 2],
    ) -> Result<(String, bool)> {
        let id = Uuid::new_v4().to_string();
        let now = fmt_ts(&Utc::now());

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO conversations (id, kind, created_by, direct_key, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(kind.as_str())
        .bind(created_by)
        .bind(key)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !inserted {
            tx.rollback().await?;
            let (existing,): (String,) =
                sqlx::query_as("SELECT id FROM conversations WHERE direct_key = ?")
                    .bind(key)
                    .fetch_one(&self.pool)
                    .await?;
            return Ok((existing, false));
        }

        for member in members {
            Self::add_participant(&mut tx, &id, member).await?;
        }
        tx.commit().await?;

        info!("[Conversations] Created {} conversation {}", kind, id);
        Ok((id, true))
    }

    /// Open (or reopen) the one-to-one conversation between two users
    pub async fn create_direct(
        &self,
        user_id: &str,
        peer_id: &str,
    ) -> Result<(Conversation, bool)> {
        if user_id == peer_id {
            return Err(Error::BadRequest(
                "Cannot start a conversation with yourself".to_string(),
            ));
        }
        self.ensure_users(&[peer_id.to_string()]).await?;

        let key = direct_key(user_id, peer_id);
        let (id, created) = self
            .insert_keyed(ConversationKind::Direct, &key, user_id, [user_id, peer_id])
            .await?;
        Ok((self.get_for(&id, user_id).await?, created))
    }

    pub async fn create_group(
        &self,
        creator_id: &str,
        name: &str,
        participant_ids: &[String],
    ) -> Result<Conversation> {
        let name = validate_group_name(name)?;
        let peers: Vec<String> = participant_ids
            .iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty() && id != creator_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if peers.len() < MIN_GROUP_PEERS {
            return Err(Error::BadRequest(format!(
                "A group needs at least {} other members",
                MIN_GROUP_PEERS
            )));
        }
        self.ensure_users(&peers).await?;

        let id = Uuid::new_v4().to_string();
        let now = fmt_ts(&Utc::now());

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO conversations (id, kind, name, created_by, admin_id, created_at, updated_at) VALUES (?, 'group', ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&name)
        .bind(creator_id)
        .bind(creator_id)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        Self::add_participant(&mut tx, &id, creator_id).await?;
        for peer in &peers {
            Self::add_participant(&mut tx, &id, peer).await?;
        }
        tx.commit().await?;

        info!(
            "[Conversations] Group '{}' ({}) created by {} with {} members",
            name,
            id,
            creator_id,
            peers.len() + 1
        );
        self.get_for(&id, creator_id).await
    }

    /// The caller's private conversation with the assistant
    pub async fn get_or_create_ai(
        &self,
        owner_id: &str,
        bot_id: &str,
    ) -> Result<(Conversation, bool)> {
        let key = ai_key(owner_id);
        let (id, created) = self
            .insert_keyed(ConversationKind::Ai, &key, owner_id, [owner_id, bot_id])
            .await?;
        Ok((self.get_for(&id, owner_id).await?, created))
    }

    /// Most recently active first
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let rows: Vec<ConversationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM conversations c
            JOIN conversation_participants p ON p.conversation_id = c.id
            WHERE p.user_id = ?
            ORDER BY c.updated_at DESC, c.rowid DESC
            "#,
            CONVERSATION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut conversations = Vec::with_capacity(rows.len());
        for row in rows {
            conversations.push(self.view(row, user_id).await?);
        }
        Ok(conversations)
    }

    /// Fetch a conversation the viewer belongs to
    pub async fn get_for(&self, conversation_id: &str, viewer_id: &str) -> Result<Conversation> {
        let row = self.row(conversation_id).await?;
        if !store::is_participant(&self.pool, conversation_id, viewer_id).await? {
            return Err(Error::Forbidden(
                "You are not a member of this conversation".to_string(),
            ));
        }
        self.view(row, viewer_id).await
    }

    pub async fn kind(&self, conversation_id: &str) -> Result<ConversationKind> {
        self.row(conversation_id)
            .await?
            .kind
            .parse()
            .map_err(Error::Internal)
    }

    pub async fn participant_ids(&self, conversation_id: &str) -> Result<Vec<String>> {
        Ok(store::participant_ids(&self.pool, conversation_id).await?)
    }

    /// Load a group the actor administers
    async fn admin_group(&self, conversation_id: &str, actor_id: &str) -> Result<ConversationRow> {
        let row = self.row(conversation_id).await?;
        if row.kind != ConversationKind::Group.as_str() {
            return Err(Error::BadRequest("Only groups can be managed".to_string()));
        }
        if row.admin_id.as_deref() != Some(actor_id) {
            return Err(Error::Forbidden(
                "Only the group admin can do that".to_string(),
            ));
        }
        Ok(row)
    }

    async fn touch(&self, conversation_id: &str) -> Result<()> {
        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(fmt_ts(&Utc::now()))
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn rename(
        &self,
        conversation_id: &str,
        actor_id: &str,
        name: &str,
    ) -> Result<String> {
        self.admin_group(conversation_id, actor_id).await?;
        let name = validate_group_name(name)?;

        sqlx::query("UPDATE conversations SET name = ?, updated_at = ? WHERE id = ?")
            .bind(&name)
            .bind(fmt_ts(&Utc::now()))
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;

        info!("[Conversations] {} renamed to '{}'", conversation_id, name);
        Ok(name)
    }

    /// Returns the ids that were not members yet
    pub async fn add_members(
        &self,
        conversation_id: &str,
        actor_id: &str,
        user_ids: &[String],
    ) -> Result<Vec<String>> {
        self.admin_group(conversation_id, actor_id).await?;

        let current = store::participant_ids(&self.pool, conversation_id).await?;
        let added: Vec<String> = user_ids
            .iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty() && !current.contains(id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if added.is_empty() {
            return Ok(added);
        }
        self.ensure_users(&added).await?;

        let mut tx = self.pool.begin().await?;
        for user_id in &added {
            Self::add_participant(&mut tx, conversation_id, user_id).await?;
        }
        tx.commit().await?;
        self.touch(conversation_id).await?;

        info!(
            "[Conversations] Added {} members to {}",
            added.len(),
            conversation_id
        );
        Ok(added)
    }

    pub async fn remove_member(
        &self,
        conversation_id: &str,
        actor_id: &str,
        user_id: &str,
    ) -> Result<()> {
        self.admin_group(conversation_id, actor_id).await?;
        if user_id == actor_id {
            return Err(Error::BadRequest(
                "Use leave to exit the group".to_string(),
            ));
        }

        let removed = sqlx::query(
            "DELETE FROM conversation_participants WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if removed == 0 {
            return Err(Error::NotFound("Member"));
        }
        self.touch(conversation_id).await?;

        info!("[Conversations] {} removed {} from {}", actor_id, user_id, conversation_id);
        self.hub.send_to_user(
            user_id,
            &ServerEvent::ConversationRemoved {
                conversation_id: conversation_id.to_string(),
            },
        );
        Ok(())
    }

    /// Leave a group. Returns the new admin when the role moved.
    pub async fn leave(&self, conversation_id: &str, user_id: &str) -> Result<Option<String>> {
        let row = self.row(conversation_id).await?;
        if row.kind != ConversationKind::Group.as_str() {
            return Err(Error::BadRequest("Only groups can be left".to_string()));
        }

        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query(
            "DELETE FROM conversation_participants WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if removed == 0 {
            return Err(Error::Forbidden(
                "You are not a member of this conversation".to_string(),
            ));
        }

        let mut new_admin = None;
        if row.admin_id.as_deref() == Some(user_id) {
            let oldest: Option<(String,)> = sqlx::query_as(
                "SELECT user_id FROM conversation_participants WHERE conversation_id = ? ORDER BY joined_at, rowid LIMIT 1",
            )
            .bind(conversation_id)
            .fetch_optional(&mut *tx)
            .await?;
            new_admin = oldest.map(|(id,)| id);

            sqlx::query("UPDATE conversations SET admin_id = ? WHERE id = ?")
                .bind(&new_admin)
                .bind(conversation_id)
                .execute(&mut *tx)
                .await?;
            if new_admin.is_none() {
                warn!("[Conversations] Group {} is now empty", conversation_id);
            }
        }
        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(fmt_ts(&Utc::now()))
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("[Conversations] {} left {}", user_id, conversation_id);
        self.hub.send_to_user(
            user_id,
            &ServerEvent::ConversationRemoved {
                conversation_id: conversation_id.to_string(),
            },
        );
        Ok(new_admin)
    }

    /// Push the fresh conversation view to each participant
    pub async fn notify(&self, conversation_id: &str) -> Result<()> {
        for user_id in store::participant_ids(&self.pool, conversation_id).await? {
            let row = self.row(conversation_id).await?;
            let view = self.view(row, &user_id).await?;
            self.hub
                .send_to_user(&user_id, &ServerEvent::ConversationUpdated(Box::new(view)));
        }
        Ok(())
    }
}
