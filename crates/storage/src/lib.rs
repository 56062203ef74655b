use anyhow::{Context, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{ContentUri, ConversationKey, EventId, LocalUserId, RemoteId, RoomId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPortal {
    pub key: ConversationKey,
    pub room_id: Option<RoomId>,
    pub name: String,
    pub name_set: bool,
    pub topic: String,
    pub topic_set: bool,
    /// Remote avatar url the mirrored avatar was taken from.
    pub avatar: String,
    pub avatar_url: Option<ContentUri>,
    pub avatar_set: bool,
    pub encrypted: bool,
}

impl StoredPortal {
    pub fn new(key: ConversationKey) -> Self {
        Self {
            key,
            room_id: None,
            name: String::new(),
            name_set: false,
            topic: String::new(),
            topic_set: false,
            avatar: String::new(),
            avatar_url: None,
            avatar_set: false,
            encrypted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredGhost {
    pub remote_id: RemoteId,
    pub display_name: String,
    pub name_set: bool,
    pub avatar: String,
    pub avatar_url: Option<ContentUri>,
    pub avatar_set: bool,
    pub custom_local_id: Option<LocalUserId>,
    pub access_token: Option<String>,
    pub enable_receipts: bool,
}

impl StoredGhost {
    pub fn new(remote_id: RemoteId) -> Self {
        Self {
            remote_id,
            display_name: String::new(),
            name_set: false,
            avatar: String::new(),
            avatar_url: None,
            avatar_set: false,
            custom_local_id: None,
            access_token: None,
            enable_receipts: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAccount {
    pub local_id: LocalUserId,
    pub remote_id: Option<RemoteId>,
    pub token: Option<String>,
    pub management_room: Option<RoomId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub key: ConversationKey,
    pub remote_id: RemoteId,
    pub event_id: EventId,
    pub sender: RemoteId,
    pub timestamp_ms: i64,
    pub delivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredReaction {
    pub key: ConversationKey,
    pub target_remote_id: RemoteId,
    pub reactor: RemoteId,
    pub event_id: EventId,
}

const PORTAL_COLUMNS: &str = "conversation_id, receiver, room_id, name, name_set, topic, \
     topic_set, avatar, avatar_url, avatar_set, encrypted";
const GHOST_COLUMNS: &str = "remote_id, display_name, name_set, avatar, avatar_url, avatar_set, \
     custom_local_id, access_token, enable_receipts";
const ACCOUNT_COLUMNS: &str = "local_id, remote_id, token, management_room";
const MESSAGE_COLUMNS: &str =
    "conversation_id, receiver, remote_id, event_id, sender, timestamp_ms, delivered";
const REACTION_COLUMNS: &str = "conversation_id, receiver, target_remote_id, reactor, event_id";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every connection to an in-memory database sees its own database.
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn get_portal(&self, key: &ConversationKey) -> Result<Option<StoredPortal>> {
        let row = sqlx::query(&format!(
            "SELECT {PORTAL_COLUMNS} FROM portal WHERE conversation_id = ? AND receiver = ?"
        ))
        .bind(key.conversation_id.as_str())
        .bind(key.receiver.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(portal_from_row))
    }

    pub async fn get_portal_by_room(&self, room_id: &RoomId) -> Result<Option<StoredPortal>> {
        let row = sqlx::query(&format!(
            "SELECT {PORTAL_COLUMNS} FROM portal WHERE room_id = ?"
        ))
        .bind(room_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(portal_from_row))
    }

    /// Direct-chat portals in which `counterpart` is the other participant.
    pub async fn list_private_portals_with(
        &self,
        counterpart: &RemoteId,
    ) -> Result<Vec<StoredPortal>> {
        let rows = sqlx::query(&format!(
            "SELECT {PORTAL_COLUMNS} FROM portal WHERE conversation_id = ? AND receiver <> conversation_id"
        ))
        .bind(counterpart.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(portal_from_row).collect())
    }

    /// Inserts a blank row unless one exists, then returns the stored row.
    pub async fn insert_portal_if_absent(&self, key: &ConversationKey) -> Result<StoredPortal> {
        sqlx::query(
            "INSERT INTO portal (conversation_id, receiver) VALUES (?, ?)
             ON CONFLICT(conversation_id, receiver) DO NOTHING",
        )
        .bind(key.conversation_id.as_str())
        .bind(key.receiver.as_str())
        .execute(&self.pool)
        .await?;
        self.get_portal(key)
            .await?
            .with_context(|| format!("portal row for {key} vanished after insert"))
    }

    pub async fn update_portal(&self, portal: &StoredPortal) -> Result<()> {
        sqlx::query(
            "UPDATE portal SET room_id = ?, name = ?, name_set = ?, topic = ?, topic_set = ?,
             avatar = ?, avatar_url = ?, avatar_set = ?, encrypted = ?
             WHERE conversation_id = ? AND receiver = ?",
        )
        .bind(portal.room_id.as_ref().map(RoomId::as_str))
        .bind(&portal.name)
        .bind(portal.name_set)
        .bind(&portal.topic)
        .bind(portal.topic_set)
        .bind(&portal.avatar)
        .bind(portal.avatar_url.as_ref().map(ContentUri::as_str))
        .bind(portal.avatar_set)
        .bind(portal.encrypted)
        .bind(portal.key.conversation_id.as_str())
        .bind(portal.key.receiver.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_portal(&self, key: &ConversationKey) -> Result<()> {
        sqlx::query("DELETE FROM portal WHERE conversation_id = ? AND receiver = ?")
            .bind(key.conversation_id.as_str())
            .bind(key.receiver.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_ghost(&self, remote_id: &RemoteId) -> Result<Option<StoredGhost>> {
        let row = sqlx::query(&format!(
            "SELECT {GHOST_COLUMNS} FROM ghost WHERE remote_id = ?"
        ))
        .bind(remote_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(ghost_from_row))
    }

    pub async fn get_ghost_by_custom_local_id(
        &self,
        local_id: &LocalUserId,
    ) -> Result<Option<StoredGhost>> {
        let row = sqlx::query(&format!(
            "SELECT {GHOST_COLUMNS} FROM ghost WHERE custom_local_id = ?"
        ))
        .bind(local_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(ghost_from_row))
    }

    pub async fn insert_ghost_if_absent(&self, remote_id: &RemoteId) -> Result<StoredGhost> {
        sqlx::query("INSERT INTO ghost (remote_id) VALUES (?) ON CONFLICT(remote_id) DO NOTHING")
            .bind(remote_id.as_str())
            .execute(&self.pool)
            .await?;
        self.get_ghost(remote_id)
            .await?
            .with_context(|| format!("ghost row for {remote_id} vanished after insert"))
    }

    pub async fn update_ghost(&self, ghost: &StoredGhost) -> Result<()> {
        sqlx::query(
            "UPDATE ghost SET display_name = ?, name_set = ?, avatar = ?, avatar_url = ?,
             avatar_set = ?, custom_local_id = ?, access_token = ?, enable_receipts = ?
             WHERE remote_id = ?",
        )
        .bind(&ghost.display_name)
        .bind(ghost.name_set)
        .bind(&ghost.avatar)
        .bind(ghost.avatar_url.as_ref().map(ContentUri::as_str))
        .bind(ghost.avatar_set)
        .bind(ghost.custom_local_id.as_ref().map(LocalUserId::as_str))
        .bind(ghost.access_token.as_deref())
        .bind(ghost.enable_receipts)
        .bind(ghost.remote_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_account(&self, local_id: &LocalUserId) -> Result<Option<StoredAccount>> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM local_account WHERE local_id = ?"
        ))
        .bind(local_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(account_from_row))
    }

    pub async fn get_account_by_remote_id(
        &self,
        remote_id: &RemoteId,
    ) -> Result<Option<StoredAccount>> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM local_account WHERE remote_id = ?"
        ))
        .bind(remote_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(account_from_row))
    }

    pub async fn get_account_by_management_room(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<StoredAccount>> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM local_account WHERE management_room = ?"
        ))
        .bind(room_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(account_from_row))
    }

    /// Accounts that still hold remote credentials.
    pub async fn list_logged_in_accounts(&self) -> Result<Vec<StoredAccount>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM local_account WHERE token IS NOT NULL AND token <> ''"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(account_from_row).collect())
    }

    pub async fn insert_account_if_absent(&self, local_id: &LocalUserId) -> Result<StoredAccount> {
        sqlx::query(
            "INSERT INTO local_account (local_id) VALUES (?) ON CONFLICT(local_id) DO NOTHING",
        )
        .bind(local_id.as_str())
        .execute(&self.pool)
        .await?;
        self.get_account(local_id)
            .await?
            .with_context(|| format!("account row for {local_id} vanished after insert"))
    }

    pub async fn update_account(&self, account: &StoredAccount) -> Result<()> {
        sqlx::query(
            "UPDATE local_account SET remote_id = ?, token = ?, management_room = ?
             WHERE local_id = ?",
        )
        .bind(account.remote_id.as_ref().map(RemoteId::as_str))
        .bind(account.token.as_deref())
        .bind(account.management_room.as_ref().map(RoomId::as_str))
        .bind(account.local_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_message(
        &self,
        key: &ConversationKey,
        remote_id: &RemoteId,
    ) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM message
             WHERE conversation_id = ? AND receiver = ? AND remote_id = ?"
        ))
        .bind(key.conversation_id.as_str())
        .bind(key.receiver.as_str())
        .bind(remote_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(message_from_row))
    }

    pub async fn get_message_by_event(&self, event_id: &EventId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM message WHERE event_id = ?"
        ))
        .bind(event_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(message_from_row))
    }

    /// Newest mirrored message of a conversation, used as the gap-backfill cursor.
    pub async fn last_message(&self, key: &ConversationKey) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM message
             WHERE conversation_id = ? AND receiver = ?
             ORDER BY timestamp_ms DESC, rowid DESC LIMIT 1"
        ))
        .bind(key.conversation_id.as_str())
        .bind(key.receiver.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(message_from_row))
    }

    pub async fn list_messages(&self, key: &ConversationKey) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM message
             WHERE conversation_id = ? AND receiver = ?
             ORDER BY timestamp_ms ASC, rowid ASC"
        ))
        .bind(key.conversation_id.as_str())
        .bind(key.receiver.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    /// Returns `false` when a row for the same remote message already existed.
    pub async fn insert_message(&self, message: &StoredMessage) -> Result<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO message ({MESSAGE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(conversation_id, receiver, remote_id) DO NOTHING"
        ))
        .bind(message.key.conversation_id.as_str())
        .bind(message.key.receiver.as_str())
        .bind(message.remote_id.as_str())
        .bind(message.event_id.as_str())
        .bind(message.sender.as_str())
        .bind(message.timestamp_ms)
        .bind(message.delivered)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_message_by_event(&self, event_id: &EventId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM message WHERE event_id = ?")
            .bind(event_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_reactions(
        &self,
        key: &ConversationKey,
        target_remote_id: &RemoteId,
    ) -> Result<Vec<StoredReaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {REACTION_COLUMNS} FROM reaction
             WHERE conversation_id = ? AND receiver = ? AND target_remote_id = ?"
        ))
        .bind(key.conversation_id.as_str())
        .bind(key.receiver.as_str())
        .bind(target_remote_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(reaction_from_row).collect())
    }

    pub async fn upsert_reaction(&self, reaction: &StoredReaction) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO reaction ({REACTION_COLUMNS}) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(conversation_id, receiver, target_remote_id, reactor)
             DO UPDATE SET event_id = excluded.event_id"
        ))
        .bind(reaction.key.conversation_id.as_str())
        .bind(reaction.key.receiver.as_str())
        .bind(reaction.target_remote_id.as_str())
        .bind(reaction.reactor.as_str())
        .bind(reaction.event_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_reaction(
        &self,
        key: &ConversationKey,
        target_remote_id: &RemoteId,
        reactor: &RemoteId,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM reaction
             WHERE conversation_id = ? AND receiver = ? AND target_remote_id = ? AND reactor = ?",
        )
        .bind(key.conversation_id.as_str())
        .bind(key.receiver.as_str())
        .bind(target_remote_id.as_str())
        .bind(reactor.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn key_from_row(row: &SqliteRow) -> ConversationKey {
    ConversationKey::new(
        RemoteId(row.get::<String, _>("conversation_id")),
        RemoteId(row.get::<String, _>("receiver")),
    )
}

fn portal_from_row(row: &SqliteRow) -> StoredPortal {
    StoredPortal {
        key: key_from_row(row),
        room_id: row.get::<Option<String>, _>("room_id").map(RoomId),
        name: row.get("name"),
        name_set: row.get("name_set"),
        topic: row.get("topic"),
        topic_set: row.get("topic_set"),
        avatar: row.get("avatar"),
        avatar_url: row.get::<Option<String>, _>("avatar_url").map(ContentUri),
        avatar_set: row.get("avatar_set"),
        encrypted: row.get("encrypted"),
    }
}

fn ghost_from_row(row: &SqliteRow) -> StoredGhost {
    StoredGhost {
        remote_id: RemoteId(row.get::<String, _>("remote_id")),
        display_name: row.get("display_name"),
        name_set: row.get("name_set"),
        avatar: row.get("avatar"),
        avatar_url: row.get::<Option<String>, _>("avatar_url").map(ContentUri),
        avatar_set: row.get("avatar_set"),
        custom_local_id: row
            .get::<Option<String>, _>("custom_local_id")
            .map(LocalUserId),
        access_token: row.get("access_token"),
        enable_receipts: row.get("enable_receipts"),
    }
}

fn account_from_row(row: &SqliteRow) -> StoredAccount {
    StoredAccount {
        local_id: LocalUserId(row.get::<String, _>("local_id")),
        remote_id: row.get::<Option<String>, _>("remote_id").map(RemoteId),
        token: row.get("token"),
        management_room: row.get::<Option<String>, _>("management_room").map(RoomId),
    }
}

fn message_from_row(row: &SqliteRow) -> StoredMessage {
    StoredMessage {
        key: key_from_row(row),
        remote_id: RemoteId(row.get::<String, _>("remote_id")),
        event_id: EventId(row.get::<String, _>("event_id")),
        sender: RemoteId(row.get::<String, _>("sender")),
        timestamp_ms: row.get("timestamp_ms"),
        delivered: row.get("delivered"),
    }
}

fn reaction_from_row(row: &SqliteRow) -> StoredReaction {
    StoredReaction {
        key: key_from_row(row),
        target_remote_id: RemoteId(row.get::<String, _>("target_remote_id")),
        reactor: RemoteId(row.get::<String, _>("reactor")),
        event_id: EventId(row.get::<String, _>("event_id")),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
