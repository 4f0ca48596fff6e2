use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
pub use sqlx::Error;
use teloxide::types::{ChatId, UserId};

use crate::gate::{
    ChannelRef, GroupConfigStore, GroupSubscriptionConfig, StoreError, SubscriptionMode,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS group_configs (
    chat_id INTEGER PRIMARY KEY,
    mode TEXT NOT NULL DEFAULT 'single',
    channels TEXT NOT NULL DEFAULT '[]',
    enabled INTEGER NOT NULL DEFAULT 0,
    channel_id INTEGER,
    channel_username TEXT
);

CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY,
    username TEXT,
    first_name TEXT NOT NULL DEFAULT '',
    banned INTEGER NOT NULL DEFAULT 0,
    last_seen TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS group_activity (
    chat_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    messages INTEGER NOT NULL DEFAULT 0,
    last_message TEXT NOT NULL,
    PRIMARY KEY (chat_id, user_id)
);
";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, Error> {
        let pool = SqlitePool::connect(database_url).await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn group_config(
        &self,
        chat_id: ChatId,
    ) -> Result<Option<GroupSubscriptionConfig>, Error> {
        let row: Option<GroupConfigRow> = sqlx::query_as(
            "SELECT chat_id, mode, channels, enabled, channel_id, channel_username
            FROM group_configs WHERE chat_id = ?",
        )
        .bind(chat_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(GroupConfigRow::into_config).transpose()
    }

    pub async fn upsert_group_config(
        &self,
        config: &GroupSubscriptionConfig,
    ) -> Result<(), Error> {
        let channels =
            serde_json::to_string(&config.channels).map_err(|e| Error::Encode(Box::new(e)))?;

        sqlx::query(
            "INSERT INTO group_configs (chat_id, mode, channels, enabled, channel_id, channel_username)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(chat_id) DO UPDATE SET
                mode = excluded.mode,
                channels = excluded.channels,
                enabled = excluded.enabled,
                channel_id = excluded.channel_id,
                channel_username = excluded.channel_username",
        )
        .bind(config.chat_id.0)
        .bind(config.mode.as_str())
        .bind(&channels)
        .bind(config.enabled)
        .bind(config.channel_id.map(|c| c.0))
        .bind(config.channel_username.as_deref())
        .execute(&self.pool)
        .await
        .map(|_| ())
    }

    pub async fn delete_group_config(&self, chat_id: ChatId) -> Result<bool, Error> {
        sqlx::query("DELETE FROM group_configs WHERE chat_id = ?")
            .bind(chat_id.0)
            .execute(&self.pool)
            .await
            .map(|r| r.rows_affected() > 0)
    }

    pub async fn upsert_user(
        &self,
        user_id: UserId,
        username: Option<&str>,
        first_name: &str,
    ) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO users (user_id, username, first_name, banned, last_seen)
            VALUES (?, ?, ?, 0, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                username = excluded.username,
                first_name = excluded.first_name,
                last_seen = excluded.last_seen",
        )
        .bind(user_id.0 as i64)
        .bind(username)
        .bind(first_name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map(|_| ())
    }

    pub async fn set_banned(&self, user_id: UserId, banned: bool) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO users (user_id, first_name, banned, last_seen)
            VALUES (?, '', ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET banned = excluded.banned",
        )
        .bind(user_id.0 as i64)
        .bind(banned)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map(|_| ())
    }

    pub async fn is_banned(&self, user_id: UserId) -> Result<bool, Error> {
        let banned: Option<bool> = sqlx::query_scalar("SELECT banned FROM users WHERE user_id = ?")
            .bind(user_id.0 as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(banned.unwrap_or(false))
    }

    pub async fn record_group_message(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO group_activity (chat_id, user_id, messages, last_message)
            VALUES (?, ?, 1, ?)
            ON CONFLICT(chat_id, user_id) DO UPDATE SET
                messages = messages + 1,
                last_message = excluded.last_message",
        )
        .bind(chat_id.0)
        .bind(user_id.0 as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map(|_| ())
    }

    pub async fn group_stats(&self, chat_id: ChatId) -> Result<GroupStats, Error> {
        sqlx::query_as(
            "SELECT COALESCE(SUM(messages), 0) AS total_messages,
                COUNT(user_id) AS active_users
            FROM group_activity WHERE chat_id = ?",
        )
        .bind(chat_id.0)
        .fetch_one(&self.pool)
        .await
    }

    /// Every group the bot has seen a message in or holds a config for,
    /// i.e. the broadcast audience.
    pub async fn known_group_ids(&self) -> Result<Vec<ChatId>, Error> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT chat_id FROM group_activity
            UNION SELECT chat_id FROM group_configs",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(ChatId).collect())
    }
}

#[async_trait]
impl GroupConfigStore for Database {
    async fn get(&self, chat_id: ChatId) -> Result<Option<GroupSubscriptionConfig>, StoreError> {
        self.group_config(chat_id).await.map_err(StoreError::from)
    }

    async fn upsert(&self, config: &GroupSubscriptionConfig) -> Result<(), StoreError> {
        self.upsert_group_config(config)
            .await
            .map_err(StoreError::from)
    }

    async fn delete(&self, chat_id: ChatId) -> Result<(), StoreError> {
        self.delete_group_config(chat_id)
            .await
            .map(|_| ())
            .map_err(StoreError::from)
    }
}

impl From<Error> for StoreError {
    fn from(e: Error) -> Self {
        StoreError(e.to_string())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct GroupConfigRow {
    chat_id: i64,
    mode: String,
    channels: String,
    enabled: bool,
    channel_id: Option<i64>,
    channel_username: Option<String>,
}

impl GroupConfigRow {
    fn into_config(self) -> Result<GroupSubscriptionConfig, Error> {
        let channels: Vec<ChannelRef> =
            serde_json::from_str(&self.channels).map_err(|e| Error::Decode(Box::new(e)))?;
        let mode = match self.mode.as_str() {
            "multiple" => SubscriptionMode::Multiple,
            _ => SubscriptionMode::Single,
        };
        Ok(GroupSubscriptionConfig {
            chat_id: ChatId(self.chat_id),
            mode,
            channels,
            enabled: self.enabled,
            channel_id: self.channel_id.map(ChatId),
            channel_username: self.channel_username,
        })
    }
}

#[derive(Debug, Clone, Copy, sqlx::FromRow)]
pub struct GroupStats {
    pub total_messages: i64,
    pub active_users: i64,
}
