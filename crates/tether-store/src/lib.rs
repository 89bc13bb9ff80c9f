use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions, SqlitePool};
use std::str::FromStr;
use tracing::instrument;

/// Local view of one remote conversation for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub account_id: String,
    pub thread_id: String,
    /// Id used for message-fetch calls; may differ from `thread_id`.
    pub conversation_id: String,
    pub is_one_to_one: bool,
    pub name: String,
    pub last_cursor: Option<String>,
    pub last_message_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteProfile {
    pub user_id: String,
    pub display_name: String,
    pub last_seen: DateTime<Utc>,
}

type ThreadRow = (String, String, String, bool, String, Option<String>, Option<i64>);

fn thread_from_row(row: ThreadRow) -> ThreadRecord {
    let (account_id, thread_id, conversation_id, is_one_to_one, name, last_cursor, last_ts) = row;
    ThreadRecord {
        account_id,
        thread_id,
        conversation_id,
        is_one_to_one,
        name,
        last_cursor,
        last_message_ts: last_ts.and_then(DateTime::from_timestamp_millis),
    }
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::from_str("sqlite:")?
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema(true).await?;
        Ok(store)
    }

    /// Single-connection in-memory database. Every connection to
    /// `sqlite::memory:` is its own database, so the pool is capped at one.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema(false).await?;
        Ok(store)
    }

    #[instrument(skip_all)]
    async fn init_schema(&self, wal: bool) -> Result<()> {
        if wal {
            sqlx::query("PRAGMA journal_mode=WAL;")
                .execute(&self.pool)
                .await?;
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS threads (\
                account_id TEXT NOT NULL,\
                thread_id TEXT NOT NULL,\
                conversation_id TEXT NOT NULL,\
                is_one_to_one INTEGER NOT NULL DEFAULT 0,\
                name TEXT NOT NULL DEFAULT '',\
                last_cursor TEXT,\
                last_message_ts INTEGER,\
                updated_at TEXT NOT NULL,\
                PRIMARY KEY (account_id, thread_id)\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS remote_profiles (\
                user_id TEXT PRIMARY KEY,\
                display_name TEXT NOT NULL,\
                last_seen_ts INTEGER NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS receipt_cursors (\
                account_id TEXT NOT NULL,\
                thread_id TEXT NOT NULL,\
                remote_user_id TEXT NOT NULL,\
                last_read_ts INTEGER NOT NULL,\
                PRIMARY KEY (account_id, thread_id, remote_user_id)\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS credentials (\
                account_id TEXT PRIMARY KEY,\
                metadata TEXT NOT NULL,\
                updated_at TEXT NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS message_index (\
                account_id TEXT NOT NULL,\
                thread_id TEXT NOT NULL,\
                message_id TEXT NOT NULL,\
                ts INTEGER NOT NULL,\
                PRIMARY KEY (account_id, thread_id, message_id)\
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_message_index_ts ON message_index(account_id, thread_id, ts)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS reaction_counts (\
                account_id TEXT NOT NULL,\
                message_id TEXT NOT NULL,\
                count INTEGER NOT NULL,\
                PRIMARY KEY (account_id, message_id)\
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a thread, or refresh its conversation id, name and one-to-one
    /// flag. An existing cursor is never touched.
    #[instrument(skip(self))]
    pub async fn upsert_thread(&self, thread: &ThreadRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO threads (account_id, thread_id, conversation_id, is_one_to_one, name, last_cursor, last_message_ts, updated_at) \
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
            ON CONFLICT(account_id, thread_id) DO UPDATE SET \
                conversation_id=excluded.conversation_id, \
                is_one_to_one=excluded.is_one_to_one, \
                name=excluded.name, \
                updated_at=excluded.updated_at",
        )
        .bind(&thread.account_id)
        .bind(&thread.thread_id)
        .bind(&thread.conversation_id)
        .bind(thread.is_one_to_one)
        .bind(&thread.name)
        .bind(&thread.last_cursor)
        .bind(thread.last_message_ts.map(|ts| ts.timestamp_millis()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_thread(&self, account_id: &str, thread_id: &str) -> Result<Option<ThreadRecord>> {
        let row = sqlx::query_as::<_, ThreadRow>(
            "SELECT account_id, thread_id, conversation_id, is_one_to_one, name, last_cursor, last_message_ts \
            FROM threads WHERE account_id = ?1 AND thread_id = ?2",
        )
        .bind(account_id)
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(thread_from_row))
    }

    pub async fn list_threads(&self, account_id: &str) -> Result<Vec<ThreadRecord>> {
        let rows = sqlx::query_as::<_, ThreadRow>(
            "SELECT account_id, thread_id, conversation_id, is_one_to_one, name, last_cursor, last_message_ts \
            FROM threads WHERE account_id = ?1 ORDER BY thread_id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(thread_from_row).collect())
    }

    /// Persist a new ingestion cursor. Callers are responsible for only
    /// moving it forward; the store has no notion of the remote ordering.
    #[instrument(skip(self))]
    pub async fn set_thread_cursor(
        &self,
        account_id: &str,
        thread_id: &str,
        cursor: &str,
        last_message_ts: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE threads SET last_cursor = ?3, last_message_ts = COALESCE(?4, last_message_ts), updated_at = ?5 \
            WHERE account_id = ?1 AND thread_id = ?2",
        )
        .bind(account_id)
        .bind(thread_id)
        .bind(cursor)
        .bind(last_message_ts.map(|ts| ts.timestamp_millis()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn upsert_profile(
        &self,
        user_id: &str,
        display_name: &str,
        last_seen: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO remote_profiles (user_id, display_name, last_seen_ts) VALUES (?1, ?2, ?3) \
            ON CONFLICT(user_id) DO UPDATE SET \
                display_name=excluded.display_name, \
                last_seen_ts=MAX(remote_profiles.last_seen_ts, excluded.last_seen_ts)",
        )
        .bind(user_id)
        .bind(display_name)
        .bind(last_seen.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_profile(&self, user_id: &str) -> Result<Option<RemoteProfile>> {
        let row = sqlx::query_as::<_, (String, String, i64)>(
            "SELECT user_id, display_name, last_seen_ts FROM remote_profiles WHERE user_id = ?1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(user_id, display_name, last_seen)| RemoteProfile {
            user_id,
            display_name,
            last_seen: DateTime::from_timestamp_millis(last_seen).unwrap_or_else(Utc::now),
        }))
    }

    pub async fn get_receipt_cursor(
        &self,
        account_id: &str,
        thread_id: &str,
        remote_user_id: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT last_read_ts FROM receipt_cursors \
            WHERE account_id = ?1 AND thread_id = ?2 AND remote_user_id = ?3",
        )
        .bind(account_id)
        .bind(thread_id)
        .bind(remote_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(ts,)| DateTime::from_timestamp_millis(ts)))
    }

    /// Advance the read-receipt cursor. Older values are ignored so the
    /// stored cursor only ever increases.
    #[instrument(skip(self))]
    pub async fn set_receipt_cursor(
        &self,
        account_id: &str,
        thread_id: &str,
        remote_user_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO receipt_cursors (account_id, thread_id, remote_user_id, last_read_ts) \
            VALUES (?1, ?2, ?3, ?4) \
            ON CONFLICT(account_id, thread_id, remote_user_id) DO UPDATE SET \
                last_read_ts=MAX(receipt_cursors.last_read_ts, excluded.last_read_ts)",
        )
        .bind(account_id)
        .bind(thread_id)
        .bind(remote_user_id)
        .bind(read_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store the opaque credential blob for an account.
    #[instrument(skip(self, metadata))]
    pub async fn save_credentials(&self, account_id: &str, metadata: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO credentials (account_id, metadata, updated_at) VALUES (?1, ?2, ?3) \
            ON CONFLICT(account_id) DO UPDATE SET metadata=excluded.metadata, updated_at=excluded.updated_at",
        )
        .bind(account_id)
        .bind(metadata)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_credentials(&self, account_id: &str) -> Result<Option<String>> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT metadata FROM credentials WHERE account_id = ?1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(metadata,)| metadata))
    }

    pub async fn delete_credentials(&self, account_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM credentials WHERE account_id = ?1")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Accounts that have stored credentials.
    pub async fn list_accounts(&self) -> Result<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT account_id FROM credentials ORDER BY account_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Remember a message that was delivered to the home side so read
    /// receipts can later be pinned to it.
    pub async fn record_message(
        &self,
        account_id: &str,
        thread_id: &str,
        message_id: &str,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO message_index (account_id, thread_id, message_id, ts) VALUES (?1, ?2, ?3, ?4) \
            ON CONFLICT(account_id, thread_id, message_id) DO NOTHING",
        )
        .bind(account_id)
        .bind(thread_id)
        .bind(message_id)
        .bind(ts.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Latest bridged message at or before `ts`.
    pub async fn message_at_or_before(
        &self,
        account_id: &str,
        thread_id: &str,
        ts: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT message_id FROM message_index \
            WHERE account_id = ?1 AND thread_id = ?2 AND ts <= ?3 \
            ORDER BY ts DESC LIMIT 1",
        )
        .bind(account_id)
        .bind(thread_id)
        .bind(ts.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    pub async fn set_reaction_count(&self, account_id: &str, message_id: &str, count: usize) -> Result<()> {
        if count == 0 {
            sqlx::query("DELETE FROM reaction_counts WHERE account_id = ?1 AND message_id = ?2")
                .bind(account_id)
                .bind(message_id)
                .execute(&self.pool)
                .await?;
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO reaction_counts (account_id, message_id, count) VALUES (?1, ?2, ?3) \
            ON CONFLICT(account_id, message_id) DO UPDATE SET count=excluded.count",
        )
        .bind(account_id)
        .bind(message_id)
        .bind(count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn reaction_count(&self, account_id: &str, message_id: &str) -> Result<usize> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT count FROM reaction_counts WHERE account_id = ?1 AND message_id = ?2",
        )
        .bind(account_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.unwrap_or(0).max(0) as usize)
    }
}
