use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::models::StoredMessage;
use crate::runtime::SettingsOverride;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),
    #[error("corrupt runtime-config document: {0}")]
    BadConfigDocument(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Thread-safe SQLite store behind the pipeline: dedup markers, per-chat
/// message history, sent replies, and the runtime-config override document.
/// Every operation touches a single row, which is the only atomicity the
/// pipeline relies on.
#[derive(Clone)]
pub struct BotStore {
    conn: Arc<Mutex<Connection>>,
}

impl BotStore {
    /// Open or create the SQLite database at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;

        // WAL for better concurrent read behavior; journal_mode PRAGMA
        // returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;

        info!("Store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS processed_updates (
                update_id INTEGER PRIMARY KEY,
                processed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                chat_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                text TEXT,
                date TEXT NOT NULL,
                user_id INTEGER,
                username TEXT,
                PRIMARY KEY (chat_id, message_id)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_chat_date
                ON messages(chat_id, date DESC);

            CREATE TABLE IF NOT EXISTS replies (
                chat_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                reply_text TEXT NOT NULL,
                date TEXT NOT NULL,
                PRIMARY KEY (chat_id, message_id)
            );

            CREATE INDEX IF NOT EXISTS idx_replies_chat_date
                ON replies(chat_id, date DESC);

            -- Single-row document of operator overrides, as JSON.
            CREATE TABLE IF NOT EXISTS runtime_config (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                overrides TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    pub async fn has_processed(&self, update_id: i64) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM processed_updates WHERE update_id = ?1",
            rusqlite::params![update_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Idempotent: re-marking an already processed update is a no-op.
    pub async fn mark_processed(&self, update_id: i64) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO processed_updates (update_id, processed_at)
             VALUES (?1, ?2)",
            rusqlite::params![update_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn append_message(&self, chat_id: i64, record: &StoredMessage) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO messages (chat_id, message_id, text, date, user_id, username)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                chat_id,
                record.message_id,
                record.text,
                record.date.to_rfc3339(),
                record.user_id,
                record.username,
            ],
        )?;
        Ok(())
    }

    /// Latest `limit` messages for a chat, newest first.
    pub async fn latest_messages(
        &self,
        chat_id: i64,
        limit: usize,
    ) -> StoreResult<Vec<StoredMessage>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT message_id, text, date, user_id, username
             FROM messages
             WHERE chat_id = ?1
             ORDER BY date DESC, message_id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![chat_id, limit as i64], |row| {
                let date: String = row.get(2)?;
                Ok(StoredMessage {
                    message_id: row.get(0)?,
                    text: row.get(1)?,
                    date: parse_stored_date(&date)?,
                    user_id: row.get(3)?,
                    username: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn append_reply(
        &self,
        chat_id: i64,
        message_id: i64,
        reply_text: &str,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO replies (chat_id, message_id, reply_text, date)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![chat_id, message_id, reply_text, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Timestamp of the most recent reply sent into a chat, if any. Only
    /// "no row" maps to None; a failing read is a storage error.
    pub async fn latest_reply_time(&self, chat_id: i64) -> StoreResult<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().await;
        let date: Option<String> = conn
            .query_row(
                "SELECT date FROM replies WHERE chat_id = ?1
                 ORDER BY date DESC LIMIT 1",
                rusqlite::params![chat_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(date.map(|d| parse_stored_date(&d)).transpose()?)
    }

    /// Operator overrides document; defaults to the empty override set when
    /// nothing has ever been written. A failing read must propagate: callers
    /// read-merge-write this document, and an error mistaken for "absent"
    /// would wipe the stored overrides on the write-back.
    pub async fn get_overrides(&self) -> StoreResult<SettingsOverride> {
        let conn = self.conn.lock().await;
        let doc: Option<String> = conn
            .query_row(
                "SELECT overrides FROM runtime_config WHERE id = 0",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match doc {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(SettingsOverride::default()),
        }
    }

    /// Whole-document write. Callers own the read-merge-write cycle.
    pub async fn put_overrides(&self, overrides: &SettingsOverride) -> StoreResult<()> {
        let json = serde_json::to_string(overrides)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO runtime_config (id, overrides) VALUES (0, ?1)
             ON CONFLICT(id) DO UPDATE SET overrides = excluded.overrides",
            rusqlite::params![json],
        )?;
        Ok(())
    }

    pub async fn clear_overrides(&self) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM runtime_config WHERE id = 0", [])?;
        Ok(())
    }
}

/// Stored dates are written by this process as RFC 3339; anything else is a
/// corrupt row and surfaces as a storage error rather than a default.
fn parse_stored_date(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}
