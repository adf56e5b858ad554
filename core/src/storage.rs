//! Local storage using SQLite

use crate::error::{Error, Result};
use crate::models::*;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const KEY_SESSION_TOKEN: &str = "session_token";
const KEY_CURRENT_USER_ID: &str = "current_user_id";
const KEY_DISPLAY_NAME: &str = "display_name";
const KEY_SESSION_EXPIRES_AT: &str = "session_expires_at";
const KEY_CALLING_TOKEN: &str = "calling_token";
const KEY_CALLING_TOKEN_EXPIRES_AT: &str = "calling_token_expires_at";

pub struct LocalStorage {
    conn: Mutex<Connection>,
}

impl LocalStorage {
    pub fn new(data_dir: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = Path::new(data_dir).join("qrpark.db");
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn)
    }

    /// Non-durable store, used by tests and previews.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pending_status_updates (
                entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
                call_id TEXT NOT NULL,
                status TEXT NOT NULL,
                occurred_at INTEGER NOT NULL,
                queued_at INTEGER NOT NULL,
                UNIQUE (call_id, status)
            );

            CREATE TABLE IF NOT EXISTS call_log (
                id TEXT PRIMARY KEY,
                receiver_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                answered_at INTEGER,
                ended_at INTEGER,
                failed_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_call_log_created ON call_log(created_at);
            "#,
        )?;

        Ok(())
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub fn save_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    // ========================================================================
    // Session
    // ========================================================================

    pub fn save_session(&self, session: &AuthSession) -> Result<()> {
        self.save_setting(KEY_SESSION_TOKEN, &session.token)?;
        self.save_setting(KEY_CURRENT_USER_ID, &session.user_id)?;
        self.save_setting(KEY_DISPLAY_NAME, &session.display_name)?;
        self.save_setting(KEY_SESSION_EXPIRES_AT, &session.expires_at.to_string())?;
        Ok(())
    }

    pub fn get_session(&self) -> Result<Option<AuthSession>> {
        let (Some(token), Some(user_id), Some(expires_at)) = (
            self.get_setting(KEY_SESSION_TOKEN)?,
            self.get_setting(KEY_CURRENT_USER_ID)?,
            self.get_setting(KEY_SESSION_EXPIRES_AT)?,
        ) else {
            return Ok(None);
        };

        let expires_at: i64 = expires_at
            .parse()
            .map_err(|_| Error::Storage(format!("corrupt session expiry: {}", expires_at)))?;

        Ok(Some(AuthSession {
            token,
            display_name: self.get_setting(KEY_DISPLAY_NAME)?.unwrap_or_default(),
            user_id,
            expires_at,
        }))
    }

    pub fn clear_session(&self) -> Result<()> {
        self.delete_setting(KEY_SESSION_TOKEN)?;
        self.delete_setting(KEY_CURRENT_USER_ID)?;
        self.delete_setting(KEY_DISPLAY_NAME)?;
        self.delete_setting(KEY_SESSION_EXPIRES_AT)?;
        Ok(())
    }

    // ========================================================================
    // Calling token
    // ========================================================================

    pub fn save_token(&self, record: &TokenRecord) -> Result<()> {
        self.save_setting(KEY_CALLING_TOKEN, &record.token)?;
        self.save_setting(
            KEY_CALLING_TOKEN_EXPIRES_AT,
            &record.expires_at.timestamp_millis().to_string(),
        )?;
        Ok(())
    }

    pub fn get_token(&self) -> Result<Option<TokenRecord>> {
        let (Some(token), Some(expires_at)) = (
            self.get_setting(KEY_CALLING_TOKEN)?,
            self.get_setting(KEY_CALLING_TOKEN_EXPIRES_AT)?,
        ) else {
            return Ok(None);
        };

        let millis: i64 = expires_at
            .parse()
            .map_err(|_| Error::Storage(format!("corrupt token expiry: {}", expires_at)))?;

        Ok(Some(TokenRecord {
            token,
            expires_at: from_millis(millis)?,
        }))
    }

    pub fn clear_token(&self) -> Result<()> {
        self.delete_setting(KEY_CALLING_TOKEN)?;
        self.delete_setting(KEY_CALLING_TOKEN_EXPIRES_AT)?;
        Ok(())
    }

    // ========================================================================
    // Pending status updates
    // ========================================================================

    /// Append a pending write. Returns false when the same (call, status)
    /// pair is already queued.
    pub fn enqueue_status_update(
        &self,
        call_id: &str,
        status: CallStatus,
        occurred_at: DateTime<Utc>,
        queued_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            r#"INSERT OR IGNORE INTO pending_status_updates (call_id, status, occurred_at, queued_at)
               VALUES (?1, ?2, ?3, ?4)"#,
            params![
                call_id,
                status.as_str(),
                occurred_at.timestamp_millis(),
                queued_at.timestamp_millis()
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Queued writes, oldest first.
    pub fn pending_updates(&self) -> Result<Vec<PendingStatusUpdate>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"SELECT entry_id, call_id, status, occurred_at, queued_at
               FROM pending_status_updates
               ORDER BY entry_id ASC"#,
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut updates = Vec::new();
        for row in rows {
            let (entry_id, call_id, status, occurred_at, queued_at) = row?;
            updates.push(PendingStatusUpdate {
                entry_id,
                call_id,
                status: status.parse()?,
                occurred_at: from_millis(occurred_at)?,
                queued_at: from_millis(queued_at)?,
            });
        }

        Ok(updates)
    }

    pub fn remove_pending(&self, entry_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM pending_status_updates WHERE entry_id = ?1",
            params![entry_id],
        )?;
        Ok(())
    }

    pub fn pending_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM pending_status_updates", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ========================================================================
    // Call log
    // ========================================================================

    pub fn save_call(&self, record: &CallRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT OR REPLACE INTO call_log
               (id, receiver_id, status, created_at, answered_at, ended_at, failed_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                record.id,
                record.receiver_id,
                record.status.as_str(),
                record.created_at.timestamp_millis(),
                record.answered_at.map(|t| t.timestamp_millis()),
                record.ended_at.map(|t| t.timestamp_millis()),
                record.failed_at.map(|t| t.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    pub fn get_call(&self, id: &str) -> Result<Option<CallRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                r#"SELECT id, receiver_id, status, created_at, answered_at, ended_at, failed_at
                   FROM call_log WHERE id = ?1"#,
                params![id],
                CallLogRow::from_row,
            )
            .optional()?;

        row.map(CallLogRow::into_record).transpose()
    }

    /// Record a local status transition on a logged call. Unknown ids are ignored.
    pub fn update_call_status(&self, id: &str, status: CallStatus, at: DateTime<Utc>) -> Result<()> {
        if let Some(mut record) = self.get_call(id)? {
            record.mark(status, at);
            self.save_call(&record)?;
        }
        Ok(())
    }

    pub fn recent_calls(&self, limit: i64) -> Result<Vec<CallRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"SELECT id, receiver_id, status, created_at, answered_at, ended_at, failed_at
               FROM call_log
               ORDER BY created_at DESC
               LIMIT ?1"#,
        )?;

        let rows = stmt.query_map(params![limit], CallLogRow::from_row)?;

        let mut calls = Vec::new();
        for row in rows {
            calls.push(row?.into_record()?);
        }

        Ok(calls)
    }
}

struct CallLogRow {
    id: String,
    receiver_id: String,
    status: String,
    created_at: i64,
    answered_at: Option<i64>,
    ended_at: Option<i64>,
    failed_at: Option<i64>,
}

impl CallLogRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            receiver_id: row.get(1)?,
            status: row.get(2)?,
            created_at: row.get(3)?,
            answered_at: row.get(4)?,
            ended_at: row.get(5)?,
            failed_at: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<CallRecord> {
        Ok(CallRecord {
            id: self.id,
            receiver_id: self.receiver_id,
            status: self.status.parse()?,
            created_at: from_millis(self.created_at)?,
            answered_at: self.answered_at.map(from_millis).transpose()?,
            ended_at: self.ended_at.map(from_millis).transpose()?,
            failed_at: self.failed_at.map(from_millis).transpose()?,
        })
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| Error::Storage(format!("timestamp out of range: {}", millis)))
}
