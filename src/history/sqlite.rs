//! SQLite-backed call history.
//!
//! Calls and their messages are stored in a queryable SQLite database.
//! Uses a sync `Mutex<Connection>` because rusqlite's `Connection` is
//! `!Send`; all methods are synchronous and short.
//!
//! Default DB location: `~/.voicegate/call_history.db`.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::history::{CallHistory, Speaker};
use crate::session::settings::SessionSettings;

pub struct SqliteCallHistory {
    conn: Mutex<Connection>,
}

impl SqliteCallHistory {
    /// Open (or create) the database at `db_path` and run migrations.
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        Self::migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (tests).
    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run schema migrations (idempotent).
    fn migrate(conn: &Connection) -> anyhow::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS calls (
                 id                TEXT PRIMARY KEY,
                 user_id           TEXT,
                 session_id        TEXT NOT NULL,
                 language          TEXT NOT NULL DEFAULT 'en',
                 started_at        TEXT NOT NULL,
                 ended_at          TEXT,
                 duration_seconds  INTEGER NOT NULL DEFAULT 0,
                 status            TEXT NOT NULL DEFAULT 'active',
                 message_count     INTEGER NOT NULL DEFAULT 0,
                 interrupted_count INTEGER NOT NULL DEFAULT 0
             );
             CREATE TABLE IF NOT EXISTS call_messages (
                 id               TEXT PRIMARY KEY,
                 call_id          TEXT NOT NULL REFERENCES calls(id),
                 speaker          TEXT NOT NULL,
                 message          TEXT NOT NULL,
                 timestamp        TEXT NOT NULL,
                 duration_ms      INTEGER NOT NULL DEFAULT 0,
                 was_interrupted  INTEGER NOT NULL DEFAULT 0
             );
             CREATE INDEX IF NOT EXISTS idx_calls_session_id ON calls (session_id);
             CREATE INDEX IF NOT EXISTS idx_calls_user_id ON calls (user_id);
             CREATE INDEX IF NOT EXISTS idx_messages_call_id ON call_messages (call_id);",
        )?;
        Ok(())
    }

    /// Number of recorded calls (operational tooling).
    pub fn call_count(&self) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        let n = conn.query_row("SELECT COUNT(*) FROM calls", [], |row| row.get(0))?;
        Ok(n)
    }

    /// Message count for one call.
    pub fn message_count(&self, call_id: &str) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM call_messages WHERE call_id = ?1",
            params![call_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Delete calls (and their messages) older than `days_to_keep` days.
    ///
    /// Returns the number of calls removed.
    pub fn cleanup_old_calls(&self, days_to_keep: i64) -> anyhow::Result<usize> {
        let cutoff = (Utc::now() - chrono::Duration::days(days_to_keep)).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM call_messages WHERE call_id IN
                 (SELECT id FROM calls WHERE started_at < ?1)",
            params![cutoff],
        )?;
        let removed = conn.execute("DELETE FROM calls WHERE started_at < ?1", params![cutoff])?;
        Ok(removed)
    }
}

impl CallHistory for SqliteCallHistory {
    fn start_call(
        &self,
        user_id: Option<&str>,
        session_id: &str,
        settings: &SessionSettings,
    ) -> anyhow::Result<String> {
        let call_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO calls (id, user_id, session_id, language, started_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'active')",
            params![call_id, user_id, session_id, settings.language, now],
        )?;
        Ok(call_id)
    }

    fn add_message(
        &self,
        call_id: &str,
        speaker: Speaker,
        text: &str,
        duration_ms: u64,
        was_interrupted: bool,
    ) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO call_messages
                 (id, call_id, speaker, message, timestamp, duration_ms, was_interrupted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                call_id,
                speaker.as_str(),
                text,
                now,
                duration_ms as i64,
                was_interrupted as i64,
            ],
        )?;
        conn.execute(
            "UPDATE calls SET
                 message_count = message_count + 1,
                 interrupted_count = interrupted_count + ?2
             WHERE id = ?1",
            params![call_id, was_interrupted as i64],
        )?;
        Ok(())
    }

    fn end_call(&self, call_id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        let started_at: Option<String> = conn
            .query_row(
                "SELECT started_at FROM calls WHERE id = ?1 AND ended_at IS NULL",
                params![call_id],
                |row| row.get(0),
            )
            .optional()?;

        // Already ended (or unknown): no-op keeps end_call idempotent.
        let started_at = match started_at {
            Some(s) => s,
            None => return Ok(()),
        };

        let duration_seconds = chrono::DateTime::parse_from_rfc3339(&started_at)
            .map(|start| (Utc::now() - start.with_timezone(&Utc)).num_seconds().max(0))
            .unwrap_or(0);

        conn.execute(
            "UPDATE calls SET ended_at = ?2, duration_seconds = ?3, status = 'ended'
             WHERE id = ?1",
            params![call_id, Utc::now().to_rfc3339(), duration_seconds],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SessionSettings {
        SessionSettings::default()
    }

    #[test]
    fn test_start_and_end_call() {
        let history = SqliteCallHistory::in_memory().unwrap();
        let call_id = history.start_call(Some("u1"), "s1", &settings()).unwrap();
        history.end_call(&call_id).unwrap();
        assert_eq!(history.call_count().unwrap(), 1);
    }

    #[test]
    fn test_messages_update_counters() {
        let history = SqliteCallHistory::in_memory().unwrap();
        let call_id = history.start_call(None, "s1", &settings()).unwrap();
        history
            .add_message(&call_id, Speaker::User, "hello", 100, false)
            .unwrap();
        history
            .add_message(&call_id, Speaker::Assistant, "hi", 800, true)
            .unwrap();
        assert_eq!(history.message_count(&call_id).unwrap(), 2);

        let conn = history.conn.lock().unwrap();
        let (msgs, interrupted): (i64, i64) = conn
            .query_row(
                "SELECT message_count, interrupted_count FROM calls WHERE id = ?1",
                params![call_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(msgs, 2);
        assert_eq!(interrupted, 1);
    }

    #[test]
    fn test_end_call_idempotent() {
        let history = SqliteCallHistory::in_memory().unwrap();
        let call_id = history.start_call(None, "s1", &settings()).unwrap();
        history.end_call(&call_id).unwrap();

        let first_end: String = {
            let conn = history.conn.lock().unwrap();
            conn.query_row(
                "SELECT ended_at FROM calls WHERE id = ?1",
                params![call_id],
                |row| row.get(0),
            )
            .unwrap()
        };

        history.end_call(&call_id).unwrap();
        let second_end: String = {
            let conn = history.conn.lock().unwrap();
            conn.query_row(
                "SELECT ended_at FROM calls WHERE id = ?1",
                params![call_id],
                |row| row.get(0),
            )
            .unwrap()
        };
        assert_eq!(first_end, second_end);
    }

    #[test]
    fn test_end_unknown_call_is_noop() {
        let history = SqliteCallHistory::in_memory().unwrap();
        assert!(history.end_call("missing").is_ok());
    }

    #[test]
    fn test_cleanup_old_calls_keeps_recent() {
        let history = SqliteCallHistory::in_memory().unwrap();
        let call_id = history.start_call(None, "s1", &settings()).unwrap();
        history
            .add_message(&call_id, Speaker::User, "hello", 0, false)
            .unwrap();
        let removed = history.cleanup_old_calls(90).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(history.call_count().unwrap(), 1);
    }
}
