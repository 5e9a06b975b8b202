//! Call history recording.
//!
//! The core guarantees exactly one start/end pair per session, that start
//! precedes every message append, and that `end_call` runs on every exit
//! path. Recording itself is behind the [`CallHistory`] trait so the
//! gateway can run against SQLite or a purely in-memory sink.

pub mod sqlite;

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::session::settings::SessionSettings;

pub use sqlite::SqliteCallHistory;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Who produced a recorded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Assistant,
}

impl Speaker {
    pub fn as_str(self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Assistant => "assistant",
        }
    }
}

/// Append-only transcript and timing sink.
///
/// Methods are synchronous and cheap; implementations that touch disk keep
/// their connection behind a `Mutex` (rusqlite's `Connection` is `!Send`-safe
/// only behind one).
pub trait CallHistory: Send + Sync {
    /// Open a call record; returns the call id used for appends.
    fn start_call(
        &self,
        user_id: Option<&str>,
        session_id: &str,
        settings: &SessionSettings,
    ) -> anyhow::Result<String>;

    /// Append one message to an open call.
    fn add_message(
        &self,
        call_id: &str,
        speaker: Speaker,
        text: &str,
        duration_ms: u64,
        was_interrupted: bool,
    ) -> anyhow::Result<()>;

    /// Close a call record. Idempotent: ending an ended call is a no-op.
    fn end_call(&self, call_id: &str) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// One recorded message.
#[derive(Debug, Clone)]
pub struct RecordedMessage {
    pub speaker: Speaker,
    pub text: String,
    pub duration_ms: u64,
    pub was_interrupted: bool,
    pub timestamp: DateTime<Utc>,
}

/// One recorded call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub call_id: String,
    pub user_id: Option<String>,
    pub session_id: String,
    pub language: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub messages: Vec<RecordedMessage>,
}

/// In-memory call history, used in tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryCallHistory {
    calls: Mutex<HashMap<String, RecordedCall>>,
}

impl MemoryCallHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot a call by id.
    pub fn call(&self, call_id: &str) -> Option<RecordedCall> {
        self.calls.lock().unwrap().get(call_id).cloned()
    }

    /// Snapshot the call recorded for a session id.
    pub fn call_for_session(&self, session_id: &str) -> Option<RecordedCall> {
        self.calls
            .lock()
            .unwrap()
            .values()
            .find(|c| c.session_id == session_id)
            .cloned()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl CallHistory for MemoryCallHistory {
    fn start_call(
        &self,
        user_id: Option<&str>,
        session_id: &str,
        settings: &SessionSettings,
    ) -> anyhow::Result<String> {
        let call_id = Uuid::new_v4().to_string();
        let call = RecordedCall {
            call_id: call_id.clone(),
            user_id: user_id.map(str::to_string),
            session_id: session_id.to_string(),
            language: settings.language.clone(),
            started_at: Utc::now(),
            ended_at: None,
            messages: Vec::new(),
        };
        self.calls.lock().unwrap().insert(call_id.clone(), call);
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
        let mut calls = self.calls.lock().unwrap();
        let call = calls
            .get_mut(call_id)
            .ok_or_else(|| anyhow::anyhow!("unknown call id: {call_id}"))?;
        call.messages.push(RecordedMessage {
            speaker,
            text: text.to_string(),
            duration_ms,
            was_interrupted,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn end_call(&self, call_id: &str) -> anyhow::Result<()> {
        let mut calls = self.calls.lock().unwrap();
        if let Some(call) = calls.get_mut(call_id) {
            if call.ended_at.is_none() {
                call.ended_at = Some(Utc::now());
            }
        }
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
    fn test_start_add_end() {
        let history = MemoryCallHistory::new();
        let call_id = history.start_call(Some("u1"), "s1", &settings()).unwrap();
        history
            .add_message(&call_id, Speaker::User, "hello", 120, false)
            .unwrap();
        history
            .add_message(&call_id, Speaker::Assistant, "hi there", 900, false)
            .unwrap();
        history.end_call(&call_id).unwrap();

        let call = history.call(&call_id).unwrap();
        assert_eq!(call.messages.len(), 2);
        assert_eq!(call.messages[0].speaker, Speaker::User);
        assert!(call.ended_at.is_some());
    }

    #[test]
    fn test_end_is_idempotent() {
        let history = MemoryCallHistory::new();
        let call_id = history.start_call(None, "s2", &settings()).unwrap();
        history.end_call(&call_id).unwrap();
        let first_end = history.call(&call_id).unwrap().ended_at;
        history.end_call(&call_id).unwrap();
        assert_eq!(history.call(&call_id).unwrap().ended_at, first_end);
    }

    #[test]
    fn test_add_to_unknown_call_errors() {
        let history = MemoryCallHistory::new();
        let err = history.add_message("nope", Speaker::User, "x", 0, false);
        assert!(err.is_err());
    }

    #[test]
    fn test_call_for_session() {
        let history = MemoryCallHistory::new();
        let call_id = history.start_call(None, "s3", &settings()).unwrap();
        let found = history.call_for_session("s3").unwrap();
        assert_eq!(found.call_id, call_id);
        assert!(history.call_for_session("other").is_none());
    }

    #[test]
    fn test_anonymous_caller() {
        let history = MemoryCallHistory::new();
        let call_id = history.start_call(None, "s4", &settings()).unwrap();
        assert!(history.call(&call_id).unwrap().user_id.is_none());
    }
}
