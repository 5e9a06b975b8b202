//! Wire protocol for the realtime duplex channel.
//!
//! Events are JSON text frames tagged by a `type` field. Client events
//! arrive on the WebSocket; server events are pushed back on the same
//! connection, including heartbeats emitted during long-running stages.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Message received from the caller's client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Open a call session. Settings are partial; defaults are resolved once
    /// at session creation.
    SessionStart {
        session_id: String,
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        settings: HashMap<String, Value>,
    },
    /// A chunk of caller audio, base64-encoded.
    AudioData {
        session_id: String,
        audio: String,
    },
    /// Explicit barge-in request.
    Interrupt { session_id: String },
    /// Client-side end-of-speech signal.
    UserStopSpeaking { session_id: String },
    /// Update a subset of session settings mid-call.
    SettingsUpdate {
        session_id: String,
        settings: HashMap<String, Value>,
    },
    /// Liveness check; answered with `pong`.
    Ping {
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Close the call session.
    SessionEnd { session_id: String },
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Pipeline stage names used in `process_status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Transfer,
    Stt,
    Llm,
    Tts,
}

/// Stage progress states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Active,
    Completed,
    Error,
}

/// Per-turn stage timings, in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnTiming {
    pub stt: f64,
    pub llm: f64,
    pub tts: f64,
    pub total: f64,
}

/// How an interruption was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    AutoInterrupt,
    ManualInterrupt,
}

/// Message pushed to the caller's client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Free-form status notice (e.g. "still processing").
    Status {
        session_id: String,
        message: String,
    },
    /// Fine-grained pipeline stage progress.
    ProcessStatus {
        session_id: String,
        stage: Stage,
        status: StageStatus,
        details: String,
    },
    /// Recognized caller speech.
    Transcription {
        session_id: String,
        text: String,
    },
    /// Complete assistant response with synthesized audio (base64).
    AiResponse {
        session_id: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        audio: Option<String>,
        timing: TurnTiming,
    },
    /// One chunk of a streamed synthesis. Chunks arrive strictly in order;
    /// `text` rides on the first chunk, `timing` on the final one.
    AudioChunk {
        session_id: String,
        index: usize,
        total: usize,
        text: String,
        audio: String,
        is_final: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        timing: Option<TurnTiming>,
    },
    /// Liveness signal emitted while a stage is in flight.
    Heartbeat { session_id: String },
    /// Barge-in acknowledged; the in-flight response was cancelled.
    InterruptConfirmed {
        session_id: String,
        interrupt_type: InterruptKind,
        message: String,
    },
    /// Stop-phrase override fired; client should halt playback immediately.
    EmergencyInterrupt {
        session_id: String,
        message: String,
    },
    /// Recoverable error; the session stays alive.
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        message: String,
    },
    /// Session closed, with a short summary.
    SessionEnded {
        session_id: String,
        summary: SessionSummary,
    },
    /// Answer to a client `ping`.
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

/// Summary attached to `session_ended`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSummary {
    pub duration_secs: f64,
    pub turns: usize,
    pub interrupted_turns: usize,
}

impl ServerEvent {
    /// Session id carried by this event, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerEvent::Status { session_id, .. }
            | ServerEvent::ProcessStatus { session_id, .. }
            | ServerEvent::Transcription { session_id, .. }
            | ServerEvent::AiResponse { session_id, .. }
            | ServerEvent::AudioChunk { session_id, .. }
            | ServerEvent::Heartbeat { session_id }
            | ServerEvent::InterruptConfirmed { session_id, .. }
            | ServerEvent::EmergencyInterrupt { session_id, .. }
            | ServerEvent::SessionEnded { session_id, .. } => Some(session_id),
            ServerEvent::Error { session_id, .. } | ServerEvent::Pong { session_id } => {
                session_id.as_deref()
            }
        }
    }
}
