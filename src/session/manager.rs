//! Session registry and per-session turn gating.
//!
//! The manager owns every active [`SessionHandle`]. A session's audio,
//! turn history, and utterance accumulation are mutated only through its
//! handle; the non-blocking processing lock guarantees at most one turn
//! in flight per session. Audio arriving mid-turn is queued (raw) or
//! dropped (container) rather than interleaved.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use crate::audio::{AudioBuffer, AudioFormat};
use crate::config::schema::SessionConfig;
use crate::errors::SessionError;
use crate::history::CallHistory;
use crate::protocol::SessionSummary;
use crate::session::settings::SessionSettings;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Call lifecycle status. Transitions only move forward; `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallStatus {
    Idle,
    Dialing,
    Connected,
    Ended,
}

impl CallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Idle => "idle",
            CallStatus::Dialing => "dialing",
            CallStatus::Connected => "connected",
            CallStatus::Ended => "ended",
        }
    }
}

/// Speaker role within a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One committed conversation turn. Never mutated after append.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub interrupted: bool,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>, duration_ms: u64, interrupted: bool) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            duration_ms,
            interrupted,
        }
    }
}

#[derive(Debug)]
struct SessionState {
    user_id: Option<String>,
    status: CallStatus,
    settings: SessionSettings,
    turns: Vec<Turn>,
    call_id: Option<String>,
    created_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    // Utterance accumulation across recognition fragments.
    accumulated_text: String,
    silence_count: u32,
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// Handle to one active call session.
///
/// Cheap to clone via `Arc`; all interior state is independently locked so
/// short accessors never contend with an in-flight turn.
pub struct SessionHandle {
    pub id: String,
    state: Mutex<SessionState>,
    buffer: Mutex<AudioBuffer>,
    pending_audio: Mutex<Vec<Vec<u8>>>,
    processing: Arc<tokio::sync::Mutex<()>>,
    last_turn_at: Mutex<Option<Instant>>,
}

impl SessionHandle {
    fn new(id: String, user_id: Option<String>, settings: SessionSettings, config: &SessionConfig) -> Self {
        Self {
            id,
            state: Mutex::new(SessionState {
                user_id,
                status: CallStatus::Dialing,
                settings,
                turns: Vec::new(),
                call_id: None,
                created_at: Utc::now(),
                ended_at: None,
                accumulated_text: String::new(),
                silence_count: 0,
            }),
            buffer: Mutex::new(AudioBuffer::new(config.min_audio_bytes, config.max_buffered_chunks)),
            pending_audio: Mutex::new(Vec::new()),
            processing: Arc::new(tokio::sync::Mutex::new(())),
            last_turn_at: Mutex::new(None),
        }
    }

    pub fn status(&self) -> CallStatus {
        self.state.lock().unwrap().status
    }

    /// Advance the status. Backward transitions are rejected; `Ended` is
    /// terminal. Returns whether the status actually changed.
    pub fn advance_status(&self, to: CallStatus) -> bool {
        let mut state = self.state.lock().unwrap();
        if to <= state.status {
            return false;
        }
        debug!("session {}: {} -> {}", self.id, state.status.as_str(), to.as_str());
        state.status = to;
        if to == CallStatus::Ended {
            state.ended_at = Some(Utc::now());
        }
        true
    }

    pub fn settings(&self) -> SessionSettings {
        self.state.lock().unwrap().settings.clone()
    }

    pub fn update_settings(&self, partial: &HashMap<String, serde_json::Value>) {
        self.state.lock().unwrap().settings.merge(partial);
    }

    pub fn user_id(&self) -> Option<String> {
        self.state.lock().unwrap().user_id.clone()
    }

    pub fn call_id(&self) -> Option<String> {
        self.state.lock().unwrap().call_id.clone()
    }

    fn set_call_id(&self, call_id: String) {
        self.state.lock().unwrap().call_id = Some(call_id);
    }

    /// Append a committed turn.
    pub fn push_turn(&self, turn: Turn) {
        self.state.lock().unwrap().turns.push(turn);
    }

    /// The most recent `n` turns, oldest first.
    pub fn recent_turns(&self, n: usize) -> Vec<Turn> {
        let state = self.state.lock().unwrap();
        let start = state.turns.len().saturating_sub(n);
        state.turns[start..].to_vec()
    }

    pub fn turn_count(&self) -> usize {
        self.state.lock().unwrap().turns.len()
    }

    // -- Utterance accumulation -------------------------------------------

    /// Record an empty recognition; returns the new consecutive-silence count.
    pub fn record_silence(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.silence_count += 1;
        state.silence_count
    }

    /// Append a recognized fragment; resets the silence counter and returns
    /// the full accumulated text.
    pub fn append_fragment(&self, fragment: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.silence_count = 0;
        if state.accumulated_text.is_empty() {
            state.accumulated_text = fragment.to_string();
        } else {
            state.accumulated_text.push(' ');
            state.accumulated_text.push_str(fragment);
        }
        state.accumulated_text.clone()
    }

    /// Take and clear accumulated text, resetting the silence counter.
    pub fn take_accumulated(&self) -> String {
        let mut state = self.state.lock().unwrap();
        state.silence_count = 0;
        std::mem::take(&mut state.accumulated_text)
    }

    pub fn accumulated_text(&self) -> String {
        self.state.lock().unwrap().accumulated_text.clone()
    }

    // -- Teardown helpers --------------------------------------------------

    /// Point-in-time snapshot for operational tooling.
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.lock().unwrap();
        serde_json::json!({
            "sessionId": self.id,
            "userId": state.user_id,
            "status": state.status.as_str(),
            "language": state.settings.language,
            "turns": state.turns.len(),
            "createdAt": state.created_at.to_rfc3339(),
        })
    }

    /// Summary for the `session_ended` event.
    pub fn summary(&self) -> SessionSummary {
        let state = self.state.lock().unwrap();
        let end = state.ended_at.unwrap_or_else(Utc::now);
        SessionSummary {
            duration_secs: (end - state.created_at).num_milliseconds() as f64 / 1000.0,
            turns: state.turns.len(),
            interrupted_turns: state.turns.iter().filter(|t| t.interrupted).count(),
        }
    }

    /// Clear the audio buffer (input error recovery).
    pub fn clear_buffer(&self) {
        self.buffer.lock().unwrap().clear();
    }

    /// Drain the raw-audio side queue into one combined payload.
    pub fn take_pending_audio(&self) -> Option<Vec<u8>> {
        let mut pending = self.pending_audio.lock().unwrap();
        if pending.is_empty() {
            return None;
        }
        let chunks = std::mem::take(&mut *pending);
        let mut combined = Vec::with_capacity(chunks.iter().map(Vec::len).sum());
        for chunk in chunks {
            combined.extend_from_slice(&chunk);
        }
        Some(combined)
    }
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

/// Result of offering one audio chunk to a session.
pub enum IngestOutcome {
    /// Below the flush threshold; keep buffering.
    Buffering,
    /// A turn is in flight; this raw chunk was queued for afterwards.
    QueuedBehindTurn,
    /// A turn is in flight; this container chunk was dropped.
    DroppedBusy,
    /// Flush-ready but inside the inter-turn throttle window.
    Throttled,
    /// A turn may start: drained audio plus the held processing guard.
    ReadyTurn {
        audio: Vec<u8>,
        format: AudioFormat,
        guard: OwnedMutexGuard<()>,
    },
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

/// Registry of active call sessions.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
    history: Arc<dyn CallHistory>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(config: SessionConfig, history: Arc<dyn CallHistory>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            history,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create a session, rejecting duplicate ids. Settings defaults are
    /// resolved here, once; the call-history record is opened before the
    /// handle becomes visible.
    pub fn create(
        &self,
        id: &str,
        user_id: Option<&str>,
        partial_settings: &HashMap<String, serde_json::Value>,
    ) -> Result<Arc<SessionHandle>, SessionError> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(id) {
            return Err(SessionError::Duplicate(id.to_string()));
        }

        let settings = SessionSettings::resolve(partial_settings);
        let handle = Arc::new(SessionHandle::new(
            id.to_string(),
            user_id.map(str::to_string),
            settings.clone(),
            &self.config,
        ));

        match self.history.start_call(user_id, id, &settings) {
            Ok(call_id) => handle.set_call_id(call_id),
            Err(e) => tracing::warn!("call history start failed for {}: {}", id, e),
        }

        sessions.insert(id.to_string(), Arc::clone(&handle));
        info!("session {} created (user: {})", id, user_id.unwrap_or("anonymous"));
        Ok(handle)
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    /// End a session. Idempotent and safe from every teardown path: an
    /// unknown or already-ended id is a no-op returning `None`.
    pub fn end(&self, id: &str) -> Option<SessionSummary> {
        let handle = self.sessions.lock().unwrap().remove(id)?;
        handle.advance_status(CallStatus::Ended);
        if let Some(call_id) = handle.call_id() {
            if let Err(e) = self.history.end_call(&call_id) {
                tracing::warn!("call history end failed for {}: {}", id, e);
            }
        }
        handle.clear_buffer();
        info!("session {} ended", id);
        Some(handle.summary())
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Snapshots of every active session.
    pub fn snapshots(&self) -> Vec<serde_json::Value> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .map(|handle| handle.snapshot())
            .collect()
    }

    /// Offer an audio chunk to a session, applying the busy/throttle policy.
    pub fn ingest_audio(&self, handle: &Arc<SessionHandle>, chunk: Vec<u8>) -> IngestOutcome {
        // A turn is in flight: never interleave. Raw fragments queue for
        // afterwards; a self-describing container would stomp the queue's
        // format assumptions, so it is dropped with a notice instead.
        let guard = match Arc::clone(&handle.processing).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                if AudioFormat::detect(&chunk).is_container() {
                    debug!("session {}: busy, dropping container chunk", handle.id);
                    return IngestOutcome::DroppedBusy;
                }
                handle.pending_audio.lock().unwrap().push(chunk);
                debug!("session {}: busy, queued raw chunk", handle.id);
                return IngestOutcome::QueuedBehindTurn;
            }
        };

        let ready = handle.buffer.lock().unwrap().push(chunk);
        if !ready {
            return IngestOutcome::Buffering;
        }

        // Suppress spurious re-triggering from near-simultaneous flushes.
        let throttle = Duration::from_millis(self.config.min_turn_interval_ms);
        {
            let last = handle.last_turn_at.lock().unwrap();
            if let Some(at) = *last {
                if at.elapsed() < throttle {
                    return IngestOutcome::Throttled;
                }
            }
        }

        let drained = handle.buffer.lock().unwrap().drain();
        match drained {
            Some((audio, format)) => {
                *handle.last_turn_at.lock().unwrap() = Some(Instant::now());
                IngestOutcome::ReadyTurn { audio, format, guard }
            }
            None => IngestOutcome::Buffering,
        }
    }

    /// Re-acquire the turn gate for queued audio after a turn completes.
    pub fn try_begin_turn(&self, handle: &Arc<SessionHandle>) -> Option<OwnedMutexGuard<()>> {
        Arc::clone(&handle.processing).try_lock_owned().ok()
    }
}
