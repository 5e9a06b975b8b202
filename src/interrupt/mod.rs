//! Barge-in detection and in-flight response cancellation.
//!
//! Tracks, per session, whether the caller is speaking and whether an AI
//! response is in flight. Sustained caller speech while the AI is
//! responding arms a countdown; on expiry the response's cancellation
//! token fires and the caller gets an `interrupt_confirmed` notification.
//! Short bursts below the debounce threshold are treated as noise.
//!
//! Cancellation is a token observed by the pipeline at its suspension
//! points, so an interrupted turn resolves as a normal outcome rather
//! than an error. Cancelling an already-finished turn is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::schema::InterruptConfig;
use crate::protocol::{InterruptKind, ServerEvent};

// ---------------------------------------------------------------------------
// Per-session state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct InterruptEntry {
    speaking_since: Option<Instant>,
    responding: bool,
    timer: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

impl InterruptEntry {
    fn disarm_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Cancel the in-flight response and notify the client.
///
/// Shared by the countdown expiry, manual interrupts, and the stop-phrase
/// override. Token cancellation is idempotent; committed turns are never
/// touched.
fn fire_interrupt(
    entry: &mut InterruptEntry,
    session_id: &str,
    kind: InterruptKind,
    events: &UnboundedSender<ServerEvent>,
) -> bool {
    let was_responding = entry.responding;
    if let Some(cancel) = entry.cancel.take() {
        cancel.cancel();
    }
    entry.responding = false;
    entry.disarm_timer();

    let message = match kind {
        InterruptKind::AutoInterrupt => "I'll let you speak",
        InterruptKind::ManualInterrupt => "Got it, go ahead",
    };
    let _ = events.send(ServerEvent::InterruptConfirmed {
        session_id: session_id.to_string(),
        interrupt_type: kind,
        message: message.to_string(),
    });
    info!("session {}: interrupted ({:?})", session_id, kind);
    was_responding
}

// ---------------------------------------------------------------------------
// InterruptManager
// ---------------------------------------------------------------------------

/// Process-wide barge-in coordinator, one entry per active session.
pub struct InterruptManager {
    config: InterruptConfig,
    entries: Arc<Mutex<HashMap<String, InterruptEntry>>>,
}

impl InterruptManager {
    pub fn new(config: InterruptConfig) -> Self {
        Self {
            config,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn register(&self, session_id: &str) {
        self.entries
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default();
    }

    /// Remove all tracking for a session, cancelling anything in flight.
    pub fn unregister(&self, session_id: &str) {
        if let Some(mut entry) = self.entries.lock().unwrap().remove(session_id) {
            entry.disarm_timer();
            if let Some(cancel) = entry.cancel.take() {
                cancel.cancel();
            }
        }
    }

    /// Caller audio started arriving. Arms the auto-interrupt countdown when
    /// the AI is mid-response.
    pub fn start_user_speaking(&self, session_id: &str, events: &UnboundedSender<ServerEvent>) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(session_id.to_string()).or_default();

        if entry.speaking_since.is_none() {
            entry.speaking_since = Some(Instant::now());
            debug!("session {}: user speaking", session_id);
        }

        if entry.responding && entry.timer.is_none() {
            entry.timer = Some(self.spawn_countdown(session_id, events.clone()));
        }
    }

    /// Caller stopped speaking. Sub-debounce speech is ignored as noise.
    pub fn stop_user_speaking(&self, session_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(session_id) else {
            return;
        };
        entry.disarm_timer();
        if let Some(since) = entry.speaking_since.take() {
            let duration = since.elapsed();
            debug!(
                "session {}: user stopped speaking after {:.1}s",
                session_id,
                duration.as_secs_f64()
            );
        }
    }

    /// An AI response is starting. Returns the cancellation token the
    /// pipeline must observe at each suspension point.
    pub fn begin_ai_response(
        &self,
        session_id: &str,
        events: &UnboundedSender<ServerEvent>,
    ) -> CancellationToken {
        let token = CancellationToken::new();
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(session_id.to_string()).or_default();
        entry.responding = true;
        entry.cancel = Some(token.clone());
        // The caller may already have been talking when the response began.
        if entry.speaking_since.is_some() && entry.timer.is_none() {
            entry.timer = Some(self.spawn_countdown(session_id, events.clone()));
        }
        token
    }

    /// The AI response finished (or was cancelled). The countdown exists
    /// only while a response is in flight, so it is disarmed here too.
    pub fn end_ai_response(&self, session_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(session_id) {
            entry.responding = false;
            entry.cancel = None;
            entry.disarm_timer();
        }
    }

    /// Explicit barge-in request. Returns whether a response was in flight.
    pub fn manual_interrupt(
        &self,
        session_id: &str,
        events: &UnboundedSender<ServerEvent>,
    ) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(session_id) {
            Some(entry) => fire_interrupt(entry, session_id, InterruptKind::ManualInterrupt, events),
            None => false,
        }
    }

    /// Stop-phrase override: if recognized text matches a configured
    /// phrase, interrupt immediately, bypassing the countdown entirely.
    /// Returns `true` when the override fired.
    pub fn check_stop_phrase(
        &self,
        session_id: &str,
        text: &str,
        events: &UnboundedSender<ServerEvent>,
    ) -> bool {
        let lowered = text.to_lowercase();
        if !self.config.stop_phrases.iter().any(|p| lowered.contains(p.as_str())) {
            return false;
        }

        let _ = events.send(ServerEvent::EmergencyInterrupt {
            session_id: session_id.to_string(),
            message: "Emergency interrupt activated - stopping current audio".to_string(),
        });

        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(session_id) {
            fire_interrupt(entry, session_id, InterruptKind::ManualInterrupt, events);
        }
        true
    }

    pub fn is_responding(&self, session_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(session_id)
            .map(|e| e.responding)
            .unwrap_or(false)
    }

    pub fn is_user_speaking(&self, session_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(session_id)
            .map(|e| e.speaking_since.is_some())
            .unwrap_or(false)
    }

    pub fn speech_duration(&self, session_id: &str) -> Duration {
        self.entries
            .lock()
            .unwrap()
            .get(session_id)
            .and_then(|e| e.speaking_since)
            .map(|since| since.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    // -----------------------------------------------------------------------
    // Countdown
    // -----------------------------------------------------------------------

    fn spawn_countdown(&self, session_id: &str, events: UnboundedSender<ServerEvent>) -> JoinHandle<()> {
        let entries = Arc::clone(&self.entries);
        let session_id = session_id.to_string();
        let delay = Duration::from_millis(self.config.auto_interrupt_delay_ms);
        let debounce = Duration::from_millis(self.config.min_speech_duration_ms);

        debug!(
            "session {}: arming auto-interrupt countdown ({:?})",
            session_id, delay
        );

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let mut entries = entries.lock().unwrap();
            let Some(entry) = entries.get_mut(&session_id) else {
                return;
            };
            entry.timer = None;

            let still_speaking_long_enough = entry
                .speaking_since
                .map(|since| since.elapsed() >= debounce)
                .unwrap_or(false);

            if entry.responding && still_speaking_long_enough {
                fire_interrupt(&mut *entry, &session_id, InterruptKind::AutoInterrupt, &events);
            }
        })
    }
}
