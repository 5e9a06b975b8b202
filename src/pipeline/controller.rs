//! Per-turn orchestration: recognition, model selection, fallback,
//! cleanup, chunked synthesis, and side effects.
//!
//! A turn runs while the session's processing guard is held, so at most
//! one is in flight per session. Every downstream call is raced against
//! the turn's cancellation token and its own stage timeout; cancellation
//! resolves as [`TurnOutcome::Interrupted`], never as an error. No
//! adapter failure escapes this module — the caller always gets a
//! response, possibly a templated apology.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::AudioFormat;
use crate::config::schema::{GatewayConfig, PipelineConfig};
use crate::engines::{ChatMessage, CompletionRequest, LanguageModel, SpeechSynthesis, SpeechToText};
use crate::history::{CallHistory, Speaker};
use crate::interrupt::InterruptManager;
use crate::pipeline::heartbeat::start_heartbeat;
use crate::pipeline::text::{
    clean_for_speech, is_utterance_complete, pick_apology, pick_canned_response,
    split_speech_chunks,
};
use crate::pool::ServiceKind;
use crate::protocol::{ServerEvent, Stage, StageStatus, TurnTiming};
use crate::quality::{AvailabilityProbe, QualityMonitor};
use crate::session::{Role, SessionHandle, SessionManager, Turn};

/// Safety preamble prepended to the model context when safety mode is on.
const SAFETY_PREAMBLE: &str = "You are a friendly, patient assistant speaking with a young \
     caller. Keep replies short, cheerful, and appropriate for children.";

/// Text substituted for the utterance when a stop phrase fires.
const STOP_PHRASE_UTTERANCE: &str = "Please stop and listen to me now.";

/// How one offered utterance resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// A response (possibly an apology) was delivered.
    Responded,
    /// Barge-in cancelled the in-flight response.
    Interrupted,
    /// The utterance looks incomplete; waiting for more audio.
    WaitingForMore,
    /// Nothing recognizable in the audio.
    NoSpeech,
    /// Recognition failed; an error event was sent.
    InputError,
}

enum ModelOutcome {
    Text(String),
    Interrupted,
}

pub struct PipelineController {
    config: PipelineConfig,
    /// Smaller model used for the single retry after a primary failure.
    fallback_model: String,
    sessions: Arc<SessionManager>,
    quality: Arc<QualityMonitor>,
    interrupts: Arc<InterruptManager>,
    history: Arc<dyn CallHistory>,
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn SpeechSynthesis>,
    probe: Arc<dyn AvailabilityProbe>,
}

impl PipelineController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &GatewayConfig,
        sessions: Arc<SessionManager>,
        quality: Arc<QualityMonitor>,
        interrupts: Arc<InterruptManager>,
        history: Arc<dyn CallHistory>,
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn SpeechSynthesis>,
        probe: Arc<dyn AvailabilityProbe>,
    ) -> Self {
        let fallback_model = config
            .quality
            .llm_chain
            .fallbacks
            .first()
            .cloned()
            .unwrap_or_else(|| config.quality.llm_chain.primary.clone());
        Self {
            config: config.pipeline.clone(),
            fallback_model,
            sessions,
            quality,
            interrupts,
            history,
            stt,
            llm,
            tts,
            probe,
        }
    }

    /// Run one turn over drained audio, then drain any audio that queued
    /// up behind it. The processing guard is held for the whole turn and
    /// re-acquired per queued batch.
    pub async fn run_audio_turn(
        &self,
        session: Arc<SessionHandle>,
        mut audio: Vec<u8>,
        mut format: AudioFormat,
        mut guard: OwnedMutexGuard<()>,
        events: UnboundedSender<ServerEvent>,
    ) {
        loop {
            let outcome = self
                .process_utterance_audio(&session, &audio, format, &events)
                .await;
            debug!("session {}: turn outcome {:?}", session.id, outcome);
            drop(guard);

            // Re-acquire the gate before draining the side queue; if another
            // ingest claimed it first, its turn will drain the queue instead.
            let Some(next_guard) = self.sessions.try_begin_turn(&session) else {
                break;
            };
            let min_bytes = self.sessions.config().min_audio_bytes;
            let queued = session
                .take_pending_audio()
                .filter(|combined| combined.len() >= min_bytes);
            match queued {
                Some(combined) => {
                    info!(
                        "session {}: processing {} queued bytes",
                        session.id,
                        combined.len()
                    );
                    format = AudioFormat::detect(&combined);
                    audio = combined;
                    guard = next_guard;
                }
                None => break,
            }
        }
    }

    /// Recognize one audio payload and, when it completes an utterance,
    /// produce a response.
    pub async fn process_utterance_audio(
        &self,
        session: &Arc<SessionHandle>,
        audio: &[u8],
        format: AudioFormat,
        events: &UnboundedSender<ServerEvent>,
    ) -> TurnOutcome {
        let sid = session.id.clone();
        let settings = session.settings();

        self.send_stage(events, &sid, Stage::Transfer, StageStatus::Completed, "Audio received");
        self.send_stage(events, &sid, Stage::Stt, StageStatus::Active, "Recognizing speech...");

        // -- Recognition, with its own timeout ------------------------------
        let stt_start = Instant::now();
        let stt_result = tokio::time::timeout(
            Duration::from_millis(self.config.stt_timeout_ms),
            self.stt.transcribe(audio, format, &settings.language),
        )
        .await;
        let stt_duration = stt_start.elapsed();

        let transcript = match stt_result {
            Ok(Ok(t)) => {
                self.quality.record(ServiceKind::Stt, stt_duration, true);
                t
            }
            Ok(Err(e)) => {
                self.quality.record(ServiceKind::Stt, stt_duration, false);
                self.maybe_spawn_failover(ServiceKind::Stt);
                warn!("session {}: recognition failed: {}", sid, e);
                self.send_stage(events, &sid, Stage::Stt, StageStatus::Error, "Recognition failed");
                session.clear_buffer();
                return TurnOutcome::InputError;
            }
            Err(_) => {
                self.quality.record(ServiceKind::Stt, stt_duration, false);
                self.maybe_spawn_failover(ServiceKind::Stt);
                warn!("session {}: recognition timed out", sid);
                self.send_stage(events, &sid, Stage::Stt, StageStatus::Error, "Recognition timed out");
                return TurnOutcome::InputError;
            }
        };

        // -- Utterance accumulation -----------------------------------------
        let fragment = transcript.text.trim().to_string();
        let user_text = if fragment.is_empty() {
            let silences = session.record_silence();
            let accumulated = session.accumulated_text();
            if silences >= self.config.silence_flush_threshold && !accumulated.trim().is_empty() {
                info!("session {}: flushing utterance after {} silences", sid, silences);
                session.take_accumulated()
            } else {
                self.send_stage(events, &sid, Stage::Stt, StageStatus::Error, "No speech detected");
                return TurnOutcome::NoSpeech;
            }
        } else {
            let _ = events.send(ServerEvent::Transcription {
                session_id: sid.clone(),
                text: fragment.clone(),
            });

            if self.interrupts.check_stop_phrase(&sid, &fragment, events) {
                session.take_accumulated();
                STOP_PHRASE_UTTERANCE.to_string()
            } else {
                let accumulated = session.append_fragment(&fragment);
                if is_utterance_complete(&accumulated, &self.config) {
                    session.take_accumulated()
                } else {
                    debug!("session {}: accumulating (\"{}\")", sid, accumulated);
                    return TurnOutcome::WaitingForMore;
                }
            }
        };

        self.send_stage(
            events,
            &sid,
            Stage::Stt,
            StageStatus::Completed,
            &format!("Recognized: {}", truncate(&user_text, 50)),
        );
        info!(
            "session {}: user said ({:.2}s): {}",
            sid,
            stt_duration.as_secs_f64(),
            user_text
        );

        self.respond(session, &user_text, stt_duration, events).await
    }

    /// Generate and stream the response for a completed utterance.
    async fn respond(
        &self,
        session: &Arc<SessionHandle>,
        user_text: &str,
        stt_duration: Duration,
        events: &UnboundedSender<ServerEvent>,
    ) -> TurnOutcome {
        let sid = session.id.clone();
        let token = self.interrupts.begin_ai_response(&sid, events);
        let _hb = start_heartbeat(
            sid.clone(),
            events.clone(),
            Duration::from_millis(self.config.heartbeat_interval_ms),
        );

        let outcome = self
            .generate_and_stream(session, user_text, stt_duration, &token, events)
            .await;

        self.interrupts.end_ai_response(&sid);
        outcome
    }

    async fn generate_and_stream(
        &self,
        session: &Arc<SessionHandle>,
        user_text: &str,
        stt_duration: Duration,
        token: &CancellationToken,
        events: &UnboundedSender<ServerEvent>,
    ) -> TurnOutcome {
        let sid = session.id.clone();
        let settings = session.settings();

        self.send_stage(events, &sid, Stage::Llm, StageStatus::Active, "Thinking...");

        // Context is assembled from committed turns; the current utterance
        // is committed right after so turns stay in arrival order.
        let context = self.build_context(session, user_text, self.sessions.config().context_turns);
        let reduced_context =
            self.build_context(session, user_text, self.sessions.config().fallback_context_turns);
        session.push_turn(Turn::new(
            Role::User,
            user_text,
            stt_duration.as_millis() as u64,
            false,
        ));
        self.record_history(session, Speaker::User, user_text, stt_duration, false);

        // -- Model ----------------------------------------------------------
        let llm_start = Instant::now();
        let ai_text = if self.quality.is_emergency(ServiceKind::Llm) {
            // Every model instance is down; the canned handler keeps the
            // conversation alive.
            pick_canned_response().to_string()
        } else {
            match self
                .call_model_with_fallback(context, reduced_context, token, &sid)
                .await
            {
                ModelOutcome::Text(text) => text,
                ModelOutcome::Interrupted => {
                    info!("session {}: model stage interrupted", sid);
                    return TurnOutcome::Interrupted;
                }
            }
        };
        let llm_duration = llm_start.elapsed();

        self.send_stage(
            events,
            &sid,
            Stage::Llm,
            StageStatus::Completed,
            &format!("Response: {}", truncate(&ai_text, 50)),
        );
        self.send_stage(events, &sid, Stage::Tts, StageStatus::Active, "Synthesizing speech...");

        // -- Cleanup and chunked synthesis ----------------------------------
        let speakable = clean_for_speech(&ai_text);
        let chunks =
            split_speech_chunks(&speakable, self.config.chunk_min_chars, self.config.chunk_max_chars);
        let total = chunks.len();
        let tts_start = Instant::now();

        let mut single_audio: Option<String> = None;
        let mut parts_sent = 0usize;
        let mut interrupted = false;
        let mut synth_failed = false;

        for (index, chunk_text) in chunks.iter().enumerate() {
            let synth = tokio::select! {
                _ = token.cancelled() => {
                    interrupted = true;
                    break;
                }
                result = tokio::time::timeout(
                    Duration::from_millis(self.config.tts_timeout_ms),
                    self.tts.synthesize(chunk_text, &settings.voice, settings.speed, &settings.language),
                ) => result,
            };

            let clip = match synth {
                Ok(Ok(clip)) => clip,
                Ok(Err(e)) => {
                    warn!("session {}: synthesis failed: {}", sid, e);
                    synth_failed = true;
                    break;
                }
                Err(_) => {
                    warn!("session {}: synthesis timed out", sid);
                    synth_failed = true;
                    break;
                }
            };

            if total == 1 {
                single_audio = Some(clip.audio_b64);
            } else {
                let is_final = index + 1 == total;
                let timing = is_final.then(|| {
                    self.build_timing(stt_duration, llm_duration, tts_start.elapsed())
                });
                let _ = events.send(ServerEvent::AudioChunk {
                    session_id: sid.clone(),
                    index,
                    total,
                    text: if index == 0 { ai_text.clone() } else { String::new() },
                    audio: clip.audio_b64,
                    is_final,
                    timing,
                });
                parts_sent += 1;
            }
        }

        let tts_duration = tts_start.elapsed();
        let timing = self.build_timing(stt_duration, llm_duration, tts_duration);
        // A cancelled synthesis is a normal outcome, not a quality signal.
        if !interrupted {
            self.quality
                .record(ServiceKind::Tts, tts_duration, !synth_failed && !chunks.is_empty());
            if synth_failed {
                self.maybe_spawn_failover(ServiceKind::Tts);
            }
        }

        // -- Emit whatever the synthesis stage owes the caller ---------------
        if interrupted {
            // Commit the partial assistant turn; the interrupt manager has
            // already confirmed the barge-in to the client.
            self.commit_assistant_turn(session, &ai_text, llm_duration + tts_duration, true);
            self.send_stage(events, &sid, Stage::Tts, StageStatus::Error, "Interrupted");
            return TurnOutcome::Interrupted;
        }

        if total <= 1 {
            if single_audio.is_none() && synth_failed {
                self.send_stage(events, &sid, Stage::Tts, StageStatus::Error, "Synthesis failed");
            } else {
                self.send_stage(events, &sid, Stage::Tts, StageStatus::Completed, "Audio ready");
            }
            // Text-only fallback when synthesis produced nothing.
            let _ = events.send(ServerEvent::AiResponse {
                session_id: sid.clone(),
                text: ai_text.clone(),
                audio: single_audio,
                timing: timing.clone(),
            });
        } else if synth_failed {
            // Close the chunk stream so the client stops waiting.
            let _ = events.send(ServerEvent::AudioChunk {
                session_id: sid.clone(),
                index: parts_sent,
                total,
                text: String::new(),
                audio: String::new(),
                is_final: true,
                timing: Some(timing.clone()),
            });
            self.send_stage(events, &sid, Stage::Tts, StageStatus::Error, "Synthesis incomplete");
        } else {
            self.send_stage(events, &sid, Stage::Tts, StageStatus::Completed, "Audio ready");
        }

        self.commit_assistant_turn(session, &ai_text, llm_duration + tts_duration, false);
        info!(
            "session {}: turn complete (stt {:.2}s, llm {:.2}s, tts {:.2}s)",
            sid, timing.stt, timing.llm, timing.tts
        );
        TurnOutcome::Responded
    }

    /// Primary model attempt, then one faster-fallback retry, then a
    /// templated apology. Always yields text unless interrupted.
    async fn call_model_with_fallback(
        &self,
        context: Vec<ChatMessage>,
        reduced_context: Vec<ChatMessage>,
        token: &CancellationToken,
        sid: &str,
    ) -> ModelOutcome {
        let model = self.quality.preferred_instance(ServiceKind::Llm);
        let request = CompletionRequest {
            model: model.clone(),
            messages: context,
            max_tokens: self.config.max_tokens,
        };

        let attempt_start = Instant::now();
        let primary = tokio::select! {
            _ = token.cancelled() => return ModelOutcome::Interrupted,
            result = tokio::time::timeout(
                Duration::from_millis(self.config.llm_timeout_ms),
                self.llm.complete(request),
            ) => result,
        };
        let primary_duration = attempt_start.elapsed();

        match primary {
            Ok(Ok(completion)) if !completion.text.trim().is_empty() => {
                self.quality.record(ServiceKind::Llm, primary_duration, true);
                return ModelOutcome::Text(completion.text);
            }
            Ok(Ok(_)) => {
                warn!("session {}: model {} returned empty text", sid, model);
                self.quality.record(ServiceKind::Llm, primary_duration, false);
            }
            Ok(Err(e)) => {
                warn!("session {}: model {} failed: {}", sid, model, e);
                self.quality.record(ServiceKind::Llm, primary_duration, false);
            }
            Err(_) => {
                warn!(
                    "session {}: model {} timed out after {:.1}s, trying fallback",
                    sid,
                    model,
                    primary_duration.as_secs_f64()
                );
                self.quality.record(ServiceKind::Llm, primary_duration, false);
            }
        }

        // Health may have crossed a floor; pick a new instance for future
        // turns without blocking this one.
        self.maybe_spawn_failover(ServiceKind::Llm);

        let fallback_request = CompletionRequest {
            model: self.fallback_model.clone(),
            messages: reduced_context,
            max_tokens: self.config.max_tokens,
        };
        let fallback_start = Instant::now();
        let fallback = tokio::select! {
            _ = token.cancelled() => return ModelOutcome::Interrupted,
            result = tokio::time::timeout(
                Duration::from_millis(self.config.fallback_timeout_ms),
                self.llm.complete(fallback_request),
            ) => result,
        };
        let fallback_duration = fallback_start.elapsed();

        match fallback {
            Ok(Ok(completion)) if !completion.text.trim().is_empty() => {
                info!("session {}: fallback model {} succeeded", sid, self.fallback_model);
                self.quality.record(ServiceKind::Llm, fallback_duration, true);
                ModelOutcome::Text(completion.text)
            }
            _ => {
                self.quality.record(ServiceKind::Llm, fallback_duration, false);
                warn!("session {}: all model attempts failed, sending apology", sid);
                ModelOutcome::Text(pick_apology().to_string())
            }
        }
    }

    /// Bounded context: optional safety preamble, recent committed turns,
    /// then the current utterance.
    fn build_context(
        &self,
        session: &SessionHandle,
        user_text: &str,
        window: usize,
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        if session.settings().safety_mode {
            messages.push(ChatMessage::new("system", SAFETY_PREAMBLE));
        }
        for turn in session.recent_turns(window) {
            messages.push(ChatMessage::new(turn.role.as_str(), turn.content));
        }
        messages.push(ChatMessage::new("user", user_text));
        messages
    }

    fn commit_assistant_turn(
        &self,
        session: &Arc<SessionHandle>,
        text: &str,
        duration: Duration,
        interrupted: bool,
    ) {
        session.push_turn(Turn::new(
            Role::Assistant,
            text,
            duration.as_millis() as u64,
            interrupted,
        ));
        self.record_history(session, Speaker::Assistant, text, duration, interrupted);
    }

    fn record_history(
        &self,
        session: &Arc<SessionHandle>,
        speaker: Speaker,
        text: &str,
        duration: Duration,
        was_interrupted: bool,
    ) {
        if let Some(call_id) = session.call_id() {
            if let Err(e) = self.history.add_message(
                &call_id,
                speaker,
                text,
                duration.as_millis() as u64,
                was_interrupted,
            ) {
                warn!("session {}: history append failed: {}", session.id, e);
            }
        }
    }

    fn maybe_spawn_failover(&self, kind: ServiceKind) {
        if !self.quality.needs_failover(kind) {
            return;
        }
        let quality = Arc::clone(&self.quality);
        let probe = Arc::clone(&self.probe);
        tokio::spawn(async move {
            quality.fail_over(kind, probe.as_ref()).await;
        });
    }

    fn build_timing(&self, stt: Duration, llm: Duration, tts: Duration) -> TurnTiming {
        TurnTiming {
            stt: stt.as_secs_f64(),
            llm: llm.as_secs_f64(),
            tts: tts.as_secs_f64(),
            total: (stt + llm + tts).as_secs_f64(),
        }
    }

    fn send_stage(
        &self,
        events: &UnboundedSender<ServerEvent>,
        session_id: &str,
        stage: Stage,
        status: StageStatus,
        details: &str,
    ) {
        let _ = events.send(ServerEvent::ProcessStatus {
            session_id: session_id.to_string(),
            stage,
            status,
            details: details.to_string(),
        });
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    }
}
