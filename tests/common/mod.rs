//! Shared test harness: scripted engines and a gateway on an ephemeral port.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use voicegate::audio::AudioFormat;
use voicegate::config::schema::{GatewayConfig, InterruptConfig, SessionConfig};
use voicegate::engines::{
    AudioClip, ChatMessage, Completion, CompletionRequest, LanguageModel, SpeechSynthesis,
    SpeechToText, Transcript,
};
use voicegate::gateway::Gateway;
use voicegate::history::MemoryCallHistory;
use voicegate::pool::{ConnectionPoolManager, ServiceKind};
use voicegate::quality::AvailabilityProbe;

// ---------------------------------------------------------------------------
// Scripted engines
// ---------------------------------------------------------------------------

/// Recognition fake that replays a scripted list of transcripts.
pub struct ScriptedStt {
    replies: Mutex<Vec<String>>,
}

impl ScriptedStt {
    pub fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
        })
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    async fn transcribe(
        &self,
        _audio: &[u8],
        _format: AudioFormat,
        _language: &str,
    ) -> anyhow::Result<Transcript> {
        let mut replies = self.replies.lock().unwrap();
        let text = if replies.is_empty() {
            String::new()
        } else {
            replies.remove(0)
        };
        Ok(Transcript { text })
    }
}

/// Model fake with configurable failures and latency.
pub struct ScriptedLlm {
    pub calls: AtomicUsize,
    fail_first: AtomicUsize,
    delay: Duration,
    pub seen_models: Mutex<Vec<String>>,
    pub seen_contexts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedLlm {
    pub fn healthy() -> Arc<Self> {
        Self::build(0, Duration::ZERO)
    }

    pub fn failing_first(n: usize) -> Arc<Self> {
        Self::build(n, Duration::ZERO)
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Self::build(0, delay)
    }

    fn build(fail_first: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(fail_first),
            delay,
            seen_models: Mutex::new(Vec::new()),
            seen_contexts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_models.lock().unwrap().push(request.model.clone());
        self.seen_contexts.lock().unwrap().push(request.messages.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("model unavailable");
        }
        Ok(Completion {
            text: format!("[{}] Happy to help with that.", request.model),
        })
    }
}

/// Synthesis fake with configurable per-call latency.
pub struct ScriptedTts {
    delay: Duration,
    pub calls: AtomicUsize,
}

impl ScriptedTts {
    pub fn instant() -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SpeechSynthesis for ScriptedTts {
    async fn synthesize(
        &self,
        text: &str,
        _voice: &str,
        _speed: f64,
        _language: &str,
    ) -> anyhow::Result<AudioClip> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(AudioClip {
            audio_b64: format!("c3ludGg6{}", text.len()),
        })
    }
}

pub struct AlwaysUpProbe;

#[async_trait]
impl AvailabilityProbe for AlwaysUpProbe {
    async fn probe(&self, _kind: ServiceKind, _instance: &str) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Gateway builder
// ---------------------------------------------------------------------------

/// Config tuned for fast tests: tiny buffers, short timeouts, no throttle.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.server.port = 0;
    config.server.poll_interval_ms = 20;
    config.session = SessionConfig {
        min_audio_bytes: 10,
        max_buffered_chunks: 10,
        min_turn_interval_ms: 0,
        context_turns: 6,
        fallback_context_turns: 3,
    };
    config.interrupt = InterruptConfig {
        auto_interrupt_delay_ms: 100,
        min_speech_duration_ms: 20,
        stop_phrases: vec!["stop stop".to_string()],
    };
    config.pipeline.llm_timeout_ms = 200;
    config.pipeline.fallback_timeout_ms = 200;
    config.pipeline.stt_timeout_ms = 200;
    config.pipeline.tts_timeout_ms = 500;
    config.pipeline.heartbeat_interval_ms = 30;
    config
}

pub struct TestGateway {
    pub gateway: Arc<Gateway>,
    pub history: Arc<MemoryCallHistory>,
}

pub fn build_gateway(
    config: GatewayConfig,
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn SpeechSynthesis>,
) -> TestGateway {
    let history = Arc::new(MemoryCallHistory::new());
    let pools = Arc::new(ConnectionPoolManager::new(&config.pools));
    let gateway = Gateway::with_engines(
        config,
        history.clone(),
        pools,
        stt,
        llm,
        tts,
        Arc::new(AlwaysUpProbe),
    );
    TestGateway { gateway, history }
}

/// A flush-ready audio payload for the test session config.
pub fn audio_payload(len: usize) -> Vec<u8> {
    vec![7u8; len]
}
