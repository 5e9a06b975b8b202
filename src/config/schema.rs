//! Configuration schema for voicegate.
//!
//! All structs use `#[serde(rename_all = "camelCase")]` so that the JSON
//! config file can use camelCase keys while Rust code uses snake_case
//! fields. Every tuning constant in the pipeline lives here as a defaulted
//! field; none of them are re-derived after load.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// WebSocket gateway listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Receive-poll interval so keepalive pings can fire while idle.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Minimum spacing between idle keepalive pings.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8780
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_ping_interval_secs() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            poll_interval_ms: default_poll_interval_ms(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Session / buffering
// ---------------------------------------------------------------------------

/// Per-session buffering and turn-taking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Minimum buffered bytes; a flush is ready at 2x this value.
    #[serde(default = "default_min_audio_bytes")]
    pub min_audio_bytes: usize,
    /// Maximum retained chunks before the oldest is dropped.
    #[serde(default = "default_max_buffered_chunks")]
    pub max_buffered_chunks: usize,
    /// Minimum interval between turns for one session.
    #[serde(default = "default_min_turn_interval_ms")]
    pub min_turn_interval_ms: u64,
    /// Turns of history included in the model context.
    #[serde(default = "default_context_turns")]
    pub context_turns: usize,
    /// Reduced context window used on the fallback-model retry.
    #[serde(default = "default_fallback_context_turns")]
    pub fallback_context_turns: usize,
}

fn default_min_audio_bytes() -> usize {
    1000
}
fn default_max_buffered_chunks() -> usize {
    10
}
fn default_min_turn_interval_ms() -> u64 {
    500
}
fn default_context_turns() -> usize {
    6
}
fn default_fallback_context_turns() -> usize {
    3
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_audio_bytes: default_min_audio_bytes(),
            max_buffered_chunks: default_max_buffered_chunks(),
            min_turn_interval_ms: default_min_turn_interval_ms(),
            context_turns: default_context_turns(),
            fallback_context_turns: default_fallback_context_turns(),
        }
    }
}

// ---------------------------------------------------------------------------
// Interruption
// ---------------------------------------------------------------------------

/// Barge-in detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptConfig {
    /// Continuous-speech duration that auto-interrupts a responding AI.
    #[serde(default = "default_auto_interrupt_delay_ms")]
    pub auto_interrupt_delay_ms: u64,
    /// Speech shorter than this is treated as noise.
    #[serde(default = "default_min_speech_duration_ms")]
    pub min_speech_duration_ms: u64,
    /// Recognized phrases that bypass the timer and interrupt immediately.
    #[serde(default = "default_stop_phrases")]
    pub stop_phrases: Vec<String>,
}

fn default_auto_interrupt_delay_ms() -> u64 {
    3000
}
fn default_min_speech_duration_ms() -> u64 {
    500
}
fn default_stop_phrases() -> Vec<String> {
    vec!["stop stop".to_string(), "okay stop".to_string()]
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            auto_interrupt_delay_ms: default_auto_interrupt_delay_ms(),
            min_speech_duration_ms: default_min_speech_duration_ms(),
            stop_phrases: default_stop_phrases(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Per-turn pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Consecutive empty recognitions that flush accumulated text.
    #[serde(default = "default_silence_flush_threshold")]
    pub silence_flush_threshold: u32,
    /// Characters an utterance needs before the length heuristics apply.
    #[serde(default = "default_min_utterance_chars")]
    pub min_utterance_chars: usize,
    /// Word count that marks an utterance complete on its own.
    #[serde(default = "default_min_utterance_words")]
    pub min_utterance_words: usize,
    /// Lower bound for synthesis chunk size.
    #[serde(default = "default_chunk_min_chars")]
    pub chunk_min_chars: usize,
    /// Upper bound for synthesis chunk size.
    #[serde(default = "default_chunk_max_chars")]
    pub chunk_max_chars: usize,
    /// Heartbeat cadence while a stage is in flight.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Primary model timeout.
    #[serde(default = "default_llm_timeout_ms")]
    pub llm_timeout_ms: u64,
    /// Fallback model timeout (shorter).
    #[serde(default = "default_fallback_timeout_ms")]
    pub fallback_timeout_ms: u64,
    /// STT stage timeout.
    #[serde(default = "default_stt_timeout_ms")]
    pub stt_timeout_ms: u64,
    /// TTS stage timeout.
    #[serde(default = "default_tts_timeout_ms")]
    pub tts_timeout_ms: u64,
    /// Token cap for model completions.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_silence_flush_threshold() -> u32 {
    2
}
fn default_min_utterance_chars() -> usize {
    10
}
fn default_min_utterance_words() -> usize {
    5
}
fn default_chunk_min_chars() -> usize {
    80
}
fn default_chunk_max_chars() -> usize {
    120
}
fn default_heartbeat_interval_ms() -> u64 {
    2000
}
fn default_llm_timeout_ms() -> u64 {
    30_000
}
fn default_fallback_timeout_ms() -> u64 {
    15_000
}
fn default_stt_timeout_ms() -> u64 {
    15_000
}
fn default_tts_timeout_ms() -> u64 {
    20_000
}
fn default_max_tokens() -> u32 {
    150
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            silence_flush_threshold: default_silence_flush_threshold(),
            min_utterance_chars: default_min_utterance_chars(),
            min_utterance_words: default_min_utterance_words(),
            chunk_min_chars: default_chunk_min_chars(),
            chunk_max_chars: default_chunk_max_chars(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            llm_timeout_ms: default_llm_timeout_ms(),
            fallback_timeout_ms: default_fallback_timeout_ms(),
            stt_timeout_ms: default_stt_timeout_ms(),
            tts_timeout_ms: default_tts_timeout_ms(),
            max_tokens: default_max_tokens(),
        }
    }
}

// ---------------------------------------------------------------------------
// Quality / fallback
// ---------------------------------------------------------------------------

/// Quality band thresholds for one service, in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandThresholds {
    pub excellent: f64,
    pub good: f64,
    pub acceptable: f64,
    pub poor: f64,
}

/// Ordered fallback chain for one service category.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackChain {
    pub primary: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
    pub emergency: String,
}

/// Quality monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityConfig {
    #[serde(default = "default_stt_thresholds")]
    pub stt_thresholds: BandThresholds,
    #[serde(default = "default_llm_thresholds")]
    pub llm_thresholds: BandThresholds,
    #[serde(default = "default_tts_thresholds")]
    pub tts_thresholds: BandThresholds,
    /// Samples retained per service in the rolling window.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Age bound for samples considered when deriving health.
    #[serde(default = "default_recent_window_secs")]
    pub recent_window_secs: u64,
    #[serde(default = "default_stt_chain")]
    pub stt_chain: FallbackChain,
    #[serde(default = "default_llm_chain")]
    pub llm_chain: FallbackChain,
    #[serde(default = "default_tts_chain")]
    pub tts_chain: FallbackChain,
    /// Mean llm latency (seconds) above which a faster model is recommended.
    #[serde(default = "default_slow_llm_secs")]
    pub slow_llm_secs: f64,
}

fn default_stt_thresholds() -> BandThresholds {
    BandThresholds { excellent: 1.0, good: 2.0, acceptable: 3.0, poor: 5.0 }
}
fn default_llm_thresholds() -> BandThresholds {
    BandThresholds { excellent: 1.0, good: 2.0, acceptable: 4.0, poor: 8.0 }
}
fn default_tts_thresholds() -> BandThresholds {
    BandThresholds { excellent: 1.5, good: 2.5, acceptable: 4.0, poor: 6.0 }
}
fn default_window_size() -> usize {
    100
}
fn default_recent_window_secs() -> u64 {
    300
}
fn default_stt_chain() -> FallbackChain {
    FallbackChain {
        primary: "whisper-local".to_string(),
        fallbacks: vec!["whisper-remote".to_string()],
        emergency: "silence-detect".to_string(),
    }
}
fn default_llm_chain() -> FallbackChain {
    FallbackChain {
        primary: "swift-mini".to_string(),
        fallbacks: vec!["swift-nano".to_string(), "compact-1b".to_string()],
        emergency: "canned-responses".to_string(),
    }
}
fn default_tts_chain() -> FallbackChain {
    FallbackChain {
        primary: "neural-tts".to_string(),
        fallbacks: vec!["system-tts".to_string()],
        emergency: "text-only".to_string(),
    }
}
fn default_slow_llm_secs() -> f64 {
    3.0
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            stt_thresholds: default_stt_thresholds(),
            llm_thresholds: default_llm_thresholds(),
            tts_thresholds: default_tts_thresholds(),
            window_size: default_window_size(),
            recent_window_secs: default_recent_window_secs(),
            stt_chain: default_stt_chain(),
            llm_chain: default_llm_chain(),
            tts_chain: default_tts_chain(),
            slow_llm_secs: default_slow_llm_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection pools
// ---------------------------------------------------------------------------

/// Configuration for one outbound connection pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    pub max_connections: usize,
    pub keepalive_timeout_secs: u64,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub retry_attempts: usize,
    pub retry_min_delay_ms: u64,
}

/// Pool configurations per service category.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolsConfig {
    #[serde(default = "default_stt_pool")]
    pub stt: PoolConfig,
    #[serde(default = "default_llm_pool")]
    pub llm: PoolConfig,
    #[serde(default = "default_tts_pool")]
    pub tts: PoolConfig,
    #[serde(default = "default_external_pool")]
    pub external: PoolConfig,
}

fn default_stt_pool() -> PoolConfig {
    PoolConfig {
        max_connections: 10,
        keepalive_timeout_secs: 30,
        connect_timeout_ms: 10_000,
        read_timeout_ms: 30_000,
        retry_attempts: 3,
        retry_min_delay_ms: 1000,
    }
}
fn default_llm_pool() -> PoolConfig {
    PoolConfig {
        max_connections: 15,
        keepalive_timeout_secs: 60,
        connect_timeout_ms: 5000,
        read_timeout_ms: 60_000,
        retry_attempts: 2,
        retry_min_delay_ms: 500,
    }
}
fn default_tts_pool() -> PoolConfig {
    PoolConfig {
        max_connections: 8,
        keepalive_timeout_secs: 30,
        connect_timeout_ms: 10_000,
        read_timeout_ms: 45_000,
        retry_attempts: 2,
        retry_min_delay_ms: 1000,
    }
}
fn default_external_pool() -> PoolConfig {
    PoolConfig {
        max_connections: 5,
        keepalive_timeout_secs: 30,
        connect_timeout_ms: 15_000,
        read_timeout_ms: 30_000,
        retry_attempts: 3,
        retry_min_delay_ms: 2000,
    }
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            stt: default_stt_pool(),
            llm: default_llm_pool(),
            tts: default_tts_pool(),
            external: default_external_pool(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine endpoints / history
// ---------------------------------------------------------------------------

/// Downstream engine endpoint URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnginesConfig {
    #[serde(default = "default_stt_url")]
    pub stt_url: String,
    #[serde(default = "default_llm_url")]
    pub llm_url: String,
    #[serde(default = "default_tts_url")]
    pub tts_url: String,
}

fn default_stt_url() -> String {
    "http://localhost:8701".to_string()
}
fn default_llm_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_tts_url() -> String {
    "http://localhost:8702".to_string()
}

impl Default for EnginesConfig {
    fn default() -> Self {
        Self {
            stt_url: default_stt_url(),
            llm_url: default_llm_url(),
            tts_url: default_tts_url(),
        }
    }
}

/// Call-history persistence configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryConfig {
    /// SQLite database path. `None` keeps history in memory only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

/// Root configuration for the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub interrupt: InterruptConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub pools: PoolsConfig,
    #[serde(default)]
    pub engines: EnginesConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}
