//! Adapter interfaces for the downstream speech and language engines.
//!
//! The gateway never talks to an engine directly; every call goes through
//! these traits so the actual engines stay external collaborators. HTTP
//! implementations live in [`http`]; the test suites use scripted fakes.

pub mod http;

use async_trait::async_trait;

use crate::audio::AudioFormat;

/// Result of a recognition call.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
}

/// One message in a model conversation context.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// A model completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
}

/// Result of a model completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
}

/// Result of a synthesis call; audio stays base64 end-to-end.
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub audio_b64: String,
}

/// Speech recognition adapter.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(
        &self,
        audio: &[u8],
        format: AudioFormat,
        language: &str,
    ) -> anyhow::Result<Transcript>;
}

/// Language model adapter.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<Completion>;
}

/// Speech synthesis adapter.
#[async_trait]
pub trait SpeechSynthesis: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        speed: f64,
        language: &str,
    ) -> anyhow::Result<AudioClip>;
}
