//! HTTP-backed engine adapters.
//!
//! Each adapter routes through the shared connection pool for its service
//! category, so timeout/retry policy and usage statistics stay in one
//! place. The language model speaks the OpenAI-compatible chat API; the
//! recognition and synthesis services use small JSON endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::json;
use tracing::warn;

use crate::audio::AudioFormat;
use crate::engines::{
    AudioClip, Completion, CompletionRequest, LanguageModel, SpeechSynthesis, SpeechToText,
    Transcript,
};
use crate::errors::DownstreamError;
use crate::pool::{ConnectionPoolManager, ServiceKind};
use crate::quality::AvailabilityProbe;

fn base_url(url: &str) -> String {
    url.trim_end_matches('/').trim_end_matches("/v1").trim_end_matches('/').to_string()
}

// ---------------------------------------------------------------------------
// Speech-to-text
// ---------------------------------------------------------------------------

pub struct HttpSpeechToText {
    pool: Arc<ConnectionPoolManager>,
    base_url: String,
}

impl HttpSpeechToText {
    pub fn new(pool: Arc<ConnectionPoolManager>, url: &str) -> Self {
        Self {
            pool,
            base_url: base_url(url),
        }
    }
}

#[async_trait]
impl SpeechToText for HttpSpeechToText {
    async fn transcribe(
        &self,
        audio: &[u8],
        format: AudioFormat,
        language: &str,
    ) -> anyhow::Result<Transcript> {
        let body = json!({
            "audio": base64::engine::general_purpose::STANDARD.encode(audio),
            "format": format.as_str(),
            "language": language,
        });
        let url = format!("{}/api/transcribe", self.base_url);
        let response = self.pool.post_json(ServiceKind::Stt, &url, &body).await?;

        let text = response
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DownstreamError::InvalidResponse("missing `text` field".into()))?;
        Ok(Transcript {
            text: text.trim().to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Language model
// ---------------------------------------------------------------------------

pub struct HttpLanguageModel {
    pool: Arc<ConnectionPoolManager>,
    base_url: String,
}

impl HttpLanguageModel {
    pub fn new(pool: Arc<ConnectionPoolManager>, url: &str) -> Self {
        Self {
            pool,
            base_url: base_url(url),
        }
    }
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<Completion> {
        let body = json!({
            "model": request.model,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
            "stream": false,
        });
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self.pool.post_json(ServiceKind::Llm, &url, &body).await?;

        let text = response
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                DownstreamError::InvalidResponse("missing `choices[0].message.content`".into())
            })?;
        Ok(Completion {
            text: text.trim().to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Speech synthesis
// ---------------------------------------------------------------------------

pub struct HttpSpeechSynthesis {
    pool: Arc<ConnectionPoolManager>,
    base_url: String,
}

impl HttpSpeechSynthesis {
    pub fn new(pool: Arc<ConnectionPoolManager>, url: &str) -> Self {
        Self {
            pool,
            base_url: base_url(url),
        }
    }
}

#[async_trait]
impl SpeechSynthesis for HttpSpeechSynthesis {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        speed: f64,
        language: &str,
    ) -> anyhow::Result<AudioClip> {
        let body = json!({
            "text": text,
            "voice": voice,
            "speed": speed,
            "language": language,
        });
        let url = format!("{}/api/synthesize", self.base_url);
        let response = self.pool.post_json(ServiceKind::Tts, &url, &body).await?;

        let audio = response
            .get("audio")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DownstreamError::InvalidResponse("missing `audio` field".into()))?;
        Ok(AudioClip {
            audio_b64: audio.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Availability probe
// ---------------------------------------------------------------------------

/// Probes fallback candidates before the quality monitor commits to one.
///
/// Models are checked with a minimal one-token completion; recognition
/// and synthesis services expose a `/health` endpoint.
pub struct HttpAvailabilityProbe {
    pool: Arc<ConnectionPoolManager>,
    stt_url: String,
    llm_url: String,
    tts_url: String,
}

impl HttpAvailabilityProbe {
    pub fn new(pool: Arc<ConnectionPoolManager>, stt_url: &str, llm_url: &str, tts_url: &str) -> Self {
        Self {
            pool,
            stt_url: base_url(stt_url),
            llm_url: base_url(llm_url),
            tts_url: base_url(tts_url),
        }
    }
}

#[async_trait]
impl AvailabilityProbe for HttpAvailabilityProbe {
    async fn probe(&self, kind: ServiceKind, instance: &str) -> bool {
        let result = match kind {
            ServiceKind::Llm => {
                let body = json!({
                    "model": instance,
                    "messages": [{"role": "user", "content": "ping"}],
                    "max_tokens": 1,
                });
                let url = format!("{}/v1/chat/completions", self.llm_url);
                self.pool.post_json(ServiceKind::Llm, &url, &body).await
            }
            ServiceKind::Stt => {
                let url = format!("{}/health", self.stt_url);
                self.pool.get_json(ServiceKind::Stt, &url).await
            }
            ServiceKind::Tts => {
                let url = format!("{}/health", self.tts_url);
                self.pool.get_json(ServiceKind::Tts, &url).await
            }
            ServiceKind::External => return true,
        };

        match result {
            Ok(_) => true,
            Err(e) => {
                warn!("availability probe for {} `{}` failed: {}", kind.as_str(), instance, e);
                false
            }
        }
    }
}
