//! Audio container format triage.
//!
//! Browser clients usually send complete WebM containers per recording
//! segment, while native clients stream raw PCM. The two must never be
//! concatenated: a container chunk supersedes any raw fragments queued
//! before it (last-complete-container-wins).

use serde::{Deserialize, Serialize};

/// Magic bytes for a WebM/Matroska container (EBML header).
const WEBM_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Detected audio payload format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    Webm,
    Wav,
    Mp3,
    Raw,
}

impl AudioFormat {
    /// Inspect magic bytes and classify a chunk.
    pub fn detect(data: &[u8]) -> AudioFormat {
        if data.starts_with(&WEBM_MAGIC) {
            return AudioFormat::Webm;
        }
        if data.starts_with(b"RIFF") && data.len() >= 12 && &data[8..12] == b"WAVE" {
            return AudioFormat::Wav;
        }
        if data.starts_with(b"ID3") || data.starts_with(&[0xFF, 0xFB]) {
            return AudioFormat::Mp3;
        }
        AudioFormat::Raw
    }

    /// Whether this chunk is a complete self-describing container.
    pub fn is_container(self) -> bool {
        !matches!(self, AudioFormat::Raw)
    }

    /// Wire label used when handing audio to the recognition adapter.
    pub fn as_str(self) -> &'static str {
        match self {
            AudioFormat::Webm => "webm",
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Raw => "raw",
        }
    }
}

/// Resolve a flush-ready set of chunks into one payload.
///
/// If any chunk is a self-describing container, the newest container wins
/// and raw fragments around it are discarded. Otherwise raw fragments are
/// concatenated in arrival order.
pub fn resolve_chunks(chunks: Vec<Vec<u8>>) -> (Vec<u8>, AudioFormat) {
    let last_container = chunks
        .iter()
        .rev()
        .find(|c| AudioFormat::detect(c).is_container());

    if let Some(container) = last_container {
        let format = AudioFormat::detect(container);
        return (container.clone(), format);
    }

    let mut combined = Vec::with_capacity(chunks.iter().map(Vec::len).sum());
    for chunk in &chunks {
        combined.extend_from_slice(chunk);
    }
    (combined, AudioFormat::Raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn webm(extra: &[u8]) -> Vec<u8> {
        let mut v = WEBM_MAGIC.to_vec();
        v.extend_from_slice(extra);
        v
    }

    #[test]
    fn test_detect_webm() {
        assert_eq!(AudioFormat::detect(&webm(b"body")), AudioFormat::Webm);
    }

    #[test]
    fn test_detect_wav() {
        let mut v = b"RIFF".to_vec();
        v.extend_from_slice(&[0, 0, 0, 0]);
        v.extend_from_slice(b"WAVEdata");
        assert_eq!(AudioFormat::detect(&v), AudioFormat::Wav);
    }

    #[test]
    fn test_riff_without_wave_is_raw() {
        let mut v = b"RIFF".to_vec();
        v.extend_from_slice(&[0, 0, 0, 0]);
        v.extend_from_slice(b"AVI LIST");
        assert_eq!(AudioFormat::detect(&v), AudioFormat::Raw);
    }

    #[test]
    fn test_detect_mp3_id3() {
        assert_eq!(AudioFormat::detect(b"ID3\x04tag"), AudioFormat::Mp3);
    }

    #[test]
    fn test_detect_mp3_frame_sync() {
        assert_eq!(AudioFormat::detect(&[0xFF, 0xFB, 0x90, 0x00]), AudioFormat::Mp3);
    }

    #[test]
    fn test_detect_raw() {
        assert_eq!(AudioFormat::detect(&[0u8; 64]), AudioFormat::Raw);
        assert_eq!(AudioFormat::detect(&[]), AudioFormat::Raw);
    }

    #[test]
    fn test_container_flags() {
        assert!(AudioFormat::Webm.is_container());
        assert!(AudioFormat::Wav.is_container());
        assert!(!AudioFormat::Raw.is_container());
    }

    #[test]
    fn test_resolve_raw_chunks_concatenates() {
        let (data, format) = resolve_chunks(vec![vec![1, 2], vec![3], vec![4, 5]]);
        assert_eq!(data, vec![1, 2, 3, 4, 5]);
        assert_eq!(format, AudioFormat::Raw);
    }

    #[test]
    fn test_resolve_container_wins_over_raw() {
        let container = webm(b"segment");
        let (data, format) =
            resolve_chunks(vec![vec![1, 2, 3], container.clone(), vec![9, 9]]);
        assert_eq!(data, container);
        assert_eq!(format, AudioFormat::Webm);
    }

    #[test]
    fn test_resolve_latest_container_wins() {
        let first = webm(b"one");
        let second = webm(b"two");
        let (data, format) = resolve_chunks(vec![first, vec![0], second.clone()]);
        assert_eq!(data, second);
        assert_eq!(format, AudioFormat::Webm);
    }
}
