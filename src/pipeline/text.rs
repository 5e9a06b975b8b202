//! Utterance assembly, speech cleanup, and synthesis chunking.

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use regex::Regex;

use crate::config::schema::PipelineConfig;

// ---------------------------------------------------------------------------
// Utterance completeness
// ---------------------------------------------------------------------------

const TERMINAL_PUNCTUATION: &[char] = &['.', '!', '?', '。', '！', '？'];

/// Decide whether accumulated recognition text forms a complete utterance.
///
/// Complete when it ends in terminal punctuation, reaches the word-count
/// threshold on its own, or is long enough while containing a sentence
/// ending somewhere. Anything else waits for more input.
pub fn is_utterance_complete(text: &str, config: &PipelineConfig) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }

    let ends_terminal = trimmed
        .chars()
        .last()
        .map(|c| TERMINAL_PUNCTUATION.contains(&c))
        .unwrap_or(false);
    if ends_terminal {
        return true;
    }

    let words = trimmed.split_whitespace().count();
    if words >= config.min_utterance_words {
        return true;
    }

    let contains_terminal = trimmed.chars().any(|c| TERMINAL_PUNCTUATION.contains(&c));
    trimmed.chars().count() >= config.min_utterance_chars && contains_terminal
}

// ---------------------------------------------------------------------------
// Speech cleanup
// ---------------------------------------------------------------------------

static BOLD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*(.*?)\*\*").unwrap());
static ITALIC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*(.*?)\*").unwrap());
static CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`(.*?)`").unwrap());
static NON_SPEAKABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[^\w\s.,!?'"\-:;()。！？、，]"#).unwrap());
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Strip structural markup and non-speakable symbols before synthesis.
///
/// Markdown markers lose their delimiters but keep their content; emoji
/// and other symbols become spaces; runs of whitespace collapse.
pub fn clean_for_speech(text: &str) -> String {
    let text = BOLD_RE.replace_all(text, "$1");
    let text = ITALIC_RE.replace_all(&text, "$1");
    let text = CODE_RE.replace_all(&text, "$1");
    let text = NON_SPEAKABLE_RE.replace_all(&text, " ");
    WHITESPACE_RE.replace_all(&text, " ").trim().to_string()
}

// ---------------------------------------------------------------------------
// Synthesis chunking
// ---------------------------------------------------------------------------

/// Split cleaned text into synthesis chunks at sentence boundaries.
///
/// Sentences are packed greedily until a chunk reaches `min_chars`; a
/// single sentence longer than `max_chars` is split at word boundaries.
/// Chunk order matches text order.
pub fn split_speech_chunks(text: &str, min_chars: usize, max_chars: usize) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let sentences = split_sentences(trimmed);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for sentence in sentences {
        for piece in split_long_sentence(&sentence, max_chars) {
            if !current.is_empty() && current.chars().count() + 1 + piece.chars().count() > max_chars
            {
                chunks.push(std::mem::take(&mut current));
            }
            if current.is_empty() {
                current = piece;
            } else {
                current.push(' ');
                current.push_str(&piece);
            }
            if current.chars().count() >= min_chars {
                chunks.push(std::mem::take(&mut current));
            }
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Split text into sentences, keeping the terminal punctuation attached.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if TERMINAL_PUNCTUATION.contains(&c) {
            let s = current.trim().to_string();
            if !s.is_empty() {
                sentences.push(s);
            }
            current.clear();
        }
    }
    let tail = current.trim().to_string();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Break one over-long sentence at word boundaries.
fn split_long_sentence(sentence: &str, max_chars: usize) -> Vec<String> {
    if sentence.chars().count() <= max_chars {
        return vec![sentence.to_string()];
    }
    let mut pieces = Vec::new();
    let mut current = String::new();
    for word in sentence.split_whitespace() {
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > max_chars {
            pieces.push(std::mem::take(&mut current));
        }
        if current.is_empty() {
            current = word.to_string();
        } else {
            current.push(' ');
            current.push_str(word);
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

// ---------------------------------------------------------------------------
// Templated fallback utterances
// ---------------------------------------------------------------------------

/// Apologies used when both model attempts fail. The turn still produces
/// an outcome.
const APOLOGY_RESPONSES: &[&str] = &[
    "I'm having trouble understanding right now. Could you repeat that?",
    "Sorry, I didn't catch that. What did you say?",
    "Let me try again. What would you like to talk about?",
    "I apologize for the confusion. How can I help you?",
];

/// Canned replies used by the emergency handler when every model
/// instance is down.
const CANNED_RESPONSES: &[&str] = &[
    "I hear you. Could you tell me more about that?",
    "That's interesting. What else would you like to discuss?",
    "I understand. How can I help you with that?",
    "Thanks for sharing. What's on your mind?",
    "I see. Could you elaborate on that?",
];

pub fn pick_apology() -> &'static str {
    APOLOGY_RESPONSES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(APOLOGY_RESPONSES[0])
}

pub fn pick_canned_response() -> &'static str {
    CANNED_RESPONSES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(CANNED_RESPONSES[0])
}
