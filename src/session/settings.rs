//! Per-session settings with defaults resolved once at creation.
//!
//! Clients send a partial, loosely-typed settings object in
//! `session_start`. It is resolved into this struct exactly once; nothing
//! downstream re-derives defaults ad hoc.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fully-resolved session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    /// ISO 639-1 language code for recognition and synthesis.
    #[serde(default = "default_language")]
    pub language: String,
    /// Preferred model name; the quality monitor may route elsewhere.
    #[serde(default = "default_model")]
    pub model: String,
    /// Synthesis speed multiplier.
    #[serde(default = "default_speed")]
    pub speed: f64,
    /// Adds the safety preamble to the model context and filters topics.
    #[serde(default)]
    pub safety_mode: bool,
    /// Synthesis voice name.
    #[serde(default = "default_voice")]
    pub voice: String,
}

fn default_language() -> String {
    "en".to_string()
}
fn default_model() -> String {
    "swift-mini".to_string()
}
fn default_speed() -> f64 {
    1.0
}
fn default_voice() -> String {
    "default".to_string()
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            language: default_language(),
            model: default_model(),
            speed: default_speed(),
            safety_mode: false,
            voice: default_voice(),
        }
    }
}

impl SessionSettings {
    /// Resolve a partial settings map into a full settings struct.
    ///
    /// Explicit `null`s are treated as absent so clients that send
    /// `{"voice": null}` still get the default voice.
    pub fn resolve(partial: &HashMap<String, Value>) -> SessionSettings {
        let cleaned: serde_json::Map<String, Value> = partial
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        serde_json::from_value(Value::Object(cleaned)).unwrap_or_default()
    }

    /// Merge a partial update into existing settings (`settings_update`).
    pub fn merge(&mut self, partial: &HashMap<String, Value>) {
        let mut current = match serde_json::to_value(&*self) {
            Ok(Value::Object(map)) => map,
            _ => return,
        };
        for (k, v) in partial {
            if !v.is_null() {
                current.insert(k.clone(), v.clone());
            }
        }
        if let Ok(updated) = serde_json::from_value(Value::Object(current)) {
            *self = updated;
        }
    }
}
