//! Configuration loading and saving utilities.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::config::schema::GatewayConfig;

/// Get the default configuration file path (`~/.voicegate/config.json`).
pub fn get_config_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".voicegate").join("config.json")
}

/// Get the default data directory (`~/.voicegate`).
pub fn get_data_dir() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".voicegate")
}

/// Load configuration from a file, or return a default [`GatewayConfig`] if
/// the file does not exist or cannot be parsed.
///
/// If `config_path` is `None`, the default path is used.
pub fn load_config(config_path: Option<&Path>) -> GatewayConfig {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => get_config_path(),
    };

    if path.exists() {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<GatewayConfig>(&contents) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        "Failed to parse config from {}: {}. Using default configuration.",
                        path.display(),
                        e
                    );
                }
            },
            Err(e) => {
                warn!(
                    "Failed to read config from {}: {}. Using default configuration.",
                    path.display(),
                    e
                );
            }
        }
    }

    GatewayConfig::default()
}

/// Save configuration to a JSON file.
///
/// If `config_path` is `None`, the default path is used. Parent directories
/// are created if they don't exist.
pub fn save_config(config: &GatewayConfig, config_path: Option<&Path>) {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => get_config_path(),
    };

    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    match serde_json::to_string_pretty(config) {
        Ok(contents) => {
            if let Err(e) = fs::write(&path, contents) {
                warn!("Failed to write config to {}: {}", path.display(), e);
            }
        }
        Err(e) => warn!("Failed to serialize config: {}", e),
    }
}
