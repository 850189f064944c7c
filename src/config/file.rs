//! TOML configuration file loading
//!
//! Supports `~/.config/voice-link/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoiceLinkConfigFile {
    /// Voice service connection
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Audio and voice options
    #[serde(default)]
    pub voice: VoiceFileConfig,
}

/// Server configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// WebSocket base URL (e.g. "ws://localhost:7860")
    pub url: Option<String>,

    /// HTTP API base URL, derived from `url` when absent
    pub api_url: Option<String>,

    /// API key sent as `x-api-key`
    pub api_key: Option<String>,
}

/// Voice processing configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Voice used for synthesized replies
    pub voice_id: Option<String>,

    /// Whether the configured voice is enabled
    pub elevenlabs: Option<bool>,

    /// Microphone sample rate in Hz
    pub capture_sample_rate: Option<u32>,

    /// Reply audio sample rate in Hz
    pub playback_sample_rate: Option<u32>,

    /// Upper bound on waiting reply segments
    pub max_queued_segments: Option<usize>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoiceLinkConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VoiceLinkConfigFile {
    config_file_path().map_or_else(VoiceLinkConfigFile::default, |path| {
        load_config_file_from(&path)
    })
}

/// Load a TOML config file from an explicit path
///
/// Returns `VoiceLinkConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file_from(path: &Path) -> VoiceLinkConfigFile {
    if !path.exists() {
        return VoiceLinkConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VoiceLinkConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VoiceLinkConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/voice-link/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voice-link").join("config.toml"))
}
