//! Configuration management for the voice link

pub mod file;

use url::Url;

use self::file::VoiceLinkConfigFile;
use crate::voice::DEFAULT_MAX_QUEUED_SEGMENTS;
use crate::{Error, Result};

/// Default voice service address
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:7860";

/// Default voice for synthesized replies
pub const DEFAULT_VOICE_ID: &str = "NOpBlnGInO9m6vDvFkFC";

/// Sample rate of PCM16 audio on the wire
pub const DEFAULT_SAMPLE_RATE: u32 = 24000;

/// Voice link configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Voice service connection
    pub server: ServerConfig,

    /// Voice processing configuration
    pub voice: VoiceConfig,
}

/// Voice service connection settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket base URL
    pub url: String,

    /// HTTP API base URL
    pub api_url: String,

    /// API key sent as `x-api-key` (from `VOICE_LINK_API_KEY` env)
    pub api_key: Option<String>,
}

/// Voice processing configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Voice identifier sent in the handshake
    pub voice_id: String,

    /// Whether the configured voice is enabled
    pub elevenlabs: bool,

    /// Microphone sample rate in Hz
    pub capture_sample_rate: u32,

    /// Reply audio sample rate in Hz
    pub playback_sample_rate: u32,

    /// Upper bound on waiting reply segments
    pub max_queued_segments: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SERVER_URL.to_string(),
            api_url: "http://localhost:7860".to_string(),
            api_key: None,
        }
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice_id: DEFAULT_VOICE_ID.to_string(),
            elevenlabs: true,
            capture_sample_rate: DEFAULT_SAMPLE_RATE,
            playback_sample_rate: DEFAULT_SAMPLE_RATE,
            max_queued_segments: DEFAULT_MAX_QUEUED_SEGMENTS,
        }
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn from_sources(
        fc: VoiceLinkConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let url = env("VOICE_LINK_SERVER")
            .or(fc.server.url)
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        let api_url = match env("VOICE_LINK_API_URL").or(fc.server.api_url) {
            Some(api_url) => api_url,
            None => derive_api_url(&url)?,
        };

        let server = ServerConfig {
            url,
            api_url,
            api_key: env("VOICE_LINK_API_KEY").or(fc.server.api_key),
        };

        let voice = VoiceConfig {
            voice_id: env("VOICE_LINK_VOICE_ID")
                .or(fc.voice.voice_id)
                .unwrap_or_else(|| DEFAULT_VOICE_ID.to_string()),
            elevenlabs: env("VOICE_LINK_ELEVENLABS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .or(fc.voice.elevenlabs)
                .unwrap_or(true),
            capture_sample_rate: env("VOICE_LINK_CAPTURE_RATE")
                .and_then(|s| s.parse().ok())
                .or(fc.voice.capture_sample_rate)
                .unwrap_or(DEFAULT_SAMPLE_RATE),
            playback_sample_rate: env("VOICE_LINK_PLAYBACK_RATE")
                .and_then(|s| s.parse().ok())
                .or(fc.voice.playback_sample_rate)
                .unwrap_or(DEFAULT_SAMPLE_RATE),
            max_queued_segments: fc
                .voice
                .max_queued_segments
                .unwrap_or(DEFAULT_MAX_QUEUED_SEGMENTS),
        };

        let config = Self { server, voice };
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the session relies on
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid field
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.server.url)
            .map_err(|e| Error::Config(format!("invalid server url '{}': {e}", self.server.url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "server url must use ws or wss, got '{}'",
                url.scheme()
            )));
        }

        Url::parse(&self.server.api_url).map_err(|e| {
            Error::Config(format!("invalid api url '{}': {e}", self.server.api_url))
        })?;

        if self.voice.capture_sample_rate == 0 || self.voice.playback_sample_rate == 0 {
            return Err(Error::Config("sample rates must be non-zero".to_string()));
        }
        if self.voice.max_queued_segments == 0 {
            return Err(Error::Config(
                "voice.max_queued_segments must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// WebSocket URL of the voice endpoint for a flow
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the server URL is invalid
    pub fn voice_url(&self, flow_id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.server.url)
            .map_err(|e| Error::Config(format!("invalid server url: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| Error::Config("server url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["api", "v1", "voice", "ws", "flow_as_tool", flow_id]);
        Ok(url)
    }
}

/// Map a ws(s) base URL to its http(s) counterpart
fn derive_api_url(ws_url: &str) -> Result<String> {
    let mut url =
        Url::parse(ws_url).map_err(|e| Error::Config(format!("invalid server url: {e}")))?;
    let scheme = if url.scheme() == "wss" { "https" } else { "http" };
    url.set_scheme(scheme)
        .map_err(|()| Error::Config(format!("cannot derive api url from '{ws_url}'")))?;
    Ok(url.as_str().trim_end_matches('/').to_string())
}
