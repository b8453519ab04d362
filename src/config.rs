//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment variables (HOST, PORT, API_KEY / GEMINI_API_KEY)
//! 2. Environment variables (APP_SERVER__PORT, APP_LIVE__VOICE_NAME, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Runtime updates
//! The live and audio sections can be changed while the service runs. A
//! change only affects the next voice session; a live session keeps the
//! format and voice it was opened with.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Live endpoint for Gemini's bidirectional streaming API.
pub const DEFAULT_LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Format of the audio the live endpoint sends back: PCM16 mono at 24kHz.
pub const INBOUND_SAMPLE_RATE: u32 = 24_000;
pub const INBOUND_CHANNELS: u16 = 1;

const REDACTED: &str = "********";

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub live: LiveConfig,
    pub audio: AudioConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only the local panel can reach the service (default)
/// - `host = "0.0.0.0"`: Accept connections from any IP address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Remote live session settings.
///
/// ## Fields:
/// - `endpoint`: ws:// or wss:// URL of the bidirectional endpoint
/// - `api_key`: attached to the endpoint URL; never returned by the HTTP API
/// - `model`: streaming model, with or without the `models/` prefix
/// - `voice_name`: prebuilt voice the model answers with
/// - `system_instruction`: short behaviour text, passed through untouched
/// - `connect_timeout_ms`: how long `open` waits for the endpoint to become ready
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub connect_timeout_ms: u64,
}

/// Audio formats and device selection.
///
/// Rates are the wire rates. Devices that can't run at them are resampled.
/// The playback format must match what the endpoint sends
/// ([`INBOUND_SAMPLE_RATE`] mono); it is checked by `validate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub capture_block_frames: usize,
    pub playback_channels: u16,
    /// Input device name; `None` for the system default
    pub input_device: Option<String>,
    /// Output device name; `None` for the system default
    pub output_device: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            live: LiveConfig {
                endpoint: DEFAULT_LIVE_ENDPOINT.to_string(),
                api_key: String::new(),
                model: "gemini-2.5-flash-native-audio-preview-12-2025".to_string(),
                voice_name: "Zephyr".to_string(),
                system_instruction: "Você é um assistente sênior de SketchUp. Ajude o usuário \
                    com dúvidas técnicas, medidas e gestão de tempo."
                    .to_string(),
                connect_timeout_ms: 10_000,
            },
            audio: AudioConfig {
                capture_sample_rate: 16_000,
                playback_sample_rate: 24_000,
                capture_block_frames: 4096,
                playback_channels: 1,
                input_device: None,
                output_device: None,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_LIVE__VOICE_NAME=Puck`: Override the voice
    /// - `APP_AUDIO__INPUT_DEVICE=USB Microphone`: Pick a microphone
    /// - `HOST=0.0.0.0`, `PORT=3000`: Deployment platform overrides
    /// - `API_KEY=...` or `GEMINI_API_KEY=...`: Live endpoint key
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Some(key) = env::var("API_KEY").ok().or_else(|| env::var("GEMINI_API_KEY").ok()) {
            settings = settings.set_override("live.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// An empty API key is allowed here; the endpoint rejects the session on
    /// `open` and that is reported like any other session error.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !(self.live.endpoint.starts_with("ws://") || self.live.endpoint.starts_with("wss://")) {
            return Err(anyhow::anyhow!(
                "Live endpoint must be a ws:// or wss:// URL, got '{}'",
                self.live.endpoint
            ));
        }

        if self.live.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Live model cannot be empty"));
        }

        if self.live.voice_name.trim().is_empty() {
            return Err(anyhow::anyhow!("Voice name cannot be empty"));
        }

        if self.live.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Connect timeout must be greater than 0"));
        }

        if self.audio.capture_sample_rate == 0 || self.audio.playback_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.capture_block_frames == 0 {
            return Err(anyhow::anyhow!("Capture block size must be greater than 0"));
        }

        if self.audio.playback_sample_rate != INBOUND_SAMPLE_RATE
            || self.audio.playback_channels != INBOUND_CHANNELS
        {
            return Err(anyhow::anyhow!(
                "Playback format must match the live endpoint output ({}Hz x{}), got {}Hz x{}",
                INBOUND_SAMPLE_RATE,
                INBOUND_CHANNELS,
                self.audio.playback_sample_rate,
                self.audio.playback_channels
            ));
        }

        Ok(())
    }

    /// Copy safe to hand to HTTP clients: the API key is masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if !config.live.api_key.is_empty() {
            config.live.api_key = REDACTED.to_string();
        }
        config
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// Only session-level settings can change at runtime: the voice, the
    /// instruction, the model and the device names. Server, endpoint and wire
    /// formats stay as loaded. `null` clears a device name back to the default.
    ///
    /// ```json
    /// {"live": {"voice_name": "Puck"}, "audio": {"input_device": null}}
    /// ```
    ///
    /// A rejected update leaves `self` untouched.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(live) = partial_config.get("live") {
            if let Some(voice) = live.get("voice_name").and_then(|v| v.as_str()) {
                updated.live.voice_name = voice.to_string();
            }
            if let Some(instruction) = live.get("system_instruction").and_then(|v| v.as_str()) {
                updated.live.system_instruction = instruction.to_string();
            }
            if let Some(model) = live.get("model").and_then(|v| v.as_str()) {
                updated.live.model = model.to_string();
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(device) = audio.get("input_device") {
                updated.audio.input_device = device.as_str().map(str::to_string);
            }
            if let Some(device) = audio.get("output_device") {
                updated.audio.output_device = device.as_str().map(str::to_string);
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.capture_sample_rate, 16000);
        assert_eq!(config.audio.playback_sample_rate, 24000);
        assert_eq!(config.audio.capture_block_frames, 4096);
        assert_eq!(config.live.voice_name, "Zephyr");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.live.endpoint = "https://example.test".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.capture_block_frames = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.playback_sample_rate = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_playback_format_must_match_inbound_stream() {
        let mut config = AppConfig::default();
        config.audio.playback_channels = 2;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.playback_sample_rate = 48_000;
        assert!(config.validate().is_err());

        // The capture rate is announced in every chunk's MIME type, so it may differ.
        let mut config = AppConfig::default();
        config.audio.capture_sample_rate = 24_000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_instruction_is_passed_through_verbatim() {
        let config = AppConfig::default();
        assert_eq!(
            config.live.system_instruction,
            "Você é um assistente sênior de SketchUp. Ajude o usuário com dúvidas técnicas, medidas e gestão de tempo."
        );
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"live": {"voice_name": "Puck"}, "audio": {"input_device": "USB Mic"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.live.voice_name, "Puck");
        assert_eq!(config.audio.input_device.as_deref(), Some("USB Mic"));
        assert_eq!(config.live.model, AppConfig::default().live.model);

        assert!(config.update_from_json(r#"{"audio": {"input_device": null}}"#).is_ok());
        assert_eq!(config.audio.input_device, None);
    }

    #[test]
    fn test_update_ignores_server_and_formats() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "audio": {"capture_sample_rate": 44100}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.capture_sample_rate, 16000);
    }

    #[test]
    fn test_invalid_update_is_rejected() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"live": {"voice_name": " "}}"#).is_err());
        assert!(config.update_from_json("not json").is_err());
    }

    #[test]
    fn test_rejected_update_leaves_config_unchanged() {
        let mut config = AppConfig::default();
        let json = r#"{"live": {"voice_name": "", "model": "other-model"}, "audio": {"input_device": "USB Mic"}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_redacted_hides_api_key() {
        let mut config = AppConfig::default();
        assert_eq!(config.redacted().live.api_key, "");

        config.live.api_key = "secret".to_string();
        let redacted = config.redacted();
        assert_eq!(redacted.live.api_key, "********");
        assert_eq!(config.live.api_key, "secret");
    }
}
