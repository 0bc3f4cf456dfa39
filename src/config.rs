//! Configuration types for the voice and text channels.

use crate::error::{ConciergeError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable that overrides [`ChannelConfig::base_url`].
pub const BASE_URL_ENV: &str = "CONCIERGE_WS_URL";

/// Top-level configuration for the concierge client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConciergeConfig {
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Audio capture/playback device settings.
    pub audio: AudioConfig,
    /// Duplex channel transport settings.
    pub channel: ChannelConfig,
    /// Response playback and turn-taking settings.
    pub playback: PlaybackConfig,
}

/// Voice activity detection configuration.
///
/// All durations are in milliseconds and measured from the start of the
/// current recording attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Length of the ambient noise calibration window.
    pub calibration_ms: u64,
    /// Floor for the adaptive speech threshold (RMS of f32 samples in \[-1, 1\]).
    pub initial_energy_threshold: f32,
    /// Threshold = background energy × this multiplier (never below the floor).
    pub energy_multiplier: f32,
    /// EMA factor for energy smoothing. Higher values smooth harder.
    pub energy_smoothing: f32,
    /// Silence after speech required to stop recording.
    pub min_silence_ms: u64,
    /// Accumulated speech required before silence may stop recording.
    pub min_speech_ms: u64,
    /// Stop if nothing meaningful was said within this window.
    pub no_speech_timeout_ms: u64,
    /// Absolute recording limit.
    pub max_recording_ms: u64,
    /// Analysis loop period.
    pub frame_interval_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            calibration_ms: 500,
            initial_energy_threshold: 0.01,
            energy_multiplier: 2.0,
            energy_smoothing: 0.7,
            min_silence_ms: 1500,
            min_speech_ms: 300,
            no_speech_timeout_ms: 10_000,
            max_recording_ms: 30_000,
            frame_interval_ms: 16,
        }
    }
}

impl VadConfig {
    /// Analysis loop period as a [`Duration`].
    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

/// Encodings the recorder can produce, in wire terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// 16-bit signed PCM in a WAV container.
    WavPcm16,
    /// 32-bit float PCM in a WAV container.
    WavFloat32,
}

impl AudioEncoding {
    /// MIME type reported to the peer.
    #[must_use]
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::WavPcm16 | Self::WavFloat32 => "audio/wav",
        }
    }
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate of the recorded utterance in Hz.
    pub capture_sample_rate: u32,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// Recorder encodings in descending preference.
    pub encoding_preference: Vec<AudioEncoding>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: 16_000,
            input_device: None,
            output_device: None,
            encoding_preference: vec![AudioEncoding::WavPcm16, AudioEncoding::WavFloat32],
        }
    }
}

/// Reconnection policy for channels that reconnect on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay.
    pub max_delay_ms: u64,
    /// Attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

/// Duplex channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Base URL of the duplex transport (`ws://` or `wss://`).
    pub base_url: String,
    /// Path of the voice channel endpoint.
    pub audio_path: String,
    /// Path of the text chat endpoint.
    pub text_path: String,
    /// Interval between keep-alive pings while connected.
    pub keepalive_interval_ms: u64,
    /// Text channel reconnection policy.
    pub reconnect: ReconnectConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://localhost:8000".to_owned(),
            audio_path: "/ws/audio".to_owned(),
            text_path: "/ws/chat".to_owned(),
            keepalive_interval_ms: 30_000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ChannelConfig {
    /// Keep-alive interval as a [`Duration`].
    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

/// Response playback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Re-arm capture automatically after a response finishes playing.
    pub auto_listen: bool,
    /// Pause between playback end and the automatic capture start.
    pub settle_delay_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            auto_listen: false,
            settle_delay_ms: 300,
        }
    }
}

impl ConciergeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| ConciergeError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| ConciergeError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/concierge/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("concierge").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("concierge")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/concierge-config/config.toml")
        }
    }

    /// Apply environment overrides (currently only the transport base URL).
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(BASE_URL_ENV) {
            let url = url.trim();
            if !url.is_empty() {
                self.channel.base_url = url.to_owned();
            }
        }
        self
    }

    /// Check invariants that serde defaults cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConciergeError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        let base = url::Url::parse(&self.channel.base_url)
            .map_err(|e| ConciergeError::Config(format!("invalid base_url: {e}")))?;
        if !matches!(base.scheme(), "ws" | "wss") {
            return Err(ConciergeError::Config(format!(
                "base_url must use ws:// or wss://, got {}://",
                base.scheme()
            )));
        }
        if self.vad.frame_interval_ms == 0 {
            return Err(ConciergeError::Config(
                "vad.frame_interval_ms must be positive".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.vad.energy_smoothing) {
            return Err(ConciergeError::Config(
                "vad.energy_smoothing must be in [0, 1)".into(),
            ));
        }
        if self.audio.encoding_preference.is_empty() {
            return Err(ConciergeError::Config(
                "audio.encoding_preference must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ConciergeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.vad.calibration_ms, 500);
        assert_eq!(config.vad.min_silence_ms, 1500);
        assert_eq!(config.vad.min_speech_ms, 300);
        assert_eq!(config.vad.no_speech_timeout_ms, 10_000);
        assert_eq!(config.vad.max_recording_ms, 30_000);
        assert_eq!(config.channel.keepalive_interval_ms, 30_000);
        assert_eq!(config.channel.reconnect.max_attempts, 5);
        assert_eq!(config.playback.settle_delay_ms, 300);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = ConciergeConfig::default();
        config.channel.base_url = "wss://concierge.example".to_owned();
        config.playback.auto_listen = true;
        config.vad.min_silence_ms = 900;

        config.save_to_file(&path).unwrap();
        let loaded = ConciergeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.channel.base_url, "wss://concierge.example");
        assert!(loaded.playback.auto_listen);
        assert_eq!(loaded.vad.min_silence_ms, 900);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: ConciergeConfig = toml::from_str("[playback]\nauto_listen = true\n").unwrap();
        assert!(config.playback.auto_listen);
        assert_eq!(config.playback.settle_delay_ms, 300);
        assert_eq!(config.channel.text_path, "/ws/chat");
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result = ConciergeConfig::from_file(std::path::Path::new("/nonexistent/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml {{{").unwrap();
        assert!(matches!(
            ConciergeConfig::from_file(&path),
            Err(ConciergeError::Config(_))
        ));
    }

    #[test]
    fn validate_rejects_http_base_url() {
        let mut config = ConciergeConfig::default();
        config.channel.base_url = "http://localhost:8000".to_owned();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_smoothing() {
        let mut config = ConciergeConfig::default();
        config.vad.energy_smoothing = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        let path = ConciergeConfig::default_config_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.ends_with("config.toml"));
        assert!(path_str.contains("concierge"));
    }

    #[test]
    fn encoding_serializes_snake_case() {
        let toml_str = toml::to_string(&AudioConfig::default()).unwrap();
        assert!(toml_str.contains("wav_pcm16"));
    }
}
