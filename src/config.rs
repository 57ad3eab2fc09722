//! Application configuration
//!
//! Every section is `#[serde(default)]`, so a partial file only overrides
//! what it names.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::device::DeviceId;
use crate::audio::host::{PerformanceMode, StreamParams};
use crate::constants::*;
use crate::error::{ConfigError, Result};
use crate::stream::window::WindowConfig;
use crate::stream::{OverflowPolicy, StreamFormat};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub network: NetworkConfig,
    pub watermark: WatermarkConfig,
    pub probe: ProbeConfig,
}

/// Device-side settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub playback_device: DeviceId,
    pub record_device: DeviceId,
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames per callback of the ring-buffer player
    pub player_block_frames: usize,
    /// Ring capacity of the player, in callback blocks
    pub player_buffer_blocks: usize,
    pub player_performance: PerformanceMode,
    /// Frames per callback of the loop player; half a second when unset
    pub loop_block_frames: Option<usize>,
    pub loop_performance: PerformanceMode,
    pub recorder_block_frames: usize,
    pub recorder_blocks: usize,
    pub recorder_performance: PerformanceMode,
    pub overflow_policy: OverflowPolicy,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            playback_device: DeviceId::Default,
            record_device: DeviceId::Default,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            player_block_frames: PLAYER_CALLBACK_FRAMES,
            player_buffer_blocks: PLAYER_BUFFER_BLOCKS,
            player_performance: PerformanceMode::LowLatency,
            loop_block_frames: None,
            loop_performance: PerformanceMode::None,
            recorder_block_frames: RECORDER_BLOCK_FRAMES,
            recorder_blocks: RECORDER_BLOCKS,
            recorder_performance: PerformanceMode::LowLatency,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

impl AudioConfig {
    pub fn format(&self) -> StreamFormat {
        StreamFormat::new(self.sample_rate, self.channels)
    }

    pub fn player_params(&self, device: &DeviceId) -> StreamParams {
        StreamParams {
            device: device.clone(),
            sample_rate: self.sample_rate,
            channels: self.channels,
            performance: self.player_performance,
            block_frames: self.player_block_frames,
        }
    }

    /// Ring capacity of the player in interleaved samples
    pub fn player_buffer_samples(&self) -> usize {
        self.player_block_frames * self.player_buffer_blocks * self.channels as usize
    }

    pub fn loop_params(&self, device: &DeviceId) -> StreamParams {
        StreamParams {
            device: device.clone(),
            sample_rate: self.sample_rate,
            channels: self.channels,
            performance: self.loop_performance,
            block_frames: self
                .loop_block_frames
                .unwrap_or(self.sample_rate as usize / 2),
        }
    }

    pub fn recorder_params(&self, device: &DeviceId) -> StreamParams {
        StreamParams {
            device: device.clone(),
            sample_rate: self.sample_rate,
            channels: self.channels,
            performance: self.recorder_performance,
            block_frames: self.recorder_block_frames,
        }
    }
}

/// UDP transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Listen address of the callee
    pub bind_address: String,
    pub port: u16,
    /// Largest datagram sent, in bytes
    pub max_packet_size: usize,
    pub connect_timeout_ms: u64,
    pub handshake_retry_ms: u64,
    pub receive_poll_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_UDP_PORT,
            max_packet_size: MAX_PACKET_SIZE,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            handshake_retry_ms: HANDSHAKE_RETRY_MS,
            receive_poll_ms: RECEIVE_POLL_MS,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_retry(&self) -> Duration {
        Duration::from_millis(self.handshake_retry_ms)
    }

    pub fn receive_poll(&self) -> Duration {
        Duration::from_millis(self.receive_poll_ms)
    }
}

/// Model-side settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatermarkConfig {
    /// Rate of the audio carried by the transport, mono
    pub transport_rate: u32,
    /// Frames per model window
    pub window_frames: usize,
    /// Frames between consecutive detection windows
    pub window_step_frames: usize,
    pub max_retained_blocks: usize,
    /// Windows queued for the inference thread before new ones are dropped
    pub detection_queue_depth: usize,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            transport_rate: TRANSPORT_SAMPLE_RATE,
            window_frames: MODEL_WINDOW_FRAMES,
            window_step_frames: MODEL_WINDOW_FRAMES,
            max_retained_blocks: MAX_RETAINED_WINDOW_BLOCKS,
            detection_queue_depth: DETECTION_QUEUE_DEPTH,
        }
    }
}

impl WatermarkConfig {
    pub fn transport_format(&self) -> StreamFormat {
        StreamFormat::mono(self.transport_rate)
    }

    pub fn window(&self, policy: OverflowPolicy) -> WindowConfig {
        WindowConfig {
            window_frames: self.window_frames,
            step_frames: self.window_step_frames,
            max_retained_blocks: self.max_retained_blocks,
            policy,
        }
    }
}

/// Loop content played by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub enabled: bool,
    pub frequencies: Vec<f32>,
    pub amplitude: f32,
    pub duration_secs: f32,
    /// Play this file instead of the generated tones
    pub wav_path: Option<PathBuf>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            frequencies: PROBE_TONES_HZ.to_vec(),
            amplitude: PROBE_AMPLITUDE,
            duration_secs: PROBE_DURATION_SECS,
            wav_path: None,
        }
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

impl AppConfig {
    /// Load from a TOML file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::from)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// `config.toml` in the platform config directory
    pub fn default_path() -> std::result::Result<PathBuf, ConfigError> {
        let dirs = ProjectDirs::from("dev", "watermark-link", "watermark-link")
            .ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Load the default file if it exists, defaults otherwise
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Ok(path) if path.exists() => Self::load(&path),
            Ok(_) => Ok(Self::default()),
            Err(e) => {
                tracing::warn!("{}, using defaults", e);
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let audio = &self.audio;
        if audio.sample_rate == 0 {
            return Err(invalid("audio.sample_rate", "must be non-zero"));
        }
        if audio.channels == 0 {
            return Err(invalid("audio.channels", "must be non-zero"));
        }
        if audio.player_block_frames == 0 || audio.player_buffer_blocks == 0 {
            return Err(invalid("audio.player_buffer_blocks", "player ring must be non-empty"));
        }
        if audio.loop_block_frames == Some(0) {
            return Err(invalid("audio.loop_block_frames", "must be non-zero"));
        }
        if audio.recorder_block_frames == 0 || audio.recorder_blocks == 0 {
            return Err(invalid("audio.recorder_blocks", "recorder pool must be non-empty"));
        }

        let network = &self.network;
        if network.max_packet_size < MIN_PACKET_SIZE || network.max_packet_size > 65507 {
            return Err(invalid(
                "network.max_packet_size",
                &format!("must be between {} and 65507", MIN_PACKET_SIZE),
            ));
        }
        if network.connect_timeout_ms == 0 || network.receive_poll_ms == 0 {
            return Err(invalid("network.connect_timeout_ms", "timeouts must be non-zero"));
        }

        let watermark = &self.watermark;
        if watermark.transport_rate == 0 {
            return Err(invalid("watermark.transport_rate", "must be non-zero"));
        }
        if watermark.window_frames == 0 || watermark.window_step_frames == 0 {
            return Err(invalid("watermark.window_frames", "must be non-zero"));
        }
        if watermark.window_step_frames > watermark.window_frames {
            return Err(invalid(
                "watermark.window_step_frames",
                "must not exceed window_frames",
            ));
        }
        if watermark.max_retained_blocks == 0 || watermark.detection_queue_depth == 0 {
            return Err(invalid("watermark.max_retained_blocks", "must be non-zero"));
        }

        if !(0.0..=1.0).contains(&self.probe.amplitude) {
            return Err(invalid("probe.amplitude", "must be within 0..=1"));
        }
        if self.probe.duration_secs <= 0.0 {
            return Err(invalid("probe.duration_secs", "must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.audio.loop_params(&DeviceId::Default).block_frames, 24000);
        assert_eq!(config.audio.player_buffer_samples(), 64 * 512);
        assert_eq!(config.probe.frequencies.len(), 6);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [audio]
            playback_device = "USB Speaker"
            overflow_policy = "drop_newest"

            [network]
            port = 6000
            "#,
        )
        .unwrap();
        assert_eq!(
            config.audio.playback_device,
            DeviceId::Named("USB Speaker".into())
        );
        assert_eq!(config.audio.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(config.audio.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(config.network.port, 6000);
        assert_eq!(config.watermark, WatermarkConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.network.port = 7000;
        config.probe.wav_path = Some(PathBuf::from("/tmp/probe.wav"));
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = AppConfig::default();
        config.watermark.window_step_frames = config.watermark.window_frames + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "watermark.window_step_frames",
                ..
            })
        ));

        let mut config = AppConfig::default();
        config.audio.channels = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[audio\nsample_rate = ").unwrap();
        assert!(matches!(
            AppConfig::load(&path),
            Err(Error::Config(ConfigError::Parse(_)))
        ));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = AppConfig::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
