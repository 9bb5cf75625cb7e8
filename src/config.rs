//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::audio::native::{
    frames_per_buffer, Direction, NativeAudio, SampleFormat, StreamParameters,
};
use crate::constants::*;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Audio configuration
    pub audio: AudioConfig,

    /// Notification sound configuration
    pub notifier: NotifierConfig,
}

/// Audio configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate
    pub sample_rate: u32,

    /// Capture channel count
    pub channels: u16,

    /// Sample size in bits (8, 16, 24 or 32)
    pub sample_size_bits: u16,

    /// Duration of one native buffer
    pub millis_per_buffer: u32,

    /// Explicit frames per native buffer, overrides `millis_per_buffer`
    pub frames_per_buffer: Option<usize>,

    /// Capture device index (backend default if unset)
    pub capture_device: Option<usize>,

    /// Playback device index (backend default if unset)
    pub playback_device: Option<usize>,

    /// Device used for notification sounds (playback device if unset)
    pub notify_device: Option<usize>,

    /// Software volume for notification sounds (0.0 - 1.0)
    pub volume: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            sample_size_bits: DEFAULT_SAMPLE_SIZE_BITS,
            millis_per_buffer: DEFAULT_MILLIS_PER_BUFFER,
            frames_per_buffer: None,
            capture_device: None,
            playback_device: None,
            notify_device: None,
            volume: 1.0,
        }
    }
}

impl AudioConfig {
    pub fn sample_format(&self) -> SampleFormat {
        SampleFormat::from_sample_size_bits(self.sample_size_bits)
    }

    /// Frames per native buffer for a stream of the given shape
    pub fn frames_per_buffer_for(&self, sample_rate: u32, channels: u16) -> usize {
        self.frames_per_buffer
            .unwrap_or_else(|| frames_per_buffer(sample_rate, channels, self.millis_per_buffer))
    }

    /// Capture stream parameters, resolving the default device on `audio`
    pub fn capture_params(&self, audio: &dyn NativeAudio) -> Option<StreamParameters> {
        let device = self
            .capture_device
            .or_else(|| audio.default_device(Direction::Input))?;

        Some(
            StreamParameters::new(device, self.sample_rate, self.channels, self.sample_format())
                .with_frames_per_buffer(
                    self.frames_per_buffer_for(self.sample_rate, self.channels),
                ),
        )
    }

    /// Device notification sounds play on
    pub fn notify_device(&self, audio: &dyn NativeAudio) -> Option<usize> {
        self.notify_device
            .or(self.playback_device)
            .or_else(|| audio.default_device(Direction::Output))
    }
}

/// How notification clips produce their audio
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClipBackend {
    /// Decode the whole sound into memory when the clip is created
    Simple,
    /// Decode from the file while playing
    #[default]
    Streaming,
}

/// Notification sound configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// When false the notifier starts muted
    pub sound_enabled: bool,

    /// Playback backend for new clips
    pub backend: ClipBackend,

    /// Directory relative sound keys are resolved against
    pub sounds_dir: Option<PathBuf>,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            sound_enabled: true,
            backend: ClipBackend::default(),
            sounds_dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn load(path: &PathBuf) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &PathBuf) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "neomedia", "neomedia-audio")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
