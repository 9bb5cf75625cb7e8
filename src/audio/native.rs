//! Boundary to the native audio device API
//!
//! Everything above this trait treats the device layer as an opaque
//! collaborator: it opens a stream for a device/rate/channels/format tuple,
//! starts and stops it, and moves fixed-size buffers of interleaved PCM
//! bytes through it.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{DEFAULT_CHANNELS, DEFAULT_MILLIS_PER_BUFFER, DEFAULT_SAMPLE_RATE};
use crate::error::AudioError;

/// Opaque identifier of a native stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

/// Native sample format of interleaved PCM bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    Int8,
    Int16,
    Int24,
    Int32,
    Float32,
}

impl SampleFormat {
    /// Map a sample size in bits to an integer format. Unknown sizes fall
    /// back to 16 bit.
    pub fn from_sample_size_bits(bits: u16) -> Self {
        match bits {
            8 => SampleFormat::Int8,
            24 => SampleFormat::Int24,
            32 => SampleFormat::Int32,
            _ => SampleFormat::Int16,
        }
    }

    /// Size of one sample in bytes
    pub fn sample_size(&self) -> usize {
        match self {
            SampleFormat::Int8 => 1,
            SampleFormat::Int16 => 2,
            SampleFormat::Int24 => 3,
            SampleFormat::Int32 | SampleFormat::Float32 => 4,
        }
    }
}

/// Frames per native buffer for a given buffer duration.
///
/// The channel count divides the frame count so that multi-channel streams
/// keep the same byte size per buffer as mono ones.
pub fn frames_per_buffer(sample_rate: u32, channels: u16, millis: u32) -> usize {
    let channels = channels.max(1) as u64;
    let frames = (sample_rate as u64 * millis as u64) / (channels * 1000);
    frames.max(1) as usize
}

/// Parameters a native stream is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamParameters {
    pub device_index: usize,
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
    pub frames_per_buffer: usize,
}

impl StreamParameters {
    /// Create parameters with the default buffer duration
    pub fn new(
        device_index: usize,
        sample_rate: u32,
        channels: u16,
        sample_format: SampleFormat,
    ) -> Self {
        Self {
            device_index,
            sample_rate,
            channels,
            sample_format,
            frames_per_buffer: frames_per_buffer(sample_rate, channels, DEFAULT_MILLIS_PER_BUFFER),
        }
    }

    /// Override the number of frames per native buffer
    pub fn with_frames_per_buffer(mut self, frames: usize) -> Self {
        self.frames_per_buffer = frames.max(1);
        self
    }

    /// Bytes per frame (sample size × channels)
    pub fn frame_size(&self) -> usize {
        self.sample_format.sample_size() * self.channels as usize
    }

    /// Bytes in one full native buffer
    pub fn bytes_per_buffer(&self) -> usize {
        self.frames_per_buffer * self.frame_size()
    }
}

impl Default for StreamParameters {
    fn default() -> Self {
        Self::new(0, DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS, SampleFormat::Int16)
    }
}

/// Description of a device exposed by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub max_input_channels: u16,
    pub max_output_channels: u16,
    pub default_sample_rate: u32,
    pub is_default_input: bool,
    pub is_default_output: bool,
}

impl DeviceInfo {
    pub fn supports(&self, direction: Direction) -> bool {
        match direction {
            Direction::Input => self.max_input_channels > 0,
            Direction::Output => self.max_output_channels > 0,
        }
    }
}

/// Native audio device API
///
/// Implementations own their streams; callers only hold [`StreamHandle`]s.
/// `read` blocks until `frames` frames have been captured. `write` accepts
/// whole native buffers and may block until the device has room for them.
pub trait NativeAudio: Send + Sync {
    fn open(
        &self,
        params: &StreamParameters,
        direction: Direction,
    ) -> Result<StreamHandle, AudioError>;

    fn start(&self, handle: StreamHandle) -> Result<(), AudioError>;

    /// Stop the stream. Output streams return once every buffer already
    /// written has been played.
    fn stop(&self, handle: StreamHandle) -> Result<(), AudioError>;

    /// Stop the stream, discarding output that has not been played yet
    fn abort(&self, handle: StreamHandle) -> Result<(), AudioError> {
        self.stop(handle)
    }

    fn close(&self, handle: StreamHandle);

    fn read(&self, handle: StreamHandle, frames: usize) -> Result<Vec<u8>, AudioError>;

    fn write(&self, handle: StreamHandle, bytes: &[u8]) -> Result<(), AudioError>;

    /// Devices currently known to the backend
    fn devices(&self) -> Vec<DeviceInfo>;

    /// Index of the default device for a direction
    fn default_device(&self, direction: Direction) -> Option<usize> {
        self.devices()
            .into_iter()
            .find(|d| match direction {
                Direction::Input => d.is_default_input,
                Direction::Output => d.is_default_output,
            })
            .map(|d| d.index)
    }
}
