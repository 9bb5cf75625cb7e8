//! Error types

use std::path::PathBuf;
use thiserror::Error;

use crate::audio::native::StreamHandle;

/// Failure reported by the native audio device layer.
///
/// Stream operations never retry and never wrap these; they reach the caller
/// of `start`/`stop`/`read`/`write` as-is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Audio device {0} not found")]
    DeviceNotFound(usize),

    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid stream handle: {0}")]
    InvalidHandle(StreamHandle),

    #[error("Stream is closed")]
    StreamClosed,

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Audio backend error: {0}")]
    Backend(String),
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(e: cpal::BuildStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

impl From<cpal::PlayStreamError> for AudioError {
    fn from(e: cpal::PlayStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

impl From<cpal::PauseStreamError> for AudioError {
    fn from(e: cpal::PauseStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

impl From<cpal::DevicesError> for AudioError {
    fn from(e: cpal::DevicesError) -> Self {
        AudioError::Backend(e.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for AudioError {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        AudioError::Backend(e.to_string())
    }
}

/// A sound resource could not be located, decoded or played.
#[derive(Error, Debug)]
pub enum ClipError {
    #[error("Sound resource not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid sound resource key: {0}")]
    InvalidKey(String),

    #[error("Failed to decode sound resource: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Audio(#[from] AudioError),
}

impl From<hound::Error> for ClipError {
    fn from(e: hound::Error) -> Self {
        match e {
            hound::Error::IoError(io) => ClipError::Io(io),
            other => ClipError::Decode(other.to_string()),
        }
    }
}

/// Crate-level error
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Clip(#[from] ClipError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
