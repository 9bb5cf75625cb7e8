//! Shared native audio streams and notification sound clips.
//!
//! The [`audio`] module multiplexes one native capture stream between any
//! number of readers and adapts arbitrary-length writes into the fixed-size
//! chunks a native output stream accepts. The [`notify`] module builds
//! notification sounds on top of it: clips that play once, loop
//! continuously or loop with a pause, and a notifier that caches clips by
//! resource key and mutes them all at once.

pub mod audio;
pub mod config;
pub mod constants;
pub mod error;
pub mod notify;

pub use error::{AudioError, ClipError, Error, Result};
