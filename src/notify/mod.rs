//! Notification sounds
//!
//! Short sounds (ring tones, busy tones) played on the notification device,
//! cached by resource key and muted as a group.

pub mod clip;
pub mod notifier;
pub mod resource;
pub mod simple;
pub mod streaming;

pub use clip::{AudioClip, Clip, ClipContext};
pub use notifier::{AudioNotifier, ClipHandle, NotifierEvent};
pub use resource::PcmFormat;
pub use simple::SimplePlaybackClip;
pub use streaming::StreamingClip;
