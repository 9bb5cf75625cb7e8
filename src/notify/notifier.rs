//! Notification sound registry
//!
//! Caches one clip per resource key and applies notifier-wide state (mute,
//! output device) to every clip it handed out.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::audio::native::NativeAudio;
use crate::config::{AppConfig, ClipBackend};
use crate::constants::NOTIFIER_EVENT_CAPACITY;
use crate::error::{AudioError, ClipError};
use crate::notify::clip::{AudioClip, Clip, ClipContext};
use crate::notify::resource::resolve;
use crate::notify::simple::SimplePlaybackClip;
use crate::notify::streaming::StreamingClip;

/// Shared handle to a cached clip
pub type ClipHandle = Arc<Clip>;

/// State changes of a notifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierEvent {
    ClipCreated(String),
    ClipDestroyed(String),
    MuteChanged(bool),
    DeviceChanged(Option<usize>),
}

/// Registry of notification clips
pub struct AudioNotifier {
    audio: Arc<dyn NativeAudio>,
    clips: DashMap<String, ClipHandle>,
    device: Mutex<Option<usize>>,
    muted: Arc<AtomicBool>,
    backend: ClipBackend,
    sounds_dir: Option<PathBuf>,
    volume: f32,
    millis_per_buffer: u32,
    frames_per_buffer: Option<usize>,
    events: broadcast::Sender<NotifierEvent>,
}

impl AudioNotifier {
    pub fn new(audio: Arc<dyn NativeAudio>, config: &AppConfig) -> Self {
        let device = config.audio.notify_device(&*audio);
        let (events, _) = broadcast::channel(NOTIFIER_EVENT_CAPACITY);

        tracing::info!(
            "Audio notifier on device {:?} ({:?} clips, sound {})",
            device,
            config.notifier.backend,
            if config.notifier.sound_enabled { "on" } else { "off" }
        );

        Self {
            audio,
            clips: DashMap::new(),
            device: Mutex::new(device),
            muted: Arc::new(AtomicBool::new(!config.notifier.sound_enabled)),
            backend: config.notifier.backend,
            sounds_dir: config.notifier.sounds_dir.clone(),
            volume: config.audio.volume,
            millis_per_buffer: config.audio.millis_per_buffer,
            frames_per_buffer: config.audio.frames_per_buffer,
            events,
        }
    }

    /// Subscribe to notifier events
    pub fn subscribe(&self) -> broadcast::Receiver<NotifierEvent> {
        self.events.subscribe()
    }

    /// Return the clip for `key`, loading it on first use.
    ///
    /// Returns `None` when the resource cannot be found or decoded, or when
    /// there is no output device. Failures are not cached, and a cached clip
    /// that failed to play is reloaded.
    pub fn create_clip(&self, key: &str) -> Option<ClipHandle> {
        if let Some(clip) = self.clips.get(key) {
            if !clip.is_invalid() {
                return Some(clip.clone());
            }
        }

        let clip = match self.load(key) {
            Ok(clip) => Arc::new(clip),
            Err(e) => {
                tracing::warn!("Failed to load sound {}: {}", key, e);
                return None;
            }
        };

        // another thread may have loaded the same key meanwhile
        let clip = match self.clips.entry(key.to_string()) {
            Entry::Occupied(existing) if !existing.get().is_invalid() => existing.get().clone(),
            Entry::Occupied(mut existing) => {
                existing.insert(clip.clone());
                clip
            }
            Entry::Vacant(slot) => slot.insert(clip).clone(),
        };
        tracing::debug!("Created clip {}", key);
        let _ = self.events.send(NotifierEvent::ClipCreated(key.to_string()));
        Some(clip)
    }

    fn load(&self, key: &str) -> Result<Clip, ClipError> {
        let path = resolve(key, self.sounds_dir.as_deref())?;
        let ctx = self
            .context()
            .ok_or_else(|| ClipError::Audio(AudioError::Backend("no notification device".into())))?;

        Ok(match self.backend {
            ClipBackend::Simple => Clip::Simple(SimplePlaybackClip::load(key, &path, ctx)?),
            ClipBackend::Streaming => Clip::Streaming(StreamingClip::load(key, &path, ctx)?),
        })
    }

    fn context(&self) -> Option<ClipContext> {
        let device = (*self.device.lock())?;
        Some(ClipContext {
            audio: self.audio.clone(),
            device,
            volume: self.volume,
            millis_per_buffer: self.millis_per_buffer,
            frames_per_buffer: self.frames_per_buffer,
            muted: self.muted.clone(),
        })
    }

    /// Stop a clip and drop it from the cache
    pub fn destroy_clip(&self, clip: &ClipHandle) {
        clip.stop();
        let removed = self
            .clips
            .remove_if(clip.key(), |_, cached| Arc::ptr_eq(cached, clip));
        if removed.is_some() {
            tracing::debug!("Destroyed clip {}", clip.key());
            let _ = self.events.send(NotifierEvent::ClipDestroyed(clip.key().to_string()));
        }
    }

    /// Number of cached clips
    pub fn clip_count(&self) -> usize {
        self.clips.len()
    }

    /// Keys of cached clips
    pub fn keys(&self) -> Vec<String> {
        self.clips.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn is_mute(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Mute or unmute all clips.
    ///
    /// Muting stops every clip but remembers which ones were looping;
    /// unmuting resumes those loops.
    pub fn set_mute(&self, mute: bool) {
        if self.muted.swap(mute, Ordering::SeqCst) == mute {
            return;
        }

        for clip in self.snapshot() {
            if mute {
                clip.internal_stop();
            } else if clip.is_looping() {
                clip.play_in_loop(clip.loop_interval());
            }
        }

        tracing::info!("Notification sounds {}", if mute { "muted" } else { "unmuted" });
        let _ = self.events.send(NotifierEvent::MuteChanged(mute));
    }

    /// The notification device changed: stop and forget all clips so that
    /// new ones open on `device`
    pub fn device_changed(&self, device: Option<usize>) {
        *self.device.lock() = device;
        self.clear();
        tracing::info!("Notification device changed to {:?}", device);
        let _ = self.events.send(NotifierEvent::DeviceChanged(device));
    }

    /// Stop and drop every clip
    pub fn shutdown(&self) {
        self.clear();
    }

    fn clear(&self) {
        let clips = self.snapshot();
        self.clips.clear();
        for clip in clips {
            clip.stop();
        }
    }

    // Clips are collected first so no map shard lock is held while a clip
    // joins its worker.
    fn snapshot(&self) -> Vec<ClipHandle> {
        self.clips.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl Drop for AudioNotifier {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::virtual_device::{NativeOp, VirtualAudio};
    use crate::notify::clip::tests::wait_until;
    use crate::notify::resource::tests::write_wav;
    use std::time::Duration;

    /// Notifier with a `ring.wav` in its own sounds directory
    fn notifier(
        audio: &Arc<VirtualAudio>,
        backend: ClipBackend,
        test: &str,
    ) -> (AudioNotifier, PathBuf) {
        let written = write_wav(&format!("{}.wav", test), 8_000, &[200; 800]);
        let dir = written.with_extension("");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ring.wav");
        std::fs::rename(&written, &path).unwrap();

        let mut config = AppConfig::default();
        config.notifier.backend = backend;
        config.notifier.sounds_dir = Some(dir);
        (AudioNotifier::new(audio.clone(), &config), path)
    }

    #[test]
    fn test_missing_resource_returns_none() {
        let audio = Arc::new(VirtualAudio::new(1));
        let (notifier, _) =
            notifier(&audio, ClipBackend::Streaming, "test_missing_resource_returns_none");

        assert!(notifier.create_clip("missing.wav").is_none());
        assert_eq!(notifier.clip_count(), 0);
        assert!(notifier.create_clip("ring.wav").is_some());
    }

    #[test]
    fn test_clips_are_cached_per_key() {
        let audio = Arc::new(VirtualAudio::new(1));
        let (notifier, path) =
            notifier(&audio, ClipBackend::Simple, "test_clips_are_cached_per_key");

        let a = notifier.create_clip("ring.wav").unwrap();
        let b = notifier.create_clip("ring.wav").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // absolute path is a distinct key
        let c = notifier.create_clip(path.to_str().unwrap()).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(notifier.clip_count(), 2);
    }

    #[test]
    fn test_destroy_clip_evicts() {
        let audio = Arc::new(VirtualAudio::new(1));
        let (notifier, _) = notifier(&audio, ClipBackend::Simple, "test_destroy_clip_evicts");
        let mut events = notifier.subscribe();

        let clip = notifier.create_clip("ring.wav").unwrap();
        clip.play_in_loop(0);
        notifier.destroy_clip(&clip);

        assert!(!clip.is_playing());
        assert_eq!(notifier.clip_count(), 0);
        assert_eq!(events.try_recv().unwrap(), NotifierEvent::ClipCreated("ring.wav".into()));
        assert_eq!(events.try_recv().unwrap(), NotifierEvent::ClipDestroyed("ring.wav".into()));

        let fresh = notifier.create_clip("ring.wav").unwrap();
        assert!(!Arc::ptr_eq(&clip, &fresh));
    }

    #[test]
    fn test_mute_and_unmute_resumes_loops() {
        let audio = Arc::new(VirtualAudio::new(1));
        let (notifier, _) =
            notifier(&audio, ClipBackend::Streaming, "test_mute_and_unmute_resumes_loops");

        let looping = notifier.create_clip("ring.wav").unwrap();
        looping.play_in_loop(0);
        assert!(looping.is_playing());

        notifier.set_mute(true);
        assert!(notifier.is_mute());
        assert!(!looping.is_playing());
        assert!(looping.is_looping());

        // plays while muted are ignored
        looping.play();
        assert!(!looping.is_playing());

        notifier.set_mute(false);
        assert!(looping.is_looping());
        assert!(looping.is_playing());

        looping.stop();
        assert!(!looping.is_playing());
        assert_eq!(audio.open_streams(), 0);
    }

    #[test]
    fn test_unmute_does_not_replay_single_plays() {
        let audio = Arc::new(VirtualAudio::new(1));
        let (notifier, _) =
            notifier(&audio, ClipBackend::Simple, "test_unmute_does_not_replay_single_plays");

        let clip = notifier.create_clip("ring.wav").unwrap();
        clip.play();
        notifier.set_mute(true);
        notifier.set_mute(false);

        assert!(!clip.is_looping());
        assert!(!clip.is_playing());
    }

    #[test]
    fn test_sound_disabled_starts_muted() {
        let audio = Arc::new(VirtualAudio::new(1));
        let mut config = AppConfig::default();
        config.notifier.sound_enabled = false;
        let notifier = AudioNotifier::new(audio, &config);

        assert!(notifier.is_mute());
    }

    #[test]
    fn test_concurrent_play_restarts() {
        let audio = Arc::new(VirtualAudio::new(1));
        let (notifier, _) = notifier(&audio, ClipBackend::Simple, "test_concurrent_play_restarts");
        let clip = notifier.create_clip("ring.wav").unwrap();

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..5 {
                        clip.play();
                        assert!(audio.open_streams() <= 1);
                    }
                });
            }
        });

        assert!(wait_until(Duration::from_secs(2), || !clip.is_playing()));
        assert_eq!(audio.open_streams(), 0);
    }

    #[test]
    fn test_failed_clip_ignores_play() {
        let audio = Arc::new(VirtualAudio::new(1));
        let (notifier, _) =
            notifier(&audio, ClipBackend::Streaming, "test_failed_clip_ignores_play");
        let clip = notifier.create_clip("ring.wav").unwrap();

        audio.fail_next(NativeOp::Start, AudioError::StreamError("device gone".into()));
        clip.play();
        assert!(wait_until(Duration::from_secs(2), || clip.is_invalid() && !clip.is_playing()));

        let opened = audio.opened_total();
        clip.play();
        assert!(!clip.is_playing());
        assert_eq!(audio.opened_total(), opened);

        // asking again replaces the failed clip
        let fresh = notifier.create_clip("ring.wav").unwrap();
        assert!(!Arc::ptr_eq(&clip, &fresh));
        assert!(!fresh.is_invalid());
        assert_eq!(notifier.clip_count(), 1);
    }

    #[test]
    fn test_device_change_evicts_clips() {
        let audio = Arc::new(VirtualAudio::new(2));
        let (notifier, _) =
            notifier(&audio, ClipBackend::Simple, "test_device_change_evicts_clips");
        let mut events = notifier.subscribe();

        let old = notifier.create_clip("ring.wav").unwrap();
        old.play_in_loop(0);

        notifier.device_changed(Some(1));
        assert!(!old.is_playing());
        assert_eq!(notifier.clip_count(), 0);
        assert_eq!(events.try_recv().unwrap(), NotifierEvent::ClipCreated("ring.wav".into()));
        assert_eq!(events.try_recv().unwrap(), NotifierEvent::DeviceChanged(Some(1)));

        let new = notifier.create_clip("ring.wav").unwrap();
        new.play();
        assert!(wait_until(Duration::from_secs(2), || !new.is_playing()));
        assert!(!audio.all_writes().is_empty());
    }

    #[test]
    fn test_configured_frames_per_buffer_reaches_clips() {
        let audio = Arc::new(VirtualAudio::new(1));
        let path = write_wav("test_configured_frames_per_buffer.wav", 8_000, &[200; 800]);

        let mut config = AppConfig::default();
        config.audio.frames_per_buffer = Some(100);
        let notifier = AudioNotifier::new(audio.clone(), &config);

        let clip = notifier.create_clip(path.to_str().unwrap()).unwrap();
        clip.play();
        assert!(wait_until(Duration::from_secs(2), || !clip.is_playing()));

        // 800 samples in buffers of 100 mono frames
        let writes = audio.all_writes();
        assert_eq!(writes.len(), 8);
        assert!(writes.iter().all(|w| w.len() == 200));
    }

    #[test]
    fn test_no_device_means_no_clips() {
        let audio = Arc::new(VirtualAudio::new(1));
        let (notifier, _) = notifier(&audio, ClipBackend::Simple, "test_no_device_means_no_clips");

        notifier.device_changed(None);
        assert!(notifier.create_clip("ring.wav").is_none());
    }

    #[test]
    fn test_shutdown_stops_everything() {
        let audio = Arc::new(VirtualAudio::new(1));
        let (notifier, _) =
            notifier(&audio, ClipBackend::Streaming, "test_shutdown_stops_everything");

        let clip = notifier.create_clip("ring.wav").unwrap();
        clip.play_in_loop(5_000);
        notifier.shutdown();

        assert!(!clip.is_playing());
        assert_eq!(notifier.keys(), Vec::<String>::new());
        assert_eq!(audio.open_streams(), 0);
    }
}
