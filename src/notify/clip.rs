//! Notification sound clips
//!
//! A clip plays one sound resource on a worker thread. The playback policy is
//! shared by every backend: play once, loop continuously (interval 0) or loop
//! with a pause of `interval` milliseconds between plays. Backends differ only
//! in how they produce the PCM for one play cycle.
//!
//! Calling `play` on a clip that is already playing restarts it: the running
//! worker is stopped and joined before the new one starts, so a clip never
//! plays over itself. A stopped clip drops the audio still queued on the
//! device. A sound that renders no samples marks the clip invalid.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::native::{frames_per_buffer, NativeAudio, SampleFormat, StreamParameters};
use crate::audio::output::OutputStream;
use crate::error::{AudioError, ClipError};
use crate::notify::resource::PcmFormat;
use crate::notify::simple::SimplePlaybackClip;
use crate::notify::streaming::StreamingClip;

/// Playback operations of a notification sound
pub trait AudioClip: Send + Sync {
    /// Resource key the clip was created for
    fn key(&self) -> &str;

    /// Play once. Restarts the clip if it is already playing.
    fn play(&self);

    /// Loop until stopped; `interval_ms` is the pause between plays,
    /// 0 loops without a gap
    fn play_in_loop(&self, interval_ms: u64);

    /// Stop playing and forget any loop
    fn stop(&self);

    /// Stop playing but keep the loop settings, so that the loop can be
    /// resumed with `play_in_loop(loop_interval())`
    fn internal_stop(&self);

    fn is_playing(&self) -> bool;

    fn is_looping(&self) -> bool;

    fn loop_interval(&self) -> u64;

    /// True once the clip failed to play; further plays do nothing
    fn is_invalid(&self) -> bool;
}

/// A clip of either backend
pub enum Clip {
    Simple(SimplePlaybackClip),
    Streaming(StreamingClip),
}

impl AudioClip for Clip {
    fn key(&self) -> &str {
        match self {
            Clip::Simple(c) => c.key(),
            Clip::Streaming(c) => c.key(),
        }
    }

    fn play(&self) {
        match self {
            Clip::Simple(c) => c.play(),
            Clip::Streaming(c) => c.play(),
        }
    }

    fn play_in_loop(&self, interval_ms: u64) {
        match self {
            Clip::Simple(c) => c.play_in_loop(interval_ms),
            Clip::Streaming(c) => c.play_in_loop(interval_ms),
        }
    }

    fn stop(&self) {
        match self {
            Clip::Simple(c) => c.stop(),
            Clip::Streaming(c) => c.stop(),
        }
    }

    fn internal_stop(&self) {
        match self {
            Clip::Simple(c) => c.internal_stop(),
            Clip::Streaming(c) => c.internal_stop(),
        }
    }

    fn is_playing(&self) -> bool {
        match self {
            Clip::Simple(c) => c.is_playing(),
            Clip::Streaming(c) => c.is_playing(),
        }
    }

    fn is_looping(&self) -> bool {
        match self {
            Clip::Simple(c) => c.is_looping(),
            Clip::Streaming(c) => c.is_looping(),
        }
    }

    fn loop_interval(&self) -> u64 {
        match self {
            Clip::Simple(c) => c.loop_interval(),
            Clip::Streaming(c) => c.loop_interval(),
        }
    }

    fn is_invalid(&self) -> bool {
        match self {
            Clip::Simple(c) => c.is_invalid(),
            Clip::Streaming(c) => c.is_invalid(),
        }
    }
}

/// Where and how clips play
#[derive(Clone)]
pub struct ClipContext {
    pub audio: Arc<dyn NativeAudio>,
    pub device: usize,
    pub volume: f32,
    pub millis_per_buffer: u32,
    /// Native buffer size in frames, derived from `millis_per_buffer` if unset
    pub frames_per_buffer: Option<usize>,
    /// Notifier-wide mute flag
    pub muted: Arc<AtomicBool>,
}

impl ClipContext {
    fn output_params(&self, format: PcmFormat) -> StreamParameters {
        let frames = self.frames_per_buffer.unwrap_or_else(|| {
            frames_per_buffer(format.sample_rate, format.channels, self.millis_per_buffer)
        });
        StreamParameters::new(
            self.device,
            format.sample_rate,
            format.channels,
            SampleFormat::Int16,
        )
        .with_frames_per_buffer(frames)
    }
}

/// Receives the PCM of one play cycle
pub(crate) type PcmSink<'a> = dyn FnMut(&[u8]) -> Result<(), AudioError> + 'a;

/// Produces the PCM of one play cycle
pub(crate) trait PcmSource: Send + Sync + 'static {
    fn format(&self) -> PcmFormat;

    /// Push one cycle of 16-bit PCM into `sink`, returning early once
    /// `cancelled` reports true
    fn render(
        &self,
        sink: &mut PcmSink<'_>,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<(), ClipError>;
}

struct Worker {
    cancel: Arc<AtomicBool>,
    wake: Sender<()>,
    finished: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Loop flags shared with the worker thread
struct LoopState {
    looping: AtomicBool,
    interval_ms: AtomicU64,
}

/// Playback policy shared by all backends
pub(crate) struct ClipCore {
    key: String,
    ctx: ClipContext,
    source: Arc<dyn PcmSource>,
    loop_state: Arc<LoopState>,
    invalid: Arc<AtomicBool>,
    worker: Mutex<Option<Worker>>,
}

impl ClipCore {
    pub(crate) fn new(key: String, ctx: ClipContext, source: Arc<dyn PcmSource>) -> Self {
        Self {
            key,
            ctx,
            source,
            loop_state: Arc::new(LoopState {
                looping: AtomicBool::new(false),
                interval_ms: AtomicU64::new(0),
            }),
            invalid: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn play(&self) {
        if self.invalid.load(Ordering::SeqCst) {
            return;
        }

        let mut worker = self.worker.lock();
        if let Some(running) = worker.take() {
            halt(running);
        }

        if self.ctx.muted.load(Ordering::SeqCst) {
            tracing::debug!("Sound {} not played: notifications muted", self.key);
            return;
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let (wake_tx, wake_rx) = bounded::<()>(1);

        let job = PlaybackJob {
            key: self.key.clone(),
            ctx: self.ctx.clone(),
            source: self.source.clone(),
            loop_state: self.loop_state.clone(),
            invalid: self.invalid.clone(),
            cancel: cancel.clone(),
            finished: finished.clone(),
            wake: wake_rx,
        };

        let spawned = thread::Builder::new()
            .name(format!("sound-{}", short_name(&self.key)))
            .spawn(move || job.run());

        match spawned {
            Ok(thread) => {
                *worker = Some(Worker {
                    cancel,
                    wake: wake_tx,
                    finished,
                    thread,
                });
            }
            Err(e) => {
                tracing::warn!("Failed to start playback of {}: {}", self.key, e);
                self.invalid.store(true, Ordering::SeqCst);
            }
        }
    }

    pub(crate) fn play_in_loop(&self, interval_ms: u64) {
        self.loop_state.interval_ms.store(interval_ms, Ordering::SeqCst);
        self.loop_state.looping.store(true, Ordering::SeqCst);
        self.play();
    }

    pub(crate) fn stop(&self) {
        self.loop_state.looping.store(false, Ordering::SeqCst);
        self.internal_stop();
    }

    pub(crate) fn internal_stop(&self) {
        if let Some(running) = self.worker.lock().take() {
            halt(running);
        }
    }

    pub(crate) fn is_playing(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map(|w| !w.finished.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub(crate) fn is_looping(&self) -> bool {
        self.loop_state.looping.load(Ordering::SeqCst)
    }

    pub(crate) fn loop_interval(&self) -> u64 {
        self.loop_state.interval_ms.load(Ordering::SeqCst)
    }

    pub(crate) fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::SeqCst)
    }
}

impl Drop for ClipCore {
    fn drop(&mut self) {
        if let Some(running) = self.worker.get_mut().take() {
            halt(running);
        }
    }
}

fn halt(worker: Worker) {
    worker.cancel.store(true, Ordering::SeqCst);
    let _ = worker.wake.try_send(());
    if worker.thread.join().is_err() {
        tracing::error!("Sound playback thread panicked");
    }
}

fn short_name(key: &str) -> &str {
    key.rsplit(['/', '\\']).next().unwrap_or(key)
}

/// Everything a worker thread needs to play a clip
struct PlaybackJob {
    key: String,
    ctx: ClipContext,
    source: Arc<dyn PcmSource>,
    loop_state: Arc<LoopState>,
    invalid: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    wake: Receiver<()>,
}

impl PlaybackJob {
    fn run(self) {
        if let Err(e) = self.play_cycles() {
            tracing::warn!("Failed to play sound {}: {}", self.key, e);
            self.invalid.store(true, Ordering::SeqCst);
        }
        self.finished.store(true, Ordering::SeqCst);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn keep_looping(&self) -> bool {
        !self.cancelled() && self.loop_state.looping.load(Ordering::SeqCst)
    }

    fn play_cycles(&self) -> Result<(), ClipError> {
        let params = self.ctx.output_params(self.source.format());
        let output = OutputStream::open(self.ctx.audio.clone(), params)?;
        output.set_volume(self.ctx.volume);
        output.start()?;

        loop {
            let cancel = &self.cancel;
            let mut rendered = 0;
            self.source.render(
                &mut |bytes: &[u8]| {
                    rendered += bytes.len();
                    output.write(bytes)
                },
                &|| cancel.load(Ordering::SeqCst),
            )?;

            if rendered == 0 && !self.cancelled() {
                return Err(ClipError::Decode(format!("{} has no samples", self.key)));
            }
            if !self.keep_looping() {
                break;
            }

            let interval = self.loop_state.interval_ms.load(Ordering::SeqCst);
            if interval == 0 {
                continue;
            }

            pad_to_buffer(&output)?;
            output.stop()?;
            match self.wake.recv_timeout(Duration::from_millis(interval)) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => break,
            }
            if !self.keep_looping() {
                break;
            }
            output.start()?;
        }

        if self.cancelled() {
            output.abort()?;
        } else {
            pad_to_buffer(&output)?;
        }
        output.close();
        Ok(())
    }
}

/// Complete a partial native buffer with silence so the tail of the sound
/// is played before the stream stops
fn pad_to_buffer(output: &OutputStream) -> Result<(), AudioError> {
    let left = output.leftover_len();
    if left == 0 || !output.is_started() {
        return Ok(());
    }
    output.write(&vec![0; output.bytes_per_buffer() - left])
}
