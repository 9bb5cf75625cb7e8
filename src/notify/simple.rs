//! In-memory clip backend
//!
//! The sound is decoded once when the clip is created and every play cycle
//! replays the decoded buffer.

use std::path::Path;
use std::sync::Arc;

use crate::error::ClipError;
use crate::notify::clip::{AudioClip, ClipContext, ClipCore, PcmSink, PcmSource};
use crate::notify::resource::{decode_all, PcmFormat};

struct MemorySource {
    format: PcmFormat,
    pcm: Arc<[u8]>,
    block: usize,
}

impl PcmSource for MemorySource {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn render(
        &self,
        sink: &mut PcmSink<'_>,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<(), ClipError> {
        for chunk in self.pcm.chunks(self.block) {
            if cancelled() {
                break;
            }
            sink(chunk)?;
        }
        Ok(())
    }
}

/// Clip that plays a fully decoded sound
pub struct SimplePlaybackClip {
    core: ClipCore,
}

impl SimplePlaybackClip {
    pub fn load(key: &str, path: &Path, ctx: ClipContext) -> Result<Self, ClipError> {
        let (format, pcm) = decode_all(path)?;
        tracing::debug!(
            "Loaded sound {} ({} Hz, {} ch, {} bytes)",
            key,
            format.sample_rate,
            format.channels,
            pcm.len()
        );

        // hand the sink roughly one native buffer at a time
        let block = (format.sample_rate as usize * format.channels as usize * 2
            * ctx.millis_per_buffer.max(1) as usize
            / 1000)
            .max(2);

        let source = MemorySource {
            format,
            pcm: pcm.into(),
            block,
        };
        Ok(Self {
            core: ClipCore::new(key.to_string(), ctx, Arc::new(source)),
        })
    }
}

impl AudioClip for SimplePlaybackClip {
    fn key(&self) -> &str {
        self.core.key()
    }

    fn play(&self) {
        self.core.play()
    }

    fn play_in_loop(&self, interval_ms: u64) {
        self.core.play_in_loop(interval_ms)
    }

    fn stop(&self) {
        self.core.stop()
    }

    fn internal_stop(&self) {
        self.core.internal_stop()
    }

    fn is_playing(&self) -> bool {
        self.core.is_playing()
    }

    fn is_looping(&self) -> bool {
        self.core.is_looping()
    }

    fn loop_interval(&self) -> u64 {
        self.core.loop_interval()
    }

    fn is_invalid(&self) -> bool {
        self.core.is_invalid()
    }
}
