//! Streaming clip backend
//!
//! Only the WAV header is read when the clip is created. Each play cycle
//! reopens the file and decodes it block by block while writing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::constants::STREAMING_DECODE_BLOCK;
use crate::error::ClipError;
use crate::notify::clip::{AudioClip, ClipContext, ClipCore, PcmSink, PcmSource};
use crate::notify::resource::{probe, PcmFormat, PcmReader};

struct FileSource {
    path: PathBuf,
    format: PcmFormat,
}

impl PcmSource for FileSource {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn render(
        &self,
        sink: &mut PcmSink<'_>,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<(), ClipError> {
        let mut reader = PcmReader::open(&self.path)?;
        if reader.format() != self.format {
            return Err(ClipError::Decode(format!(
                "{} changed format while in use",
                self.path.display()
            )));
        }

        let mut block = Vec::with_capacity(STREAMING_DECODE_BLOCK * 2);
        while !cancelled() {
            block.clear();
            if reader.next_block(STREAMING_DECODE_BLOCK, &mut block)? == 0 {
                break;
            }
            sink(&block)?;
        }
        Ok(())
    }
}

/// Clip that decodes its sound while playing
pub struct StreamingClip {
    core: ClipCore,
}

impl StreamingClip {
    pub fn load(key: &str, path: &Path, ctx: ClipContext) -> Result<Self, ClipError> {
        let format = probe(path)?;
        let source = FileSource {
            path: path.to_path_buf(),
            format,
        };
        Ok(Self {
            core: ClipCore::new(key.to_string(), ctx, Arc::new(source)),
        })
    }
}

impl AudioClip for StreamingClip {
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
