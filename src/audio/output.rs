//! Native output stream with chunked writes
//!
//! The native device accepts whole buffers of `frames_per_buffer` frames.
//! [`OutputStream::write`] takes any number of bytes, writes every complete
//! buffer and keeps the remainder for the next call. Stopping the stream
//! discards that remainder instead of padding it out to a full buffer, then
//! lets the device play what it was already given. Aborting drops that too.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::audio::buffer::ChunkBuffer;
use crate::audio::gain::apply_gain;
use crate::audio::native::{Direction, NativeAudio, StreamHandle, StreamParameters};
use crate::error::AudioError;

struct OutputState {
    handle: Option<StreamHandle>,
    started: bool,
    pending: ChunkBuffer,
    volume: f32,
    scratch: Vec<u8>,
}

/// Output stream owning one native handle
pub struct OutputStream {
    audio: Arc<dyn NativeAudio>,
    params: StreamParameters,
    state: Mutex<OutputState>,
}

impl OutputStream {
    /// Open the native stream. It is not started.
    pub fn open(
        audio: Arc<dyn NativeAudio>,
        params: StreamParameters,
    ) -> Result<Self, AudioError> {
        let handle = audio.open(&params, Direction::Output)?;
        tracing::debug!(
            "Opened playback stream {} on device {} ({} Hz, {} ch, {} bytes per buffer)",
            handle,
            params.device_index,
            params.sample_rate,
            params.channels,
            params.bytes_per_buffer()
        );

        Ok(Self {
            audio,
            params,
            state: Mutex::new(OutputState {
                handle: Some(handle),
                started: false,
                pending: ChunkBuffer::new(params.bytes_per_buffer()),
                volume: 1.0,
                scratch: Vec::new(),
            }),
        })
    }

    pub fn params(&self) -> &StreamParameters {
        &self.params
    }

    /// Bytes in one native write
    pub fn bytes_per_buffer(&self) -> usize {
        self.params.bytes_per_buffer()
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().handle.is_none()
    }

    /// Bytes held back until the next write completes a buffer
    pub fn leftover_len(&self) -> usize {
        self.state.lock().pending.leftover_len()
    }

    /// Set software volume (0.0 - 1.0)
    pub fn set_volume(&self, volume: f32) {
        self.state.lock().volume = volume.clamp(0.0, 1.0);
    }

    pub fn volume(&self) -> f32 {
        self.state.lock().volume
    }

    /// Start the native stream. No-op if started or closed.
    pub fn start(&self) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        match state.handle {
            Some(handle) if !state.started => {
                self.audio.start(handle)?;
                state.started = true;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Stop the native stream once written buffers have played. Any partial
    /// buffer is discarded, even when the native stop fails.
    pub fn stop(&self) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        Self::stop_locked(&*self.audio, &mut state)
    }

    /// Stop the native stream without playing what is still queued
    pub fn abort(&self) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        state.pending.clear();
        match state.handle {
            Some(handle) if state.started => {
                self.audio.abort(handle)?;
                state.started = false;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn stop_locked(audio: &dyn NativeAudio, state: &mut OutputState) -> Result<(), AudioError> {
        state.pending.clear();
        match state.handle {
            Some(handle) if state.started => {
                audio.stop(handle)?;
                state.started = false;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Write `bytes`, issuing one native write per complete buffer.
    ///
    /// Writes to a stream that is not started or already closed are dropped.
    pub fn write(&self, bytes: &[u8]) -> Result<(), AudioError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let handle = match state.handle {
            Some(handle) if state.started => handle,
            _ => return Ok(()),
        };

        let audio = &*self.audio;
        let format = self.params.sample_format;
        let volume = state.volume;
        let scratch = &mut state.scratch;

        state.pending.push(bytes, |chunk| {
            if volume < 1.0 {
                scratch.clear();
                scratch.extend_from_slice(chunk);
                apply_gain(&mut scratch[..], format, volume);
                audio.write(handle, &scratch[..])
            } else {
                audio.write(handle, chunk)
            }
        })
    }

    /// Stop and release the native stream. Further calls are no-ops.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if let Err(e) = Self::stop_locked(&*self.audio, &mut state) {
            tracing::error!("Failed to stop playback stream: {}", e);
        }
        if let Some(handle) = state.handle.take() {
            self.audio.close(handle);
            state.started = false;
            state.pending.clear();
            tracing::debug!("Closed playback stream {}", handle);
        }
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::native::SampleFormat;
    use crate::audio::virtual_device::{NativeOp, VirtualAudio};
    use proptest::prelude::*;

    /// 50 mono 16-bit frames = 100 bytes per buffer
    fn open(audio: &Arc<VirtualAudio>) -> (OutputStream, StreamHandle) {
        let params =
            StreamParameters::new(0, 8_000, 1, SampleFormat::Int16).with_frames_per_buffer(50);
        let before = audio.opened_total();
        let stream = OutputStream::open(audio.clone(), params).unwrap();
        assert_eq!(audio.opened_total(), before + 1);
        // handles are allocated sequentially starting at 1
        let handle = StreamHandle(audio.opened_total() as u64);
        (stream, handle)
    }

    #[test]
    fn test_short_write_then_completion() {
        let audio = Arc::new(VirtualAudio::new(1));
        let (stream, handle) = open(&audio);
        stream.start().unwrap();

        stream.write(&[1; 60]).unwrap();
        assert!(audio.writes(handle).is_empty());
        assert_eq!(stream.leftover_len(), 60);

        stream.write(&[2; 50]).unwrap();
        let writes = audio.writes(handle);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 100);
        assert_eq!(&writes[0][..60], &[1; 60][..]);
        assert_eq!(&writes[0][60..], &[2; 40][..]);
        assert_eq!(stream.leftover_len(), 10);
    }

    #[test]
    fn test_large_write_is_chunked() {
        let audio = Arc::new(VirtualAudio::new(1));
        let (stream, handle) = open(&audio);
        stream.start().unwrap();

        stream.write(&[3; 350]).unwrap();
        let writes = audio.writes(handle);
        assert_eq!(writes.len(), 3);
        assert!(writes.iter().all(|w| w.len() == 100));
        assert_eq!(stream.leftover_len(), 50);
    }

    #[test]
    fn test_write_before_start_is_dropped() {
        let audio = Arc::new(VirtualAudio::new(1));
        let (stream, handle) = open(&audio);

        stream.write(&[1; 250]).unwrap();
        assert!(audio.writes(handle).is_empty());
        assert_eq!(stream.leftover_len(), 0);
    }

    #[test]
    fn test_stop_discards_leftover() {
        let audio = Arc::new(VirtualAudio::new(1));
        let (stream, handle) = open(&audio);
        stream.start().unwrap();

        stream.write(&[9; 70]).unwrap();
        stream.stop().unwrap();
        assert_eq!(stream.leftover_len(), 0);
        assert!(!stream.is_started());

        stream.start().unwrap();
        stream.write(&[1; 40]).unwrap();
        assert_eq!(stream.leftover_len(), 40);

        stream.write(&[1; 60]).unwrap();
        let writes = audio.writes(handle);
        assert_eq!(writes, vec![vec![1; 100]]);
    }

    #[test]
    fn test_failed_stop_still_discards_leftover() {
        let audio = Arc::new(VirtualAudio::new(1));
        let (stream, handle) = open(&audio);
        stream.start().unwrap();
        stream.write(&[5; 30]).unwrap();

        audio.fail_next(NativeOp::Stop, AudioError::Backend("device lost".into()));
        assert!(stream.stop().is_err());
        assert_eq!(stream.leftover_len(), 0);

        // the stream is still running; the next buffer starts clean
        stream.write(&[6; 100]).unwrap();
        assert_eq!(audio.writes(handle), vec![vec![6; 100]]);
    }

    #[test]
    fn test_abort_discards_without_playing() {
        let audio = Arc::new(VirtualAudio::new(1));
        let (stream, handle) = open(&audio);
        stream.start().unwrap();
        stream.write(&[4; 130]).unwrap();

        stream.abort().unwrap();
        assert!(!stream.is_started());
        assert!(!audio.is_started(handle));
        assert_eq!(stream.leftover_len(), 0);
        assert_eq!(audio.aborted_total(), 1);

        // aborting a stopped stream does not reach the device
        stream.abort().unwrap();
        assert_eq!(audio.aborted_total(), 1);
    }

    #[test]
    fn test_write_after_close_is_noop() {
        let audio = Arc::new(VirtualAudio::new(1));
        let (stream, handle) = open(&audio);
        stream.start().unwrap();
        stream.close();

        assert!(stream.is_closed());
        assert!(!audio.is_open(handle));
        assert!(stream.write(&[1; 100]).is_ok());
        assert!(stream.start().is_ok());
        assert!(audio.writes(handle).is_empty());
        // second close is harmless
        stream.close();
    }

    #[test]
    fn test_drop_closes_native_stream() {
        let audio = Arc::new(VirtualAudio::new(1));
        let (stream, handle) = open(&audio);
        stream.start().unwrap();
        drop(stream);
        assert!(!audio.is_open(handle));
    }

    #[test]
    fn test_native_write_error_propagates() {
        let audio = Arc::new(VirtualAudio::new(1));
        let (stream, _) = open(&audio);
        stream.start().unwrap();

        audio.fail_next(NativeOp::Write, AudioError::StreamError("underflow".into()));
        assert_eq!(
            stream.write(&[0; 100]),
            Err(AudioError::StreamError("underflow".into()))
        );
    }

    #[test]
    fn test_open_error_propagates() {
        let audio = Arc::new(VirtualAudio::new(1));
        let params = StreamParameters::new(3, 8_000, 1, SampleFormat::Int16);
        assert_eq!(
            OutputStream::open(audio, params).err(),
            Some(AudioError::DeviceNotFound(3))
        );
    }

    #[test]
    fn test_volume_applied_to_chunks() {
        let audio = Arc::new(VirtualAudio::new(1));
        let (stream, handle) = open(&audio);
        stream.start().unwrap();
        stream.set_volume(0.5);

        let samples: Vec<u8> = std::iter::repeat(1000i16)
            .take(50)
            .flat_map(|s| s.to_le_bytes())
            .collect();
        stream.write(&samples).unwrap();

        let writes = audio.writes(handle);
        let first = i16::from_le_bytes([writes[0][0], writes[0][1]]);
        assert_eq!(first, 500);
        assert_eq!(stream.volume(), 0.5);
    }

    proptest! {
        #[test]
        fn prop_split_writes_are_associative(
            data in proptest::collection::vec(any::<u8>(), 0..500),
            split in 0usize..500,
        ) {
            let split = split.min(data.len());

            let audio = Arc::new(VirtualAudio::new(1));
            let (whole, whole_handle) = open(&audio);
            whole.start().unwrap();
            whole.write(&data).unwrap();

            let (parts, parts_handle) = open(&audio);
            parts.start().unwrap();
            parts.write(&data[..split]).unwrap();
            parts.write(&data[split..]).unwrap();

            prop_assert_eq!(audio.writes(whole_handle), audio.writes(parts_handle));
            prop_assert_eq!(whole.leftover_len(), parts.leftover_len());
        }
    }
}
