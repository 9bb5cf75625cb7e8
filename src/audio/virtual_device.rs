//! In-memory audio backend
//!
//! Records buffers written to output streams and serves scripted frames to
//! input streams. Input devices with nothing scripted capture silence. A
//! failure can be armed for the next call of a given operation.
//!
//! Only the most recent buffers of each stream and the most recently closed
//! streams are retained, so a long running loop stays bounded. The running
//! totals count everything.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::audio::native::{DeviceInfo, Direction, NativeAudio, StreamHandle, StreamParameters};
use crate::error::AudioError;

/// Buffers kept per stream
const RETAINED_WRITES: usize = 4096;

/// Closed streams whose buffers are kept
const RETAINED_CLOSED_STREAMS: usize = 64;

/// Native operation a failure can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeOp {
    Open,
    Start,
    Stop,
    Read,
    Write,
}

#[derive(Debug)]
struct VirtualStream {
    params: StreamParameters,
    direction: Direction,
    started: bool,
    writes: VecDeque<Vec<u8>>,
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<StreamHandle, VirtualStream>,
    /// Writes of streams that were already closed, by handle
    closed_writes: HashMap<StreamHandle, VecDeque<Vec<u8>>>,
    /// Closing order of `closed_writes`, oldest first
    closed_order: VecDeque<StreamHandle>,
    capture: HashMap<usize, VecDeque<Vec<u8>>>,
    failures: HashMap<NativeOp, AudioError>,
    opened_total: usize,
    aborted_total: usize,
    written_buffers: u64,
    written_bytes: u64,
}

impl State {
    fn retained(&self, handle: StreamHandle) -> Vec<Vec<u8>> {
        self.streams
            .get(&handle)
            .map(|s| &s.writes)
            .or_else(|| self.closed_writes.get(&handle))
            .map(|writes| writes.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn halt(&mut self, handle: StreamHandle) -> Result<(), AudioError> {
        VirtualAudio::take_failure(self, NativeOp::Stop)?;

        let stream = self
            .streams
            .get_mut(&handle)
            .ok_or(AudioError::InvalidHandle(handle))?;
        stream.started = false;
        Ok(())
    }
}

/// Virtual audio device set
pub struct VirtualAudio {
    devices: Vec<DeviceInfo>,
    state: Mutex<State>,
    next_handle: AtomicU64,
    reads: AtomicU64,
}

impl VirtualAudio {
    /// Create `count` full-duplex devices; device 0 is the default for
    /// both directions
    pub fn new(count: usize) -> Self {
        let devices = (0..count)
            .map(|index| DeviceInfo {
                index,
                name: format!("Virtual Device {}", index),
                max_input_channels: 2,
                max_output_channels: 2,
                default_sample_rate: 48_000,
                is_default_input: index == 0,
                is_default_output: index == 0,
            })
            .collect();

        Self {
            devices,
            state: Mutex::new(State::default()),
            next_handle: AtomicU64::new(1),
            reads: AtomicU64::new(0),
        }
    }

    /// Queue a frame to be returned by the next read on `device`
    pub fn push_capture(&self, device: usize, bytes: Vec<u8>) {
        self.state.lock().capture.entry(device).or_default().push_back(bytes);
    }

    /// Make the next call of `op` fail with `error`
    pub fn fail_next(&self, op: NativeOp, error: AudioError) {
        self.state.lock().failures.insert(op, error);
    }

    /// Number of streams currently open
    pub fn open_streams(&self) -> usize {
        self.state.lock().streams.len()
    }

    /// Number of streams currently open for a direction
    pub fn open_streams_for(&self, direction: Direction) -> usize {
        self.state
            .lock()
            .streams
            .values()
            .filter(|s| s.direction == direction)
            .count()
    }

    /// Number of successful opens since creation
    pub fn opened_total(&self) -> usize {
        self.state.lock().opened_total
    }

    pub fn is_open(&self, handle: StreamHandle) -> bool {
        self.state.lock().streams.contains_key(&handle)
    }

    pub fn is_started(&self, handle: StreamHandle) -> bool {
        self.state
            .lock()
            .streams
            .get(&handle)
            .map(|s| s.started)
            .unwrap_or(false)
    }

    /// Parameters a still-open stream was opened with
    pub fn params(&self, handle: StreamHandle) -> Option<StreamParameters> {
        self.state.lock().streams.get(&handle).map(|s| s.params)
    }

    /// Native reads performed on any stream
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Stops that discarded unplayed output
    pub fn aborted_total(&self) -> usize {
        self.state.lock().aborted_total
    }

    /// Buffers written to any stream since creation
    pub fn written_buffers(&self) -> u64 {
        self.state.lock().written_buffers
    }

    /// Bytes written to any stream since creation
    pub fn written_bytes(&self) -> u64 {
        self.state.lock().written_bytes
    }

    /// Retained buffers of a stream, whether it is still open or not
    pub fn writes(&self, handle: StreamHandle) -> Vec<Vec<u8>> {
        self.state.lock().retained(handle)
    }

    /// Every retained buffer of any output stream, in handle order
    pub fn all_writes(&self) -> Vec<Vec<u8>> {
        let state = self.state.lock();
        let mut handles: Vec<_> = state
            .streams
            .keys()
            .chain(state.closed_writes.keys())
            .copied()
            .collect();
        handles.sort_by_key(|h| h.0);

        handles.into_iter().flat_map(|h| state.retained(h)).collect()
    }

    fn take_failure(state: &mut State, op: NativeOp) -> Result<(), AudioError> {
        match state.failures.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for VirtualAudio {
    fn default() -> Self {
        Self::new(4)
    }
}

impl NativeAudio for VirtualAudio {
    fn open(
        &self,
        params: &StreamParameters,
        direction: Direction,
    ) -> Result<StreamHandle, AudioError> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state, NativeOp::Open)?;

        if params.device_index >= self.devices.len() {
            return Err(AudioError::DeviceNotFound(params.device_index));
        }

        let handle = StreamHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        state.streams.insert(
            handle,
            VirtualStream {
                params: *params,
                direction,
                started: false,
                writes: VecDeque::new(),
            },
        );
        state.opened_total += 1;

        Ok(handle)
    }

    fn start(&self, handle: StreamHandle) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state, NativeOp::Start)?;

        let stream = state
            .streams
            .get_mut(&handle)
            .ok_or(AudioError::InvalidHandle(handle))?;
        stream.started = true;
        Ok(())
    }

    fn stop(&self, handle: StreamHandle) -> Result<(), AudioError> {
        self.state.lock().halt(handle)
    }

    fn abort(&self, handle: StreamHandle) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        state.halt(handle)?;
        state.aborted_total += 1;
        Ok(())
    }

    fn close(&self, handle: StreamHandle) {
        let mut state = self.state.lock();
        let Some(stream) = state.streams.remove(&handle) else {
            return;
        };
        if stream.direction != Direction::Output {
            return;
        }

        state.closed_writes.insert(handle, stream.writes);
        state.closed_order.push_back(handle);
        while state.closed_order.len() > RETAINED_CLOSED_STREAMS {
            if let Some(oldest) = state.closed_order.pop_front() {
                state.closed_writes.remove(&oldest);
            }
        }
    }

    fn read(&self, handle: StreamHandle, frames: usize) -> Result<Vec<u8>, AudioError> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state, NativeOp::Read)?;

        let (device, size) = {
            let stream = state
                .streams
                .get(&handle)
                .ok_or(AudioError::InvalidHandle(handle))?;
            if !stream.started {
                return Err(AudioError::StreamError("stream not started".into()));
            }
            (stream.params.device_index, frames * stream.params.frame_size())
        };

        self.reads.fetch_add(1, Ordering::SeqCst);

        let bytes = state
            .capture
            .get_mut(&device)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| vec![0; size]);
        Ok(bytes)
    }

    fn write(&self, handle: StreamHandle, bytes: &[u8]) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state, NativeOp::Write)?;

        let stream = state
            .streams
            .get_mut(&handle)
            .ok_or(AudioError::InvalidHandle(handle))?;
        if !stream.started {
            return Err(AudioError::StreamError("stream not started".into()));
        }
        stream.writes.push_back(bytes.to_vec());
        if stream.writes.len() > RETAINED_WRITES {
            stream.writes.pop_front();
        }

        state.written_buffers += 1;
        state.written_bytes += bytes.len() as u64;
        Ok(())
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.clone()
    }
}
