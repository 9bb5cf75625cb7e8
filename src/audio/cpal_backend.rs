//! Native audio through cpal
//!
//! cpal drives streams through callbacks and its `Stream` cannot leave the
//! thread that built it, so every opened stream gets a dedicated thread that
//! owns it and obeys start/stop/close commands. Captured samples reach the
//! blocking `read` side through a bounded channel; bytes passed to `write`
//! travel the other way and the output callback plays silence on underrun.
//!
//! Stopping or closing an output stream first waits for the written bytes to
//! be played. Only `abort` throws them away.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::native::{
    DeviceInfo, Direction, NativeAudio, SampleFormat, StreamHandle, StreamParameters,
};
use crate::constants::NATIVE_QUEUE_CAPACITY;
use crate::error::AudioError;

/// How often blocked reads and writes re-check whether the stream stopped
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often a stopping output stream checks whether its backlog played
const DRAIN_POLL: Duration = Duration::from_millis(5);

/// Extra time granted to play out a backlog before giving up on it
const DRAIN_GRACE: Duration = Duration::from_millis(500);

enum Command {
    Start(Sender<Result<(), AudioError>>),
    Stop(Sender<Result<(), AudioError>>),
    Close,
}

/// Written output shared between `write` and the device callback
#[derive(Debug, Default)]
struct Playout {
    /// Bytes written but not yet played
    backlog: AtomicUsize,
    /// Tells the callback to drop the chunk it is part way through
    flush: AtomicBool,
}

impl Playout {
    /// Wait until less than one sample is left unplayed.
    /// Returns false if `timeout` expired first.
    fn wait_drained(&self, sample_size: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.backlog.load(Ordering::SeqCst) >= sample_size {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(DRAIN_POLL);
        }
        true
    }

    /// Drop everything queued for the callback
    fn discard(&self, rx: &Receiver<Vec<u8>>) {
        while let Ok(chunk) = rx.try_recv() {
            self.backlog.fetch_sub(chunk.len(), Ordering::SeqCst);
        }
        self.flush.store(true, Ordering::SeqCst);
    }
}

struct CpalStream {
    params: StreamParameters,
    direction: Direction,
    commands: Sender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    /// Captured bytes for input streams, bytes to play for output streams
    data_tx: Sender<Vec<u8>>,
    data_rx: Receiver<Vec<u8>>,
    /// Captured bytes received but not yet returned by `read`
    carry: Mutex<VecDeque<u8>>,
    overflows: Arc<AtomicU64>,
    underruns: Arc<AtomicU64>,
    playout: Arc<Playout>,
}

impl CpalStream {
    fn request(
        &self,
        make: impl FnOnce(Sender<Result<(), AudioError>>) -> Command,
    ) -> Result<(), AudioError> {
        let (tx, rx) = bounded(1);
        self.commands
            .send(make(tx))
            .map_err(|_| AudioError::StreamClosed)?;
        rx.recv().map_err(|_| AudioError::StreamClosed)?
    }

    /// Let a started output stream play what was written to it, plus the
    /// device buffer that is still sounding
    fn play_out(&self) {
        if self.direction != Direction::Output || !self.started.load(Ordering::SeqCst) {
            return;
        }

        let rate = self.params.sample_rate.max(1) as u64;
        let bytes_per_second = (rate * self.params.frame_size() as u64).max(1);
        let backlog = self.playout.backlog.load(Ordering::SeqCst) as u64;
        let timeout = Duration::from_millis(backlog * 1000 / bytes_per_second) + DRAIN_GRACE;

        if self
            .playout
            .wait_drained(self.params.sample_format.sample_size(), timeout)
        {
            let last_buffer = self.params.frames_per_buffer as u64 * 1000 / rate;
            thread::sleep(Duration::from_millis(last_buffer));
        } else {
            tracing::warn!(
                "Output stream did not play out in {:?}, {} bytes dropped",
                timeout,
                self.playout.backlog.load(Ordering::SeqCst)
            );
        }
    }

    /// Drop queued data belonging to a stopped session
    fn discard(&self) {
        match self.direction {
            Direction::Output => self.playout.discard(&self.data_rx),
            Direction::Input => {
                while self.data_rx.try_recv().is_ok() {}
                self.carry.lock().clear();
            }
        }
    }

    fn halt(&self) -> Result<(), AudioError> {
        self.started.store(false, Ordering::SeqCst);
        self.request(Command::Stop)?;
        self.discard();
        Ok(())
    }
}

/// cpal-backed implementation of [`NativeAudio`] on the default host
pub struct CpalAudio {
    streams: Mutex<HashMap<StreamHandle, Arc<CpalStream>>>,
    next_handle: AtomicU64,
}

impl CpalAudio {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn stream(&self, handle: StreamHandle) -> Result<Arc<CpalStream>, AudioError> {
        self.streams
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(AudioError::InvalidHandle(handle))
    }

    /// Samples dropped because `read` did not keep up with the device
    pub fn overflows(&self, handle: StreamHandle) -> u64 {
        self.stream(handle)
            .map(|s| s.overflows.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Output callbacks that ran out of written data
    pub fn underruns(&self, handle: StreamHandle) -> u64 {
        self.stream(handle)
            .map(|s| s.underruns.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl Default for CpalAudio {
    fn default() -> Self {
        Self::new()
    }
}

fn find_device(index: usize) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    host.devices()?
        .nth(index)
        .ok_or(AudioError::DeviceNotFound(index))
}

fn max_channels<I>(configs: Result<I, cpal::SupportedStreamConfigsError>) -> u16
where
    I: Iterator<Item = cpal::SupportedStreamConfigRange>,
{
    configs
        .map(|configs| configs.map(|c| c.channels()).max().unwrap_or(0))
        .unwrap_or(0)
}

fn input_callback<T, F>(
    tx: Sender<Vec<u8>>,
    encode: F,
    overflows: Arc<AtomicU64>,
) -> impl FnMut(&[T], &cpal::InputCallbackInfo) + Send + 'static
where
    T: Copy + Send + 'static,
    F: Fn(T, &mut Vec<u8>) + Send + 'static,
{
    move |data: &[T], _: &cpal::InputCallbackInfo| {
        let mut bytes = Vec::with_capacity(data.len() * std::mem::size_of::<T>());
        for &sample in data {
            encode(sample, &mut bytes);
        }
        if tx.try_send(bytes).is_err() {
            overflows.fetch_add(data.len() as u64, Ordering::Relaxed);
        }
    }
}

/// Feeds output callbacks from the queue of written bytes
struct OutputFeeder {
    rx: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    sample_size: usize,
    playout: Arc<Playout>,
}

impl OutputFeeder {
    fn new(rx: Receiver<Vec<u8>>, sample_size: usize, playout: Arc<Playout>) -> Self {
        Self {
            rx,
            pending: VecDeque::new(),
            sample_size,
            playout,
        }
    }

    /// Fill `data`, playing silence for whatever is missing.
    /// Returns true if the queue ran dry.
    fn fill<T, F>(&mut self, data: &mut [T], decode: &F) -> bool
    where
        T: cpal::Sample,
        F: Fn(&[u8]) -> T,
    {
        if self.playout.flush.swap(false, Ordering::SeqCst) {
            self.playout
                .backlog
                .fetch_sub(self.pending.len(), Ordering::SeqCst);
            self.pending.clear();
        }

        let mut sample_bytes = [0u8; 4];
        let mut starved = false;
        let mut played = 0;

        for sample in data.iter_mut() {
            while self.pending.len() < self.sample_size {
                match self.rx.try_recv() {
                    Ok(chunk) => self.pending.extend(chunk),
                    Err(_) => break,
                }
            }

            if self.pending.len() < self.sample_size {
                starved = true;
                *sample = T::EQUILIBRIUM;
                continue;
            }

            for (slot, byte) in sample_bytes
                .iter_mut()
                .zip(self.pending.drain(..self.sample_size))
            {
                *slot = byte;
            }
            *sample = decode(&sample_bytes[..self.sample_size]);
            played += self.sample_size;
        }

        if played > 0 {
            self.playout.backlog.fetch_sub(played, Ordering::SeqCst);
        }
        starved
    }
}

fn output_callback<T, F>(
    rx: Receiver<Vec<u8>>,
    sample_size: usize,
    decode: F,
    underruns: Arc<AtomicU64>,
    playout: Arc<Playout>,
) -> impl FnMut(&mut [T], &cpal::OutputCallbackInfo) + Send + 'static
where
    T: cpal::Sample + Send + 'static,
    F: Fn(&[u8]) -> T + Send + 'static,
{
    let mut feeder = OutputFeeder::new(rx, sample_size, playout);

    move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
        if feeder.fill(data, &decode) {
            underruns.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn build_stream(
    params: &StreamParameters,
    direction: Direction,
    data_tx: Sender<Vec<u8>>,
    data_rx: Receiver<Vec<u8>>,
    overflows: Arc<AtomicU64>,
    underruns: Arc<AtomicU64>,
    playout: Arc<Playout>,
) -> Result<cpal::Stream, AudioError> {
    let device = find_device(params.device_index)?;
    let config = cpal::StreamConfig {
        channels: params.channels,
        sample_rate: cpal::SampleRate(params.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let on_error = |err: cpal::StreamError| {
        tracing::error!("Audio stream error: {}", err);
    };

    let stream = match (direction, params.sample_format) {
        (Direction::Input, SampleFormat::Int16) => device.build_input_stream(
            &config,
            input_callback(
                data_tx,
                |s: i16, out: &mut Vec<u8>| out.extend_from_slice(&s.to_le_bytes()),
                overflows,
            ),
            on_error,
            None,
        )?,
        (Direction::Input, SampleFormat::Float32) => device.build_input_stream(
            &config,
            input_callback(
                data_tx,
                |s: f32, out: &mut Vec<u8>| out.extend_from_slice(&s.to_le_bytes()),
                overflows,
            ),
            on_error,
            None,
        )?,
        (Direction::Output, SampleFormat::Int16) => device.build_output_stream(
            &config,
            output_callback(
                data_rx,
                2,
                |b: &[u8]| i16::from_le_bytes([b[0], b[1]]),
                underruns,
                playout,
            ),
            on_error,
            None,
        )?,
        (Direction::Output, SampleFormat::Float32) => device.build_output_stream(
            &config,
            output_callback(
                data_rx,
                4,
                |b: &[u8]| f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                underruns,
                playout,
            ),
            on_error,
            None,
        )?,
        (_, format) => {
            return Err(AudioError::UnsupportedFormat(format!("{:?}", format)));
        }
    };

    Ok(stream)
}

fn run_stream(stream: cpal::Stream, commands: Receiver<Command>) {
    // Disconnection of the command channel means the handle was dropped
    while let Ok(command) = commands.recv() {
        match command {
            Command::Start(reply) => {
                let _ = reply.send(stream.play().map_err(AudioError::from));
            }
            Command::Stop(reply) => {
                let _ = reply.send(stream.pause().map_err(AudioError::from));
            }
            Command::Close => break,
        }
    }
}

impl NativeAudio for CpalAudio {
    fn open(
        &self,
        params: &StreamParameters,
        direction: Direction,
    ) -> Result<StreamHandle, AudioError> {
        if !matches!(params.sample_format, SampleFormat::Int16 | SampleFormat::Float32) {
            return Err(AudioError::UnsupportedFormat(format!("{:?}", params.sample_format)));
        }

        let handle = StreamHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let (command_tx, command_rx) = bounded::<Command>(4);
        let (data_tx, data_rx) = bounded::<Vec<u8>>(NATIVE_QUEUE_CAPACITY);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let overflows = Arc::new(AtomicU64::new(0));
        let underruns = Arc::new(AtomicU64::new(0));
        let playout = Arc::new(Playout::default());

        let thread = {
            let params = *params;
            let data_tx = data_tx.clone();
            let data_rx = data_rx.clone();
            let overflows = overflows.clone();
            let underruns = underruns.clone();
            let playout = playout.clone();

            thread::Builder::new()
                .name(format!("audio-stream-{}", handle.0))
                .spawn(move || {
                    match build_stream(
                        &params, direction, data_tx, data_rx, overflows, underruns, playout,
                    ) {
                        Ok(stream) => {
                            // Some hosts start streams on build
                            let _ = stream.pause();
                            let _ = ready_tx.send(Ok(()));
                            run_stream(stream, command_rx);
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                        }
                    }
                })
                .map_err(|e| AudioError::Backend(e.to_string()))?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(AudioError::Backend("audio stream thread exited".into()));
            }
        }

        self.streams.lock().insert(
            handle,
            Arc::new(CpalStream {
                params: *params,
                direction,
                commands: command_tx,
                thread: Mutex::new(Some(thread)),
                started: AtomicBool::new(false),
                data_tx,
                data_rx,
                carry: Mutex::new(VecDeque::new()),
                overflows,
                underruns,
                playout,
            }),
        );

        Ok(handle)
    }

    fn start(&self, handle: StreamHandle) -> Result<(), AudioError> {
        let stream = self.stream(handle)?;
        stream.request(Command::Start)?;
        stream.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self, handle: StreamHandle) -> Result<(), AudioError> {
        let stream = self.stream(handle)?;
        stream.play_out();
        stream.halt()
    }

    fn abort(&self, handle: StreamHandle) -> Result<(), AudioError> {
        self.stream(handle)?.halt()
    }

    fn close(&self, handle: StreamHandle) {
        let Some(stream) = self.streams.lock().remove(&handle) else {
            return;
        };
        stream.play_out();
        stream.started.store(false, Ordering::SeqCst);
        let _ = stream.commands.send(Command::Close);
        if let Some(thread) = stream.thread.lock().take() {
            if thread.join().is_err() {
                tracing::error!("Audio stream thread {} panicked", handle);
            }
        };
    }

    fn read(&self, handle: StreamHandle, frames: usize) -> Result<Vec<u8>, AudioError> {
        let stream = self.stream(handle)?;
        let needed = frames * stream.params.frame_size();
        let mut carry = stream.carry.lock();

        while carry.len() < needed {
            if !stream.started.load(Ordering::SeqCst) {
                return Err(AudioError::StreamError("stream not started".into()));
            }
            match stream.data_rx.recv_timeout(POLL_INTERVAL) {
                Ok(chunk) => carry.extend(chunk),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(AudioError::StreamClosed),
            }
        }

        Ok(carry.drain(..needed).collect())
    }

    fn write(&self, handle: StreamHandle, bytes: &[u8]) -> Result<(), AudioError> {
        let stream = self.stream(handle)?;
        let mut chunk = bytes.to_vec();
        let backlog = &stream.playout.backlog;
        backlog.fetch_add(chunk.len(), Ordering::SeqCst);

        let result = loop {
            if !stream.started.load(Ordering::SeqCst) {
                break Err(AudioError::StreamError("stream not started".into()));
            }
            match stream.data_tx.send_timeout(chunk, POLL_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => chunk = back,
                Err(SendTimeoutError::Disconnected(_)) => break Err(AudioError::StreamClosed),
            }
        };

        backlog.fetch_sub(bytes.len(), Ordering::SeqCst);
        result
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        let host = cpal::default_host();
        let default_input = host.default_input_device().and_then(|d| d.name().ok());
        let default_output = host.default_output_device().and_then(|d| d.name().ok());

        let devices = match host.devices() {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!("Failed to enumerate audio devices: {}", e);
                return Vec::new();
            }
        };

        devices
            .enumerate()
            .map(|(index, device)| {
                let name = device.name().unwrap_or_else(|_| format!("Device {}", index));
                let default_sample_rate = device
                    .default_output_config()
                    .or_else(|_| device.default_input_config())
                    .map(|c| c.sample_rate().0)
                    .unwrap_or(0);

                DeviceInfo {
                    index,
                    max_input_channels: max_channels(device.supported_input_configs()),
                    max_output_channels: max_channels(device.supported_output_configs()),
                    default_sample_rate,
                    is_default_input: default_input.as_deref() == Some(name.as_str()),
                    is_default_output: default_output.as_deref() == Some(name.as_str()),
                    name,
                }
            })
            .collect()
    }
}

impl Drop for CpalAudio {
    fn drop(&mut self) {
        let handles: Vec<_> = self.streams.lock().keys().copied().collect();
        for handle in handles {
            self.close(handle);
        }
    }
}
