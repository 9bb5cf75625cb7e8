//! Shared capture stream
//!
//! A [`MasterInputStream`] owns the single native input stream of one
//! device/rate/channels/format tuple. Consumers never touch it directly; each
//! one holds a [`SlaveInputStream`] which starts, stops and reads through the
//! master. The native stream is open exactly while at least one slave is
//! started.
//!
//! Every native read produces one [`Frame`] which is handed by reference to
//! all started slaves. A slave keeps at most one such pending frame; the next
//! native read replaces it whether or not it was consumed.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::audio::buffer::Frame;
use crate::audio::native::{Direction, NativeAudio, StreamHandle, StreamParameters};
use crate::error::AudioError;

type SlaveId = u64;

/// Called when a master may no longer be needed
pub type ReleaseCallback = Box<dyn Fn(&StreamParameters) + Send + Sync>;

#[derive(Debug)]
struct SlaveEntry {
    id: SlaveId,
    pending: Option<Frame>,
}

#[derive(Debug, Default)]
struct MasterState {
    handle: Option<StreamHandle>,
    slaves: Vec<SlaveEntry>,
    sequence: u64,
}

/// Sole owner of a native input stream
pub struct MasterInputStream {
    audio: Arc<dyn NativeAudio>,
    params: StreamParameters,
    state: Mutex<MasterState>,
    next_slave_id: AtomicU64,
    /// Slave objects alive, started or not
    live_slaves: AtomicUsize,
    on_release: Option<ReleaseCallback>,
}

impl MasterInputStream {
    pub fn new(audio: Arc<dyn NativeAudio>, params: StreamParameters) -> Arc<Self> {
        Self::build(audio, params, None)
    }

    /// Create a master that calls `on_release` after its last slave stops
    /// and after its last slave is dropped
    pub fn with_release(
        audio: Arc<dyn NativeAudio>,
        params: StreamParameters,
        on_release: ReleaseCallback,
    ) -> Arc<Self> {
        Self::build(audio, params, Some(on_release))
    }

    fn build(
        audio: Arc<dyn NativeAudio>,
        params: StreamParameters,
        on_release: Option<ReleaseCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            audio,
            params,
            state: Mutex::new(MasterState::default()),
            next_slave_id: AtomicU64::new(0),
            live_slaves: AtomicUsize::new(0),
            on_release,
        })
    }

    /// Create a new, stopped slave of this master
    pub fn slave(self: &Arc<Self>) -> SlaveInputStream {
        let id = self.next_slave_id.fetch_add(1, Ordering::SeqCst);
        self.live_slaves.fetch_add(1, Ordering::SeqCst);

        SlaveInputStream {
            master: Arc::clone(self),
            id,
            started: false,
        }
    }

    pub fn params(&self) -> &StreamParameters {
        &self.params
    }

    /// True while the native stream is open
    pub fn is_open(&self) -> bool {
        self.state.lock().handle.is_some()
    }

    /// Number of started slaves
    pub fn slave_count(&self) -> usize {
        self.state.lock().slaves.len()
    }

    /// True if no slave is started and no slave object is alive
    pub fn is_unused(&self) -> bool {
        self.live_slaves.load(Ordering::SeqCst) == 0 && self.state.lock().slaves.is_empty()
    }

    /// Read one native buffer and hand it to every started slave.
    ///
    /// Returns `Ok(None)` without touching the device when no slave is
    /// started. Blocks for the duration of the native read while holding
    /// the master lock.
    pub fn read(&self) -> Result<Option<Frame>, AudioError> {
        let mut state = self.state.lock();
        self.read_locked(&mut state, None)
    }

    fn read_locked(
        &self,
        state: &mut MasterState,
        initiator: Option<SlaveId>,
    ) -> Result<Option<Frame>, AudioError> {
        let handle = match state.handle {
            Some(handle) if !state.slaves.is_empty() => handle,
            _ => return Ok(None),
        };

        let bytes = self.audio.read(handle, self.params.frames_per_buffer)?;
        let frame = Frame::new(bytes, state.sequence);
        state.sequence += 1;

        for slave in state.slaves.iter_mut() {
            if Some(slave.id) != initiator {
                slave.pending = Some(frame.clone());
            }
        }

        Ok(Some(frame))
    }

    fn start_slave(&self, id: SlaveId) -> Result<(), AudioError> {
        let mut state = self.state.lock();

        if state.slaves.is_empty() {
            let handle = match state.handle {
                Some(handle) => handle,
                None => {
                    let handle = self.audio.open(&self.params, Direction::Input)?;
                    tracing::debug!(
                        "Opened capture stream {} on device {} ({} Hz, {} ch)",
                        handle,
                        self.params.device_index,
                        self.params.sample_rate,
                        self.params.channels
                    );
                    handle
                }
            };

            if let Err(e) = self.audio.start(handle) {
                self.audio.close(handle);
                state.handle = None;
                return Err(e);
            }
            state.handle = Some(handle);
        }

        state.slaves.push(SlaveEntry { id, pending: None });
        Ok(())
    }

    fn stop_slave(&self, id: SlaveId) {
        let released = {
            let mut state = self.state.lock();
            state.slaves.retain(|s| s.id != id);

            if state.slaves.is_empty() {
                if let Some(handle) = state.handle.take() {
                    self.audio.close(handle);
                    tracing::debug!(
                        "Closed capture stream {} on device {}",
                        handle,
                        self.params.device_index
                    );
                }
                true
            } else {
                false
            }
        };

        if released {
            self.notify_release();
        }
    }

    fn read_slave(&self, id: SlaveId) -> Result<Option<Frame>, AudioError> {
        let mut state = self.state.lock();

        let pending = match state.slaves.iter_mut().find(|s| s.id == id) {
            Some(slave) => slave.pending.take(),
            None => return Ok(None),
        };

        match pending {
            Some(frame) => Ok(Some(frame)),
            None => self.read_locked(&mut state, Some(id)),
        }
    }

    fn take_pending(&self, id: SlaveId) -> Option<Frame> {
        self.state
            .lock()
            .slaves
            .iter_mut()
            .find(|s| s.id == id)
            .and_then(|s| s.pending.take())
    }

    fn drop_slave(&self) {
        if self.live_slaves.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify_release();
        }
    }

    fn notify_release(&self) {
        if let Some(on_release) = &self.on_release {
            on_release(&self.params);
        }
    }
}

impl Drop for MasterInputStream {
    fn drop(&mut self) {
        if let Some(handle) = self.state.get_mut().handle.take() {
            self.audio.close(handle);
        }
    }
}

/// Per-consumer reader of a [`MasterInputStream`]
///
/// Dropping a started slave stops it.
pub struct SlaveInputStream {
    master: Arc<MasterInputStream>,
    id: SlaveId,
    started: bool,
}

impl SlaveInputStream {
    pub fn master(&self) -> &Arc<MasterInputStream> {
        &self.master
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Attach to the master, opening and starting the native stream if this
    /// is the first started slave
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.started {
            return Ok(());
        }
        self.master.start_slave(self.id)?;
        self.started = true;
        Ok(())
    }

    /// Detach from the master, closing the native stream if this was the
    /// last started slave
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.master.stop_slave(self.id);
        self.started = false;
    }

    /// Return the pending frame, or block on a native read if there is none.
    ///
    /// Returns `Ok(None)` if this slave is not started.
    pub fn read(&self) -> Result<Option<Frame>, AudioError> {
        if !self.started {
            return Ok(None);
        }
        self.master.read_slave(self.id)
    }

    /// Return the pending frame without reading from the device
    pub fn try_read(&self) -> Option<Frame> {
        if !self.started {
            return None;
        }
        self.master.take_pending(self.id)
    }
}

impl Drop for SlaveInputStream {
    fn drop(&mut self) {
        self.stop();
        self.master.drop_slave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::native::SampleFormat;
    use crate::audio::virtual_device::{NativeOp, VirtualAudio};
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    fn setup() -> (Arc<VirtualAudio>, Arc<MasterInputStream>) {
        let audio = Arc::new(VirtualAudio::new(4));
        let params = StreamParameters::new(2, 44_100, 1, SampleFormat::Int16);
        let master = MasterInputStream::new(audio.clone(), params);
        (audio, master)
    }

    #[test]
    fn test_lazy_open_and_close() {
        let (audio, master) = setup();
        let mut a = master.slave();

        assert!(!master.is_open());
        assert_eq!(audio.open_streams(), 0);

        a.start().unwrap();
        assert!(master.is_open());
        assert_eq!(audio.open_streams(), 1);

        // idempotent
        a.start().unwrap();
        assert_eq!(master.slave_count(), 1);

        a.stop();
        assert!(!master.is_open());
        assert_eq!(audio.open_streams(), 0);

        a.stop();
        a.start().unwrap();
        assert!(master.is_open());
        assert_eq!(audio.opened_total(), 2);
    }

    #[test]
    fn test_two_slaves_share_one_native_stream() {
        let (audio, master) = setup();
        let mut a = master.slave();
        let mut b = master.slave();

        a.start().unwrap();
        b.start().unwrap();
        assert_eq!(audio.open_streams(), 1);
        assert_eq!(master.slave_count(), 2);

        a.stop();
        assert!(master.is_open());
        b.stop();
        assert!(!master.is_open());
    }

    #[test]
    fn test_master_read_broadcasts_same_frame() {
        let (audio, master) = setup();
        audio.push_capture(2, vec![7; 1764]);

        let mut a = master.slave();
        let mut b = master.slave();
        a.start().unwrap();
        b.start().unwrap();

        let frame = master.read().unwrap().unwrap();
        let from_a = a.read().unwrap().unwrap();
        let from_b = b.read().unwrap().unwrap();

        assert!(!from_a.is_empty());
        assert!(from_a.ptr_eq(&frame));
        assert!(from_a.ptr_eq(&from_b));
        assert_eq!(audio.read_count(), 1);

        // consumed: nothing pending until the next native read
        assert!(a.try_read().is_none());
        assert!(b.try_read().is_none());
    }

    #[test]
    fn test_slave_read_feeds_other_slaves() {
        let (audio, master) = setup();
        audio.push_capture(2, vec![1; 1764]);
        audio.push_capture(2, vec![2; 1764]);

        let mut a = master.slave();
        let mut b = master.slave();
        a.start().unwrap();
        b.start().unwrap();

        let first = a.read().unwrap().unwrap();
        assert_eq!(first[0], 1);
        // the initiator does not see its own frame twice
        assert!(a.try_read().is_none());

        let for_b = b.read().unwrap().unwrap();
        assert!(for_b.ptr_eq(&first));
        assert_eq!(audio.read_count(), 1);

        // a new native read replaces anything b had not consumed
        let second = a.read().unwrap().unwrap();
        assert_eq!(second[0], 2);
        assert!(b.try_read().unwrap().ptr_eq(&second));
    }

    #[test]
    fn test_read_when_not_started() {
        let (audio, master) = setup();
        let a = master.slave();

        assert!(master.read().unwrap().is_none());
        assert!(a.read().unwrap().is_none());
        assert_eq!(audio.read_count(), 0);
    }

    #[test]
    fn test_native_errors_propagate() {
        let (audio, master) = setup();
        let mut a = master.slave();

        audio.fail_next(NativeOp::Open, AudioError::Backend("no device".into()));
        assert_eq!(a.start(), Err(AudioError::Backend("no device".into())));
        assert!(!a.is_started());
        assert!(!master.is_open());

        audio.fail_next(NativeOp::Start, AudioError::StreamError("busy".into()));
        assert!(a.start().is_err());
        assert!(!master.is_open());
        assert_eq!(audio.open_streams(), 0);

        a.start().unwrap();
        audio.fail_next(NativeOp::Read, AudioError::StreamError("overflow".into()));
        assert_eq!(a.read().unwrap_err(), AudioError::StreamError("overflow".into()));
        // no retry, but the stream stays usable
        assert!(a.read().unwrap().is_some());
    }

    #[test]
    fn test_drop_stops_and_releases() {
        let audio = Arc::new(VirtualAudio::new(1));
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let master = MasterInputStream::with_release(
            audio.clone(),
            StreamParameters::default(),
            Box::new(move |_: &StreamParameters| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let mut a = master.slave();
        a.start().unwrap();
        drop(a);

        assert!(!master.is_open());
        assert!(master.is_unused());
        // once for the last stop, once for the last drop
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_slave_reads() {
        let (audio, master) = setup();
        let mut slaves: Vec<_> = (0..4).map(|_| master.slave()).collect();
        for s in slaves.iter_mut() {
            s.start().unwrap();
        }

        std::thread::scope(|scope| {
            for s in &slaves {
                scope.spawn(move || {
                    for _ in 0..25 {
                        assert!(s.read().unwrap().is_some());
                    }
                });
            }
        });

        // each slave consumed 25 frames; some came from other slaves' reads
        assert!(audio.read_count() >= 25);
        assert!(audio.read_count() <= 100);
        assert_eq!(audio.open_streams(), 1);
    }

    proptest! {
        #[test]
        fn prop_open_iff_started_slaves(
            ops in proptest::collection::vec((0usize..4, any::<bool>()), 1..64)
        ) {
            let (audio, master) = setup();
            let mut slaves: Vec<_> = (0..4).map(|_| master.slave()).collect();

            for (index, start) in ops {
                if start {
                    slaves[index].start().unwrap();
                } else {
                    slaves[index].stop();
                }
                let started = slaves.iter().filter(|s| s.is_started()).count();
                prop_assert_eq!(master.slave_count(), started);
                prop_assert_eq!(master.is_open(), started > 0);
                prop_assert_eq!(audio.open_streams(), usize::from(started > 0));
            }
        }
    }
}
