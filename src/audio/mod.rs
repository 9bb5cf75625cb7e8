//! Native audio stream layer
//!
//! Shared capture streams, chunked output streams and the native backends
//! they run on.

pub mod buffer;
pub mod cpal_backend;
pub mod gain;
pub mod master;
pub mod native;
pub mod output;
pub mod pool;
pub mod virtual_device;

pub use buffer::{ChunkBuffer, Frame};
pub use cpal_backend::CpalAudio;
pub use master::{MasterInputStream, SlaveInputStream};
pub use native::{DeviceInfo, Direction, NativeAudio, SampleFormat, StreamHandle, StreamParameters};
pub use output::OutputStream;
pub use pool::InputStreamPool;
pub use virtual_device::VirtualAudio;
