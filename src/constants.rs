//! Stream defaults shared by the native layer and the configuration

/// Default duration of one native buffer in milliseconds
pub const DEFAULT_MILLIS_PER_BUFFER: u32 = 20;

/// Default sample rate for capture and notification streams
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Default channel count
pub const DEFAULT_CHANNELS: u16 = 1;

/// Default sample size in bits
pub const DEFAULT_SAMPLE_SIZE_BITS: u16 = 16;

/// Number of byte chunks a cpal stream may queue between the device
/// callback and the blocking read/write side
pub const NATIVE_QUEUE_CAPACITY: usize = 32;

/// Capacity of the notifier event channel
pub const NOTIFIER_EVENT_CAPACITY: usize = 64;

/// Number of samples decoded per block by the streaming clip backend
pub const STREAMING_DECODE_BLOCK: usize = 4096;
