//! Audio byte buffers
//!
//! [`Frame`] is one captured native buffer, shared by reference between every
//! reader of a master stream. [`ChunkBuffer`] cuts an arbitrary byte stream
//! into the fixed-size chunks a native output stream accepts, keeping the
//! sub-chunk remainder between calls.

use std::ops::Deref;
use std::sync::Arc;

/// Captured audio frame, immutable and cheap to clone
#[derive(Debug, Clone)]
pub struct Frame {
    data: Arc<[u8]>,
    sequence: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, sequence: u64) -> Self {
        Self {
            data: data.into(),
            sequence,
        }
    }

    /// Sequence number of the native read that produced this frame
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// True if both frames refer to the same captured buffer
    pub fn ptr_eq(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl Deref for Frame {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

/// Assembles fixed-size chunks out of arbitrary-length writes
///
/// Invariant: `leftover_len() < chunk_size()` between calls to [`push`].
///
/// [`push`]: ChunkBuffer::push
#[derive(Debug)]
pub struct ChunkBuffer {
    chunk_size: usize,
    left: Vec<u8>,
}

impl ChunkBuffer {
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            left: Vec::with_capacity(chunk_size),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bytes held back from previous pushes
    pub fn leftover(&self) -> &[u8] {
        &self.left
    }

    pub fn leftover_len(&self) -> usize {
        self.left.len()
    }

    /// Drop the held-back bytes without emitting them
    pub fn clear(&mut self) {
        self.left.clear();
    }

    /// Feed `bytes`, calling `emit` once per completed chunk in order.
    ///
    /// If `emit` fails the chunk in flight is lost, the rest of `bytes` is
    /// not retained and the error is returned.
    pub fn push<E, F>(&mut self, mut bytes: &[u8], mut emit: F) -> Result<(), E>
    where
        F: FnMut(&[u8]) -> Result<(), E>,
    {
        if !self.left.is_empty() {
            let missing = self.chunk_size - self.left.len();
            let take = missing.min(bytes.len());
            self.left.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];

            if self.left.len() < self.chunk_size {
                return Ok(());
            }

            let result = emit(&self.left);
            self.left.clear();
            result?;
        }

        let mut chunks = bytes.chunks_exact(self.chunk_size);
        for chunk in &mut chunks {
            emit(chunk)?;
        }
        self.left.extend_from_slice(chunks.remainder());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn collect(buffer: &mut ChunkBuffer, bytes: &[u8], out: &mut Vec<Vec<u8>>) {
        buffer
            .push::<(), _>(bytes, |chunk| {
                out.push(chunk.to_vec());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_frame_shares_data() {
        let frame = Frame::new(vec![1, 2, 3], 7);
        let copy = frame.clone();

        assert!(frame.ptr_eq(&copy));
        assert_eq!(copy.sequence(), 7);
        assert_eq!(&copy[..], &[1, 2, 3]);

        let other = Frame::new(vec![1, 2, 3], 7);
        assert!(!frame.ptr_eq(&other));
    }

    #[test]
    fn test_chunk_buffer_short_write_is_held() {
        let mut buffer = ChunkBuffer::new(100);
        let mut out = Vec::new();

        collect(&mut buffer, &[1; 60], &mut out);
        assert!(out.is_empty());
        assert_eq!(buffer.leftover_len(), 60);

        collect(&mut buffer, &[2; 50], &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 100);
        assert_eq!(&out[0][..60], &[1; 60][..]);
        assert_eq!(&out[0][60..], &[2; 40][..]);
        assert_eq!(buffer.leftover(), &[2; 10][..]);
    }

    #[test]
    fn test_chunk_buffer_multiple_chunks() {
        let mut buffer = ChunkBuffer::new(4);
        let mut out = Vec::new();

        collect(&mut buffer, &[0, 1, 2, 3, 4, 5, 6, 7, 8], &mut out);
        assert_eq!(out, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]]);
        assert_eq!(buffer.leftover(), &[8]);
    }

    #[test]
    fn test_chunk_buffer_emit_error() {
        let mut buffer = ChunkBuffer::new(4);
        let result = buffer.push(&[0; 10], |_| Err("device gone"));

        assert_eq!(result, Err("device gone"));
        assert_eq!(buffer.leftover_len(), 0);
    }

    #[test]
    fn test_chunk_buffer_clear() {
        let mut buffer = ChunkBuffer::new(8);
        let mut out = Vec::new();

        collect(&mut buffer, &[9; 5], &mut out);
        buffer.clear();
        collect(&mut buffer, &[1; 3], &mut out);

        assert!(out.is_empty());
        assert_eq!(buffer.leftover(), &[1; 3]);
    }

    proptest! {
        #[test]
        fn prop_split_writes_match_single_write(
            data in proptest::collection::vec(any::<u8>(), 0..600),
            split in 0usize..600,
            chunk in 1usize..128,
        ) {
            let split = split.min(data.len());

            let mut whole = ChunkBuffer::new(chunk);
            let mut whole_out = Vec::new();
            collect(&mut whole, &data, &mut whole_out);

            let mut parts = ChunkBuffer::new(chunk);
            let mut parts_out = Vec::new();
            collect(&mut parts, &data[..split], &mut parts_out);
            collect(&mut parts, &data[split..], &mut parts_out);

            prop_assert_eq!(whole_out, parts_out);
            prop_assert_eq!(whole.leftover(), parts.leftover());
            prop_assert!(parts.leftover_len() < chunk);
        }
    }
}
