//! Frame-aligned backlog of recent audio
//!
//! New listeners are primed with the contents of this buffer so playback
//! starts immediately instead of waiting for the next frames from the source.

use bytes::Bytes;

use crate::codec::mpeg;
use crate::error::BufferError;

/// Fixed-capacity byte ring holding whole MPEG frames.
///
/// Eviction always drops complete frames from the front, so once anything
/// has been written the buffer starts on a frame boundary.
pub struct BacklogBuffer {
    data: Vec<u8>,
    used: usize,
    /// Frames evicted since creation
    evicted_frames: u64,
}

impl BacklogBuffer {
    /// Create an empty backlog holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            used: 0,
            evicted_frames: 0,
        }
    }

    /// Append a validated frame (or run of frames), evicting from the front
    /// until it fits.
    pub fn append(&mut self, frame: &[u8]) -> Result<(), BufferError> {
        let capacity = self.data.len();
        if frame.len() > capacity {
            return Err(BufferError::FrameTooLarge {
                len: frame.len(),
                capacity,
            });
        }

        while self.used + frame.len() > capacity {
            self.evict_front()?;
        }

        self.data[self.used..self.used + frame.len()].copy_from_slice(frame);
        self.used += frame.len();
        Ok(())
    }

    fn evict_front(&mut self) -> Result<(), BufferError> {
        let header = mpeg::parse_header(&self.data[..self.used], 0)
            .map_err(|_| BufferError::Exhausted { used: self.used })?;
        // A frame can only overhang the end if the tail was appended mid-frame.
        let len = header.frame_len().min(self.used);

        self.data.copy_within(len..self.used, 0);
        self.used -= len;
        self.evicted_frames += 1;
        Ok(())
    }

    /// Copy of the buffered bytes, safe to hand to a session while later
    /// appends keep evicting.
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data[..self.used])
    }

    /// Bytes currently buffered
    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn evicted_frames(&self) -> u64 {
        self.evicted_frames
    }
}
