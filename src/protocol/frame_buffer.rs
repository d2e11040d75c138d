//! Frame buffer for splitting a TCP byte stream on `0x7E` delimiters.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for resynchronising on the delimiter:
//! - `Hunting`: discard bytes until a start delimiter
//! - `InFrame`: start delimiter seen, collect until the end delimiter
//!
//! Bytes between frames are dropped. A doubled delimiter (`7E 7E`) is read
//! as the end of a lost frame followed by a new start, so one corrupted frame
//! never swallows the next.
//!
//! # Example
//!
//! ```
//! use jt808_core::protocol::{wrap, FrameBuffer};
//!
//! let raw = wrap(&[0x00, 0x02, 0x00, 0x00, 0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x00, 0x01]);
//! let mut buffer = FrameBuffer::new();
//!
//! assert!(buffer.push(&raw[..5]).frames.is_empty());
//! let extracted = buffer.push(&raw[5..]);
//! assert_eq!(extracted.frames.len(), 1);
//! assert_eq!(extracted.frames[0], raw);
//! ```

use bytes::{Bytes, BytesMut};

use super::frame::DELIMITER;
use crate::error::Jt808Error;

/// Default cap on a single buffered frame (escaped, with delimiters).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024;

/// State machine for delimiter scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Looking for a start delimiter.
    Hunting,
    /// Start delimiter at `buffer[0]`; `scanned` bytes after it hold no delimiter.
    InFrame { scanned: usize },
}

/// Frames and framing errors produced by one [`FrameBuffer::push`].
#[derive(Debug, Default)]
pub struct Extracted {
    /// Complete raw frames, delimiters included, in arrival order.
    pub frames: Vec<Bytes>,
    /// Garbage or oversize conditions met while scanning.
    pub errors: Vec<Jt808Error>,
}

/// Buffer for accumulating stream bytes and extracting delimited frames.
pub struct FrameBuffer {
    /// Bytes not yet assigned to a complete frame.
    buffer: BytesMut,
    /// Current scanning state.
    state: State,
    /// Largest frame kept before the buffer is dropped.
    max_frame_size: usize,
}

impl FrameBuffer {
    /// Create a frame buffer with the default max frame size (8 KiB).
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a frame buffer with a custom max frame size.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_frame_size.min(64 * 1024)),
            state: State::Hunting,
            max_frame_size,
        }
    }

    /// Push stream bytes and extract every complete frame.
    ///
    /// Never fails: garbage and oversize runs are reported in
    /// [`Extracted::errors`] and scanning continues.
    pub fn push(&mut self, data: &[u8]) -> Extracted {
        self.buffer.extend_from_slice(data);

        let mut out = Extracted::default();
        while let Some(frame) = self.try_extract_one(&mut out.errors) {
            out.frames.push(frame);
        }
        out
    }

    /// Try to extract a single frame.
    fn try_extract_one(&mut self, errors: &mut Vec<Jt808Error>) -> Option<Bytes> {
        loop {
            match self.state {
                State::Hunting => {
                    let start = self.buffer.iter().position(|&b| b == DELIMITER);
                    match start {
                        Some(0) => {}
                        Some(skip) => {
                            let _ = self.buffer.split_to(skip);
                            errors.push(Jt808Error::Framing(format!(
                                "discarded {skip} bytes before start delimiter"
                            )));
                        }
                        None => {
                            if !self.buffer.is_empty() {
                                errors.push(Jt808Error::Framing(format!(
                                    "discarded {} bytes without delimiter",
                                    self.buffer.len()
                                )));
                                self.buffer.clear();
                            }
                            return None;
                        }
                    }
                    self.state = State::InFrame { scanned: 0 };
                }

                State::InFrame { scanned } => {
                    let tail = &self.buffer[1 + scanned..];
                    match tail.iter().position(|&b| b == DELIMITER) {
                        // `7E 7E`: previous frame lost its start, restart here.
                        Some(0) if scanned == 0 => {
                            let _ = self.buffer.split_to(1);
                            self.state = State::InFrame { scanned: 0 };
                        }
                        Some(offset) => {
                            let end = 1 + scanned + offset;
                            self.state = State::Hunting;
                            return Some(self.buffer.split_to(end + 1).freeze());
                        }
                        None => {
                            let scanned = self.buffer.len() - 1;
                            if self.buffer.len() > self.max_frame_size {
                                errors.push(Jt808Error::Framing(format!(
                                    "frame exceeds {} bytes without end delimiter",
                                    self.max_frame_size
                                )));
                                self.clear();
                            } else {
                                self.state = State::InFrame { scanned };
                            }
                            return None;
                        }
                    }
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::Hunting;
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::Hunting => "Hunting",
            State::InFrame { .. } => "InFrame",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
