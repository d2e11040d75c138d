//! Protocol module - byte primitives, framing and header codec.
//!
//! This module implements the JT/T 808 wire layer:
//! - BCD and XOR checksum primitives
//! - Frame wrap/unwrap with byte stuffing
//! - Variable-length header encoding/decoding (2013 and 2019 layouts)
//! - Frame buffer for delimiter resynchronisation on TCP streams

pub mod bcd;
pub mod checksum;
mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{escape, unescape, unwrap, wrap, DELIMITER, ESCAPE, MIN_FRAME_SIZE};
pub use frame_buffer::{Extracted, FrameBuffer, DEFAULT_MAX_FRAME_SIZE};
pub use wire_format::{
    encryption, header_len, properties, DeviceId, FragmentInfo, Header, DEVICE_ID_WIDTH,
    DEVICE_ID_WIDTH_2019, FRAGMENT_INFO_SIZE, MAX_BODY_LENGTH, MIN_HEADER_SIZE,
};
