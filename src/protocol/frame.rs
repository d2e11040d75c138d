//! Frame codec: delimiters, byte stuffing and checksum.
//!
//! ```text
//! 0x7E | escaped( header || body || checksum ) | 0x7E
//! ```
//!
//! Inside the delimiters `0x7E` travels as `0x7D 0x02` and `0x7D` as
//! `0x7D 0x01`. The checksum is the XOR of header and body before stuffing,
//! and is itself stuffed.
//!
//! # Example
//!
//! ```
//! use jt808_core::protocol::{unwrap, wrap};
//!
//! // A 12-byte header with no body; 0x7E and 0x7D in the serial get stuffed.
//! let payload = [
//!     0x00, 0x02, 0x00, 0x00, 0x01, 0x39, 0x12, 0x34, 0x56, 0x78, 0x7E, 0x7D,
//! ];
//! let raw = wrap(&payload);
//! assert_eq!(raw[0], 0x7E);
//! assert_eq!(&raw[11..15], &[0x7D, 0x02, 0x7D, 0x01]);
//! assert_eq!(&unwrap(&raw).unwrap()[..], &payload);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::checksum;
use super::wire_format::MIN_HEADER_SIZE;
use crate::error::{Jt808Error, Result};

/// Frame delimiter.
pub const DELIMITER: u8 = 0x7E;

/// Stuffing escape byte.
pub const ESCAPE: u8 = 0x7D;

/// Escape continuation standing for the delimiter.
const ESCAPED_DELIMITER: u8 = 0x02;

/// Escape continuation standing for the escape byte itself.
const ESCAPED_ESCAPE: u8 = 0x01;

/// Smallest frame that can carry a header: delimiters, 12-byte header, checksum.
pub const MIN_FRAME_SIZE: usize = MIN_HEADER_SIZE + 3;

/// Apply byte stuffing.
pub fn escape(data: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(data.len() + data.len() / 8 + 2);
    escape_into(data, &mut out);
    out
}

fn escape_into(data: &[u8], out: &mut BytesMut) {
    for &byte in data {
        match byte {
            DELIMITER => out.put_slice(&[ESCAPE, ESCAPED_DELIMITER]),
            ESCAPE => out.put_slice(&[ESCAPE, ESCAPED_ESCAPE]),
            other => out.put_u8(other),
        }
    }
}

/// Reverse byte stuffing.
///
/// An escape byte followed by anything other than `0x01`/`0x02` is kept
/// literally, and the following byte is processed on its own.
pub fn unescape(data: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        let byte = data[i];
        if byte == ESCAPE {
            match data.get(i + 1) {
                Some(&ESCAPED_DELIMITER) => {
                    out.put_u8(DELIMITER);
                    i += 2;
                    continue;
                }
                Some(&ESCAPED_ESCAPE) => {
                    out.put_u8(ESCAPE);
                    i += 2;
                    continue;
                }
                _ => {}
            }
        }
        out.put_u8(byte);
        i += 1;
    }
    out
}

/// Wrap a payload (header || body) into a wire frame.
pub fn wrap(payload: &[u8]) -> Bytes {
    let sum = checksum::xor(payload);
    let mut out = BytesMut::with_capacity(payload.len() + payload.len() / 8 + 4);
    out.put_u8(DELIMITER);
    escape_into(payload, &mut out);
    escape_into(&[sum], &mut out);
    out.put_u8(DELIMITER);
    out.freeze()
}

/// Unwrap a wire frame into its verified payload (header || body).
///
/// # Errors
///
/// - `Framing` if the frame is shorter than [`MIN_FRAME_SIZE`] or is not
///   bracketed by delimiters
/// - `Checksum` if the trailing byte is not the XOR of the rest
pub fn unwrap(raw: &[u8]) -> Result<Bytes> {
    if raw.len() < MIN_FRAME_SIZE {
        return Err(Jt808Error::Framing(format!(
            "frame of {} bytes is shorter than the minimum {}",
            raw.len(),
            MIN_FRAME_SIZE
        )));
    }
    if raw[0] != DELIMITER || raw[raw.len() - 1] != DELIMITER {
        return Err(Jt808Error::Framing(
            "frame is not bracketed by 0x7e delimiters".to_string(),
        ));
    }

    let mut payload = unescape(&raw[1..raw.len() - 1]);
    let Some(actual) = payload.last().copied() else {
        return Err(Jt808Error::Framing("empty frame".to_string()));
    };
    payload.truncate(payload.len() - 1);

    let expected = checksum::xor(&payload);
    if expected != actual {
        return Err(Jt808Error::Checksum { expected, actual });
    }
    Ok(payload.freeze())
}
