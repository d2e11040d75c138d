//! XOR checksum and hex helpers.

use crate::error::{Jt808Error, Result};

/// XOR of every byte in `bytes`.
///
/// # Example
///
/// ```
/// use jt808_core::protocol::checksum;
///
/// assert_eq!(checksum::xor(&[0x01, 0x02, 0x04]), 0x07);
/// assert_eq!(checksum::xor(&[]), 0x00);
/// ```
#[inline]
pub fn xor(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Lowercase hex rendering, used when logging rejected frames.
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Parse a hex string, ignoring ASCII whitespace between bytes.
pub fn from_hex(text: &str) -> Result<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    hex::decode(compact).map_err(|e| Jt808Error::Framing(format!("invalid hex: {e}")))
}
