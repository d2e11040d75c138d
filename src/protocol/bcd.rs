//! Packed decimal (BCD) encoding: two digits per byte, high nibble first.

use crate::error::{Jt808Error, Result};

/// Encode a decimal digit string into exactly `width` BCD bytes.
///
/// Shorter input is left-padded with `'0'`.
///
/// # Example
///
/// ```
/// use jt808_core::protocol::bcd;
///
/// assert_eq!(bcd::encode("1234", 3).unwrap(), vec![0x00, 0x12, 0x34]);
/// ```
pub fn encode(digits: &str, width: usize) -> Result<Vec<u8>> {
    let capacity = width * 2;
    if digits.len() > capacity {
        return Err(Jt808Error::InvalidDeviceId(format!(
            "{digits:?} has {} digits, field holds {capacity}",
            digits.len()
        )));
    }
    if let Some(bad) = digits.bytes().find(|b| !b.is_ascii_digit()) {
        return Err(Jt808Error::InvalidDeviceId(format!(
            "{digits:?} contains non-digit {:?}",
            bad as char
        )));
    }

    let padding = capacity - digits.len();
    let mut nibbles = std::iter::repeat(0u8)
        .take(padding)
        .chain(digits.bytes().map(|b| b - b'0'));

    let mut out = Vec::with_capacity(width);
    for _ in 0..width {
        let high = nibbles.next().unwrap_or(0);
        let low = nibbles.next().unwrap_or(0);
        out.push((high << 4) | low);
    }
    Ok(out)
}

/// Decode BCD bytes into a digit string, keeping every digit.
pub fn decode(bytes: &[u8]) -> Result<String> {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        let (high, low) = (byte >> 4, byte & 0x0F);
        if high > 9 || low > 9 {
            return Err(Jt808Error::InvalidBcd(byte));
        }
        out.push((b'0' + high) as char);
        out.push((b'0' + low) as char);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_exact_width() {
        assert_eq!(
            encode("123456789001", 6).unwrap(),
            vec![0x12, 0x34, 0x56, 0x78, 0x90, 0x01]
        );
    }

    #[test]
    fn test_leading_zeros_survive() {
        let bytes = encode("001234567890", 6).unwrap();
        assert_eq!(bytes[0], 0x00);
        assert_eq!(decode(&bytes).unwrap(), "001234567890");
    }

    #[test]
    fn test_short_input_is_left_padded() {
        assert_eq!(encode("7", 2).unwrap(), vec![0x00, 0x07]);
        assert_eq!(encode("", 1).unwrap(), vec![0x00]);
    }

    #[test]
    fn test_rejects_overlong_and_non_digits() {
        assert!(encode("1234567", 3).is_err());
        assert!(encode("12a4", 2).is_err());
    }

    #[test]
    fn test_decode_rejects_hex_nibbles() {
        let err = decode(&[0x12, 0x3A]).unwrap_err();
        assert!(matches!(err, Jt808Error::InvalidBcd(0x3A)));
    }
}
