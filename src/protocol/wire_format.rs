//! Header encoding and decoding.
//!
//! ```text
//! ┌────────┬────────────┬─────────┬──────────────┬────────┬───────────────┐
//! │ Msg ID │ Properties │ Version │ Device ID    │ Serial │ Fragment info │
//! │ u16 BE │ u16 BE     │ u8 [14] │ BCD 6 or 10  │ u16 BE │ u16+u16 [13]  │
//! └────────┴────────────┴─────────┴──────────────┴────────┴───────────────┘
//! ```
//!
//! Bracketed fields are present only when the named properties bit is set.
//! The device id is 6 bytes in the 2011/2013 layout and 10 bytes when the
//! version flag (2019 layout) is set.

use std::fmt;

use bytes::{BufMut, BytesMut};

use super::bcd;
use crate::error::{Jt808Error, Result};

/// Header size without version byte or fragment info (2013 layout).
pub const MIN_HEADER_SIZE: usize = 12;

/// Largest body a single frame can declare.
pub const MAX_BODY_LENGTH: usize = 0x03FF;

/// Device id width in bytes for the 2011/2013 layout.
pub const DEVICE_ID_WIDTH: usize = 6;

/// Device id width in bytes for the 2019 layout.
pub const DEVICE_ID_WIDTH_2019: usize = 10;

/// Size of the `{total, index}` fragment descriptor.
pub const FRAGMENT_INFO_SIZE: usize = 4;

/// Bit layout of the properties field.
pub mod properties {
    /// Bits 0-9: body length.
    pub const BODY_LENGTH_MASK: u16 = 0x03FF;
    /// Bits 10-12: encryption mode.
    pub const ENCRYPTION_MASK: u16 = 0x1C00;
    /// Shift of the encryption bits.
    pub const ENCRYPTION_SHIFT: u16 = 10;
    /// Bit 13: message is one sub-package of a longer message.
    pub const FRAGMENTED: u16 = 0x2000;
    /// Bit 14: protocol version byte present (2019 layout).
    pub const VERSION_FLAG: u16 = 0x4000;
    /// Bit 15: reserved.
    pub const RESERVED: u16 = 0x8000;

    /// Check if a specific bit is set.
    #[inline]
    pub fn has(properties: u16, bit: u16) -> bool {
        properties & bit != 0
    }
}

/// Encryption modes carried in properties bits 10-12.
pub mod encryption {
    /// Body is not encrypted.
    pub const NONE: u8 = 0b000;
    /// Body is RSA encrypted.
    pub const RSA: u8 = 0b001;
}

/// Fixed-width decimal terminal identity.
///
/// Exactly 12 digits (2011/2013 layout) or 20 digits (2019 layout), kept as
/// the full digit string: `"001234567890"` never becomes `"1234567890"`.
/// Shorter numbers are widened explicitly with [`DeviceId::padded`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device id from 12 or 20 decimal digits.
    pub fn new(digits: impl Into<String>) -> Result<Self> {
        let digits = digits.into();
        let width_ok = digits.len() == 2 * DEVICE_ID_WIDTH || digits.len() == 2 * DEVICE_ID_WIDTH_2019;
        if !width_ok || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Jt808Error::InvalidDeviceId(digits));
        }
        Ok(Self(digits))
    }

    /// Left-pad a shorter number (an 11-digit phone number, say) with zeros
    /// to the width of the chosen layout.
    ///
    /// ```
    /// use jt808_core::protocol::DeviceId;
    ///
    /// let id = DeviceId::padded("13912345678", false).unwrap();
    /// assert_eq!(id.as_str(), "013912345678");
    /// ```
    pub fn padded(digits: &str, version_flag: bool) -> Result<Self> {
        let width = 2 * Self::width_for(version_flag);
        if digits.is_empty() || digits.len() > width {
            return Err(Jt808Error::InvalidDeviceId(digits.to_string()));
        }
        Self::new(format!("{digits:0>width$}"))
    }

    /// BCD width used for a header with or without the version flag.
    #[inline]
    pub fn width_for(version_flag: bool) -> usize {
        if version_flag {
            DEVICE_ID_WIDTH_2019
        } else {
            DEVICE_ID_WIDTH
        }
    }

    /// Whether this id has the width the layout calls for.
    #[inline]
    pub fn fits(&self, version_flag: bool) -> bool {
        self.0.len() == 2 * Self::width_for(version_flag)
    }

    /// The digit string.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        bcd::decode(bytes).map(Self)
    }

    fn encode_into(&self, version_flag: bool, buf: &mut BytesMut) -> Result<()> {
        if !self.fits(version_flag) {
            return Err(Jt808Error::InvalidDeviceId(format!(
                "{} has {} digits, the {} layout needs {}",
                self.0,
                self.0.len(),
                if version_flag { "2019" } else { "2013" },
                2 * Self::width_for(version_flag)
            )));
        }
        buf.put_slice(&bcd::encode(&self.0, Self::width_for(version_flag))?);
        Ok(())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for DeviceId {
    type Err = Jt808Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Sub-package descriptor. `index` counts from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentInfo {
    /// Number of sub-packages in the logical message.
    pub total: u16,
    /// Position of this sub-package, 1-based.
    pub index: u16,
}

/// Decoded message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Message type identifier.
    pub message_id: u16,
    /// Body length of this frame. For a reassembled message, the joined length.
    pub body_length: usize,
    /// Encryption mode (3 bits).
    pub encryption: u8,
    /// Reserved properties bit 15, kept for byte-exact re-encoding.
    pub reserved: bool,
    /// Protocol version byte; `Some` iff the version flag is set.
    pub protocol_version: Option<u8>,
    /// Terminal identity.
    pub device_id: DeviceId,
    /// Message serial number.
    pub serial_number: u16,
    /// Sub-package descriptor; `Some` iff the fragmented bit is set.
    pub fragment: Option<FragmentInfo>,
}

impl Header {
    /// Create a 2013-layout header with no body, encryption or fragmentation.
    pub fn new(message_id: u16, device_id: DeviceId, serial_number: u16) -> Self {
        Self {
            message_id,
            body_length: 0,
            encryption: encryption::NONE,
            reserved: false,
            protocol_version: None,
            device_id,
            serial_number,
            fragment: None,
        }
    }

    /// Switch to the 2019 layout with the given protocol version byte.
    pub fn with_version(mut self, version: u8) -> Self {
        self.protocol_version = Some(version);
        self
    }

    /// Mark as sub-package `index` of `total`.
    pub fn with_fragment(mut self, total: u16, index: u16) -> Self {
        self.fragment = Some(FragmentInfo { total, index });
        self
    }

    /// Set the 3-bit encryption mode.
    pub fn with_encryption(mut self, mode: u8) -> Self {
        self.encryption = mode & 0b111;
        self
    }

    /// Whether the version flag (2019 layout) is set.
    #[inline]
    pub fn has_version(&self) -> bool {
        self.protocol_version.is_some()
    }

    /// Whether this is a sub-package.
    #[inline]
    pub fn is_fragmented(&self) -> bool {
        self.fragment.is_some()
    }

    /// Encoded size of this header.
    pub fn encoded_len(&self) -> usize {
        header_len(self.has_version(), self.is_fragmented())
    }

    /// Properties word for a body of `body_length` bytes.
    pub fn properties(&self, body_length: usize) -> Result<u16> {
        if body_length > MAX_BODY_LENGTH {
            return Err(Jt808Error::BodyTooLong(body_length));
        }
        let mut props = body_length as u16;
        props |= (u16::from(self.encryption) << properties::ENCRYPTION_SHIFT)
            & properties::ENCRYPTION_MASK;
        if self.is_fragmented() {
            props |= properties::FRAGMENTED;
        }
        if self.has_version() {
            props |= properties::VERSION_FLAG;
        }
        if self.reserved {
            props |= properties::RESERVED;
        }
        Ok(props)
    }

    /// Encode this header for a body of `body_length` bytes.
    ///
    /// The length bits come from `body_length`, not from `self.body_length`.
    ///
    /// # Example
    ///
    /// ```
    /// use jt808_core::protocol::{DeviceId, Header};
    ///
    /// let header = Header::new(0x0002, DeviceId::new("013912345678").unwrap(), 7);
    /// let bytes = header.encode(0).unwrap();
    /// assert_eq!(bytes.len(), 12);
    /// assert_eq!(&bytes[..4], &[0x00, 0x02, 0x00, 0x00]);
    /// ```
    pub fn encode(&self, body_length: usize) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(body_length, &mut buf)?;
        Ok(buf)
    }

    /// Encode this header into an existing buffer.
    pub fn encode_into(&self, body_length: usize, buf: &mut BytesMut) -> Result<()> {
        let props = self.properties(body_length)?;
        buf.put_u16(self.message_id);
        buf.put_u16(props);
        if let Some(version) = self.protocol_version {
            buf.put_u8(version);
        }
        self.device_id.encode_into(self.has_version(), buf)?;
        buf.put_u16(self.serial_number);
        if let Some(info) = self.fragment {
            buf.put_u16(info.total);
            buf.put_u16(info.index);
        }
        Ok(())
    }

    /// Decode a header from a verified payload.
    ///
    /// Returns the header and the offset where the body starts. Fields are
    /// read left to right; a buffer that ends inside a field the flags call
    /// for is `HeaderTooShort`.
    ///
    /// # Example
    ///
    /// ```
    /// use jt808_core::protocol::Header;
    ///
    /// let payload = [0x01, 0x00, 0x00, 0x00, 0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x00, 0x01];
    /// let (header, offset) = Header::decode(&payload).unwrap();
    /// assert_eq!(header.message_id, 0x0100);
    /// assert_eq!(header.device_id.as_str(), "012345678901");
    /// assert_eq!(offset, 12);
    /// ```
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut reader = FieldReader::new(buf);

        let message_id = reader.u16()?;
        let props = reader.u16()?;
        let version_flag = properties::has(props, properties::VERSION_FLAG);
        let fragmented = properties::has(props, properties::FRAGMENTED);

        // Report the full size the flags imply, not just the next field.
        reader.expect_total(header_len(version_flag, fragmented))?;

        let protocol_version = if version_flag {
            Some(reader.u8()?)
        } else {
            None
        };
        let device_id = DeviceId::decode(reader.take(DeviceId::width_for(version_flag))?)?;
        let serial_number = reader.u16()?;
        let fragment = if fragmented {
            Some(FragmentInfo {
                total: reader.u16()?,
                index: reader.u16()?,
            })
        } else {
            None
        };

        let header = Self {
            message_id,
            body_length: usize::from(props & properties::BODY_LENGTH_MASK),
            encryption: ((props & properties::ENCRYPTION_MASK) >> properties::ENCRYPTION_SHIFT)
                as u8,
            reserved: properties::has(props, properties::RESERVED),
            protocol_version,
            device_id,
            serial_number,
            fragment,
        };
        Ok((header, reader.position()))
    }
}

/// Header size for the given flags.
#[inline]
pub fn header_len(version_flag: bool, fragmented: bool) -> usize {
    let mut len = MIN_HEADER_SIZE;
    if version_flag {
        len += 1 + DEVICE_ID_WIDTH_2019 - DEVICE_ID_WIDTH;
    }
    if fragmented {
        len += FRAGMENT_INFO_SIZE;
    }
    len
}

/// Left-to-right reader that fails with `HeaderTooShort`.
struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn expect_total(&self, needed: usize) -> Result<()> {
        if self.buf.len() < needed {
            return Err(Jt808Error::HeaderTooShort {
                needed,
                available: self.buf.len(),
            });
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        self.expect_total(self.pos + n)?;
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(digits: &str) -> DeviceId {
        DeviceId::new(digits).unwrap()
    }

    #[test]
    fn test_scenario_header_decode() {
        let payload = [
            0x00, 0x01, 0x00, 0x00, 0x12, 0x34, 0x56, 0x78, 0x90, 0x01, 0x00, 0x01,
        ];
        let (header, offset) = Header::decode(&payload).unwrap();

        assert_eq!(header.message_id, 0x0001);
        assert_eq!(header.body_length, 0);
        assert_eq!(header.device_id.as_str(), "123456789001");
        assert_eq!(header.serial_number, 1);
        assert_eq!(header.protocol_version, None);
        assert_eq!(header.fragment, None);
        assert_eq!(offset, MIN_HEADER_SIZE);
        assert_eq!(&header.encode(0).unwrap()[..], &payload[..]);
    }

    #[test]
    fn test_header_lengths() {
        assert_eq!(header_len(false, false), 12);
        assert_eq!(header_len(false, true), 16);
        assert_eq!(header_len(true, false), 17);
        assert_eq!(header_len(true, true), 21);
    }

    #[test]
    fn test_2019_header_roundtrip() {
        let header = Header::new(0x0200, device("00000000013912345678"), 0xBEEF)
            .with_version(1)
            .with_fragment(3, 2)
            .with_encryption(encryption::RSA);
        let bytes = header.encode(100).unwrap();
        assert_eq!(bytes.len(), 21);

        let (decoded, offset) = Header::decode(&bytes).unwrap();
        assert_eq!(offset, 21);
        assert_eq!(decoded.body_length, 100);
        assert_eq!(decoded.protocol_version, Some(1));
        assert_eq!(decoded.encryption, encryption::RSA);
        assert_eq!(decoded.fragment, Some(FragmentInfo { total: 3, index: 2 }));
        assert_eq!(decoded.device_id, header.device_id);
    }

    #[test]
    fn test_properties_bits() {
        let header = Header::new(1, device("00000000013912345678"), 1)
            .with_version(1)
            .with_fragment(2, 1)
            .with_encryption(0b111);
        let props = header.properties(0x3FF).unwrap();
        assert_eq!(props & properties::BODY_LENGTH_MASK, 0x3FF);
        assert_eq!(props & properties::ENCRYPTION_MASK, 0x1C00);
        assert!(properties::has(props, properties::FRAGMENTED));
        assert!(properties::has(props, properties::VERSION_FLAG));
        assert!(!properties::has(props, properties::RESERVED));
    }

    #[test]
    fn test_body_length_recomputed_on_encode() {
        let mut header = Header::new(1, device("013912345678"), 1);
        header.body_length = 999;
        let bytes = header.encode(5).unwrap();
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 5);
    }

    #[test]
    fn test_encode_rejects_oversized_body() {
        let header = Header::new(1, device("013912345678"), 1);
        assert!(matches!(
            header.encode(1024),
            Err(Jt808Error::BodyTooLong(1024))
        ));
    }

    #[test]
    fn test_reserved_bit_survives() {
        let mut payload = Header::new(1, device("013912345678"), 1).encode(0).unwrap();
        payload[2] |= 0x80;
        let (header, _) = Header::decode(&payload).unwrap();
        assert!(header.reserved);
        assert_eq!(header.encode(0).unwrap(), payload);
    }

    #[test]
    fn test_short_buffer_is_an_error() {
        let full = Header::new(1, device("123456789012"), 9).encode(0).unwrap();
        for len in 0..full.len() {
            let err = Header::decode(&full[..len]).unwrap_err();
            assert!(matches!(err, Jt808Error::HeaderTooShort { .. }), "len {len}");
        }
    }

    #[test]
    fn test_flags_extend_required_length() {
        // 12 bytes would do for the base layout, but the fragmented bit asks for 16.
        let mut payload = Header::new(1, device("013912345678"), 1).encode(0).unwrap();
        payload[2] |= 0x20;
        match Header::decode(&payload).unwrap_err() {
            Jt808Error::HeaderTooShort { needed, available } => {
                assert_eq!(needed, 16);
                assert_eq!(available, 12);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_device_id_validation() {
        assert!(DeviceId::new("").is_err());
        assert!(DeviceId::new("0139-2345678").is_err());
        assert!(DeviceId::new("13912345678").is_err());
        assert!(DeviceId::new("0139123456780").is_err());
        assert_eq!(
            "001234567890".parse::<DeviceId>().unwrap().to_string(),
            "001234567890"
        );
        assert!(DeviceId::new("00000000001234567890").is_ok());
    }

    #[test]
    fn test_padded_device_id() {
        assert_eq!(
            DeviceId::padded("13912345678", false).unwrap().as_str(),
            "013912345678"
        );
        assert_eq!(
            DeviceId::padded("13912345678", true).unwrap().as_str(),
            "00000000013912345678"
        );
        assert!(DeviceId::padded("", false).is_err());
        assert!(DeviceId::padded("0013912345678", false).is_err());
    }

    #[test]
    fn test_device_id_width_must_match_layout() {
        let short = Header::new(1, device("123456789012"), 1).with_version(1);
        assert!(matches!(short.encode(0), Err(Jt808Error::InvalidDeviceId(_))));

        let long = Header::new(1, device("00000000123456789012"), 1);
        assert!(matches!(long.encode(0), Err(Jt808Error::InvalidDeviceId(_))));
    }

    #[test]
    fn test_device_id_roundtrips_in_both_layouts() {
        for header in [
            Header::new(1, device("001234567890"), 1),
            Header::new(1, device("00000000001234567890"), 1).with_version(1),
        ] {
            let (decoded, _) = Header::decode(&header.encode(0).unwrap()).unwrap();
            assert_eq!(decoded.device_id, header.device_id);
        }
    }
}
