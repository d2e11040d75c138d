//! Built-in session-control bodies.
//!
//! Only the messages the core needs to establish and answer a session live
//! here; the rest of the catalogue is registered by collaborators.

use bytes::{BufMut, Bytes, BytesMut};

use super::{put_fixed_str, Body, BodyReader, MessageBody};
use crate::error::{Jt808Error, Result};
use crate::protocol::Header;

/// Message ids of the built-in bodies.
pub mod ids {
    pub const TERMINAL_GENERAL_RESPONSE: u16 = 0x0001;
    pub const PLATFORM_GENERAL_RESPONSE: u16 = 0x8001;
    pub const HEARTBEAT: u16 = 0x0002;
    pub const TERMINAL_REGISTER: u16 = 0x0100;
    pub const REGISTER_RESPONSE: u16 = 0x8100;
    pub const TERMINAL_AUTH: u16 = 0x0102;
}

/// Result codes of the general responses.
pub mod response_result {
    pub const SUCCESS: u8 = 0;
    pub const FAILURE: u8 = 1;
    pub const MALFORMED: u8 = 2;
    pub const UNSUPPORTED: u8 = 3;
    pub const ALARM_ACKNOWLEDGED: u8 = 4;
}

/// Result codes of the registration response.
pub mod register_result {
    pub const SUCCESS: u8 = 0;
    pub const VEHICLE_REGISTERED: u8 = 1;
    pub const VEHICLE_UNKNOWN: u8 = 2;
    pub const TERMINAL_REGISTERED: u8 = 3;
    pub const TERMINAL_UNKNOWN: u8 = 4;
}

// Field widths: (2013 layout, 2019 layout).
const MANUFACTURER_WIDTH: (usize, usize) = (5, 11);
const MODEL_WIDTH: (usize, usize) = (20, 30);
const TERMINAL_ID_WIDTH: (usize, usize) = (7, 30);
const IMEI_WIDTH: usize = 15;
const SOFTWARE_VERSION_WIDTH: usize = 20;

fn width(header: &Header, widths: (usize, usize)) -> usize {
    if header.has_version() {
        widths.1
    } else {
        widths.0
    }
}

/// Terminal general response (0x0001).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalGeneralResponse {
    /// Serial of the platform message being answered.
    pub reply_serial: u16,
    /// Id of the platform message being answered.
    pub reply_id: u16,
    /// See [`response_result`].
    pub result: u8,
}

/// Platform general response (0x8001).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformGeneralResponse {
    /// Serial of the terminal message being answered.
    pub reply_serial: u16,
    /// Id of the terminal message being answered.
    pub reply_id: u16,
    /// See [`response_result`].
    pub result: u8,
}

impl PlatformGeneralResponse {
    /// Answer `header` with `result`.
    pub fn answering(header: &Header, result: u8) -> Self {
        Self {
            reply_serial: header.serial_number,
            reply_id: header.message_id,
            result,
        }
    }
}

fn decode_general(reader: &mut BodyReader<'_>) -> Result<(u16, u16, u8)> {
    Ok((reader.u16()?, reader.u16()?, reader.u8()?))
}

fn encode_general(buf: &mut BytesMut, reply_serial: u16, reply_id: u16, result: u8) {
    buf.put_u16(reply_serial);
    buf.put_u16(reply_id);
    buf.put_u8(result);
}

impl MessageBody for TerminalGeneralResponse {
    const MESSAGE_ID: u16 = ids::TERMINAL_GENERAL_RESPONSE;

    fn decode(_header: &Header, reader: &mut BodyReader<'_>) -> Result<Self> {
        let (reply_serial, reply_id, result) = decode_general(reader)?;
        Ok(Self {
            reply_serial,
            reply_id,
            result,
        })
    }

    fn encode(&self, _header: &Header, buf: &mut BytesMut) -> Result<()> {
        encode_general(buf, self.reply_serial, self.reply_id, self.result);
        Ok(())
    }

    fn into_body(self) -> Body {
        Body::TerminalResponse(self)
    }

    fn from_body(body: &Body) -> Option<&Self> {
        match body {
            Body::TerminalResponse(b) => Some(b),
            _ => None,
        }
    }
}

impl MessageBody for PlatformGeneralResponse {
    const MESSAGE_ID: u16 = ids::PLATFORM_GENERAL_RESPONSE;

    fn decode(_header: &Header, reader: &mut BodyReader<'_>) -> Result<Self> {
        let (reply_serial, reply_id, result) = decode_general(reader)?;
        Ok(Self {
            reply_serial,
            reply_id,
            result,
        })
    }

    fn encode(&self, _header: &Header, buf: &mut BytesMut) -> Result<()> {
        encode_general(buf, self.reply_serial, self.reply_id, self.result);
        Ok(())
    }

    fn into_body(self) -> Body {
        Body::PlatformResponse(self)
    }

    fn from_body(body: &Body) -> Option<&Self> {
        match body {
            Body::PlatformResponse(b) => Some(b),
            _ => None,
        }
    }
}

/// Terminal heartbeat (0x0002), empty body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat;

impl MessageBody for Heartbeat {
    const MESSAGE_ID: u16 = ids::HEARTBEAT;

    fn decode(_header: &Header, _reader: &mut BodyReader<'_>) -> Result<Self> {
        Ok(Heartbeat)
    }

    fn encode(&self, _header: &Header, _buf: &mut BytesMut) -> Result<()> {
        Ok(())
    }

    fn into_body(self) -> Body {
        Body::Heartbeat
    }

    fn from_body(body: &Body) -> Option<&Self> {
        match body {
            Body::Heartbeat => Some(&Heartbeat),
            _ => None,
        }
    }
}

/// Terminal registration (0x0100).
///
/// Text widths follow the header layout: manufacturer 5/11, model 20/30,
/// terminal id 7/30 bytes for 2013/2019.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalRegister {
    pub province_id: u16,
    pub city_id: u16,
    pub manufacturer_id: String,
    pub model: String,
    pub terminal_id: String,
    pub plate_color: u8,
    /// Plate number as sent (GBK on the wire, kept opaque).
    pub plate: Bytes,
}

impl MessageBody for TerminalRegister {
    const MESSAGE_ID: u16 = ids::TERMINAL_REGISTER;

    fn decode(header: &Header, reader: &mut BodyReader<'_>) -> Result<Self> {
        Ok(Self {
            province_id: reader.u16()?,
            city_id: reader.u16()?,
            manufacturer_id: reader.fixed_str(width(header, MANUFACTURER_WIDTH))?,
            model: reader.fixed_str(width(header, MODEL_WIDTH))?,
            terminal_id: reader.fixed_str(width(header, TERMINAL_ID_WIDTH))?,
            plate_color: reader.u8()?,
            plate: Bytes::copy_from_slice(reader.rest()),
        })
    }

    fn encode(&self, header: &Header, buf: &mut BytesMut) -> Result<()> {
        buf.put_u16(self.province_id);
        buf.put_u16(self.city_id);
        put_fixed_str(
            buf,
            "manufacturer_id",
            &self.manufacturer_id,
            width(header, MANUFACTURER_WIDTH),
        )?;
        put_fixed_str(buf, "model", &self.model, width(header, MODEL_WIDTH))?;
        put_fixed_str(
            buf,
            "terminal_id",
            &self.terminal_id,
            width(header, TERMINAL_ID_WIDTH),
        )?;
        buf.put_u8(self.plate_color);
        buf.put_slice(&self.plate);
        Ok(())
    }

    fn into_body(self) -> Body {
        Body::Register(self)
    }

    fn from_body(body: &Body) -> Option<&Self> {
        match body {
            Body::Register(b) => Some(b),
            _ => None,
        }
    }
}

/// Registration response (0x8100). The token is present only on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResponse {
    pub reply_serial: u16,
    /// See [`register_result`].
    pub result: u8,
    /// Authentication token, opaque.
    pub token: Bytes,
}

impl MessageBody for RegisterResponse {
    const MESSAGE_ID: u16 = ids::REGISTER_RESPONSE;

    fn decode(_header: &Header, reader: &mut BodyReader<'_>) -> Result<Self> {
        let reply_serial = reader.u16()?;
        let result = reader.u8()?;
        let token = if result == register_result::SUCCESS {
            Bytes::copy_from_slice(reader.rest())
        } else {
            Bytes::new()
        };
        Ok(Self {
            reply_serial,
            result,
            token,
        })
    }

    fn encode(&self, _header: &Header, buf: &mut BytesMut) -> Result<()> {
        buf.put_u16(self.reply_serial);
        buf.put_u8(self.result);
        if self.result == register_result::SUCCESS {
            buf.put_slice(&self.token);
        }
        Ok(())
    }

    fn into_body(self) -> Body {
        Body::RegisterResponse(self)
    }

    fn from_body(body: &Body) -> Option<&Self> {
        match body {
            Body::RegisterResponse(b) => Some(b),
            _ => None,
        }
    }
}

/// Terminal authentication (0x0102).
///
/// 2013: the whole body is the token. 2019: length-prefixed token, then
/// IMEI (15 bytes) and software version (20 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalAuth {
    /// Authentication token, opaque.
    pub token: Bytes,
    /// 2019 layout only.
    pub imei: Option<String>,
    /// 2019 layout only.
    pub software_version: Option<String>,
}

impl MessageBody for TerminalAuth {
    const MESSAGE_ID: u16 = ids::TERMINAL_AUTH;

    fn decode(header: &Header, reader: &mut BodyReader<'_>) -> Result<Self> {
        if !header.has_version() {
            return Ok(Self {
                token: Bytes::copy_from_slice(reader.rest()),
                imei: None,
                software_version: None,
            });
        }
        let token_len = usize::from(reader.u8()?);
        let token = Bytes::copy_from_slice(reader.take(token_len)?);
        Ok(Self {
            token,
            imei: Some(reader.fixed_str(IMEI_WIDTH)?),
            software_version: Some(reader.fixed_str(SOFTWARE_VERSION_WIDTH)?),
        })
    }

    fn encode(&self, header: &Header, buf: &mut BytesMut) -> Result<()> {
        if !header.has_version() {
            buf.put_slice(&self.token);
            return Ok(());
        }
        let token_len = u8::try_from(self.token.len()).map_err(|_| Jt808Error::FieldTooLong {
            field: "token",
            max: usize::from(u8::MAX),
            actual: self.token.len(),
        })?;
        buf.put_u8(token_len);
        buf.put_slice(&self.token);
        put_fixed_str(buf, "imei", self.imei.as_deref().unwrap_or(""), IMEI_WIDTH)?;
        put_fixed_str(
            buf,
            "software_version",
            self.software_version.as_deref().unwrap_or(""),
            SOFTWARE_VERSION_WIDTH,
        )
    }

    fn into_body(self) -> Body {
        Body::Authentication(self)
    }

    fn from_body(body: &Body) -> Option<&Self> {
        match body {
            Body::Authentication(b) => Some(b),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeviceId;

    fn header_2013(id: u16) -> Header {
        Header::new(id, DeviceId::new("013912345678").unwrap(), 1)
    }

    fn header_2019(id: u16) -> Header {
        Header::new(id, DeviceId::new("00000000013912345678").unwrap(), 1).with_version(1)
    }

    fn roundtrip<T: MessageBody>(header: &Header, body: &T) -> (BytesMut, T) {
        let mut buf = BytesMut::new();
        body.encode(header, &mut buf).unwrap();
        let decoded = T::decode(header, &mut BodyReader::new(T::MESSAGE_ID, &buf)).unwrap();
        (buf, decoded)
    }

    fn register() -> TerminalRegister {
        TerminalRegister {
            province_id: 44,
            city_id: 300,
            manufacturer_id: "ACME".to_string(),
            model: "TRK-100".to_string(),
            terminal_id: "T0001".to_string(),
            plate_color: 1,
            plate: Bytes::from_static(b"\xd4\xc1B12345"),
        }
    }

    #[test]
    fn test_general_response_layout() {
        let body = PlatformGeneralResponse::answering(&header_2013(0x0200), response_result::SUCCESS);
        let (bytes, decoded) = roundtrip(&header_2013(0x8001), &body);
        assert_eq!(&bytes[..], &[0x00, 0x01, 0x02, 0x00, 0x00]);
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_register_widths_follow_version() {
        let (bytes_2013, decoded) = roundtrip(&header_2013(0x0100), &register());
        assert_eq!(bytes_2013.len(), 2 + 2 + 5 + 20 + 7 + 1 + 8);
        assert_eq!(decoded, register());

        let (bytes_2019, decoded) = roundtrip(&header_2019(0x0100), &register());
        assert_eq!(bytes_2019.len(), 2 + 2 + 11 + 30 + 30 + 1 + 8);
        assert_eq!(decoded, register());
    }

    #[test]
    fn test_register_response_token_only_on_success() {
        let ok = RegisterResponse {
            reply_serial: 9,
            result: register_result::SUCCESS,
            token: Bytes::from_static(b"AUTH123"),
        };
        let (bytes, decoded) = roundtrip(&header_2013(0x8100), &ok);
        assert_eq!(bytes.len(), 3 + 7);
        assert_eq!(decoded, ok);

        let refused = RegisterResponse {
            reply_serial: 9,
            result: register_result::TERMINAL_REGISTERED,
            token: Bytes::from_static(b"ignored"),
        };
        let (bytes, decoded) = roundtrip(&header_2013(0x8100), &refused);
        assert_eq!(bytes.len(), 3);
        assert!(decoded.token.is_empty());
    }

    #[test]
    fn test_auth_2013_and_2019() {
        let auth = TerminalAuth {
            token: Bytes::from_static(b"AUTH123"),
            imei: None,
            software_version: None,
        };
        let (bytes, decoded) = roundtrip(&header_2013(0x0102), &auth);
        assert_eq!(&bytes[..], b"AUTH123");
        assert_eq!(decoded, auth);

        let auth = TerminalAuth {
            token: Bytes::from_static(b"AUTH123"),
            imei: Some("861234567890123".to_string()),
            software_version: Some("1.0.4".to_string()),
        };
        let (bytes, decoded) = roundtrip(&header_2019(0x0102), &auth);
        assert_eq!(bytes.len(), 1 + 7 + 15 + 20);
        assert_eq!(decoded, auth);
    }

    #[test]
    fn test_truncated_register_is_body_too_short() {
        let err = TerminalRegister::decode(
            &header_2013(0x0100),
            &mut BodyReader::new(0x0100, &[0x00, 0x2C, 0x01]),
        )
        .unwrap_err();
        assert!(matches!(err, Jt808Error::BodyTooShort { message_id: 0x0100, .. }));
    }
}
