//! Message model - header plus typed or opaque body.
//!
//! A [`Body`] is one of the built-in session-control bodies, an opaque
//! [`Body::Raw`] for ids with no registered codec, or a
//! [`Body::Extension`] carrying a collaborator-defined [`MessageBody`].
//!
//! # Example
//!
//! ```
//! use jt808_core::message::{Body, Heartbeat, Message};
//! use jt808_core::protocol::{DeviceId, Header};
//!
//! let header = Header::new(0, DeviceId::new("013912345678").unwrap(), 1);
//! let message = Message::from_body(header, Heartbeat);
//!
//! assert_eq!(message.message_id(), 0x0002);
//! assert_eq!(message.body, Body::Heartbeat);
//! ```

mod builtin;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Jt808Error, Result};
use crate::protocol::{DeviceId, Header};

pub use builtin::{
    ids, register_result, response_result, Heartbeat, PlatformGeneralResponse, RegisterResponse,
    TerminalAuth, TerminalGeneralResponse, TerminalRegister,
};

/// A typed message body with a fixed message id.
///
/// Implement this for collaborator message types and register them with
/// [`MessageRegistry::register_body`](crate::codec::MessageRegistry::register_body).
/// The default `into_body`/`from_body` wrap the value in [`Body::Extension`].
pub trait MessageBody: fmt::Debug + PartialEq + Send + Sync + Sized + 'static {
    /// Message id this body travels under.
    const MESSAGE_ID: u16;

    /// Decode from the body bytes of a frame (or a reassembled message).
    fn decode(header: &Header, reader: &mut BodyReader<'_>) -> Result<Self>;

    /// Encode into `buf`. The header decides version-dependent layouts.
    fn encode(&self, header: &Header, buf: &mut BytesMut) -> Result<()>;

    /// Wrap into a [`Body`].
    fn into_body(self) -> Body {
        Body::Extension(Arc::new(self))
    }

    /// Borrow back out of a [`Body`].
    fn from_body(body: &Body) -> Option<&Self> {
        body.downcast_ref::<Self>()
    }
}

/// Object-safe view of a [`MessageBody`] held in [`Body::Extension`].
pub trait ExtensionBody: fmt::Debug + Send + Sync + 'static {
    /// Message id of the concrete type.
    fn message_id(&self) -> u16;

    /// Encode the concrete value.
    fn encode_extension(&self, header: &Header, buf: &mut BytesMut) -> Result<()>;

    /// For downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Equality across the erased type.
    fn eq_extension(&self, other: &dyn ExtensionBody) -> bool;
}

impl<T: MessageBody> ExtensionBody for T {
    fn message_id(&self) -> u16 {
        T::MESSAGE_ID
    }

    fn encode_extension(&self, header: &Header, buf: &mut BytesMut) -> Result<()> {
        self.encode(header, buf)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_extension(&self, other: &dyn ExtensionBody) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| other == self)
    }
}

/// Message body.
#[derive(Debug, Clone)]
pub enum Body {
    /// 0x0001
    TerminalResponse(TerminalGeneralResponse),
    /// 0x8001
    PlatformResponse(PlatformGeneralResponse),
    /// 0x0002
    Heartbeat,
    /// 0x0100
    Register(TerminalRegister),
    /// 0x8100
    RegisterResponse(RegisterResponse),
    /// 0x0102
    Authentication(TerminalAuth),
    /// Unregistered id or un-reassembled sub-package: bytes as received.
    Raw(Bytes),
    /// Collaborator-defined body.
    Extension(Arc<dyn ExtensionBody>),
}

impl Body {
    /// Downcast an extension body.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        match self {
            Body::Extension(ext) => ext.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Raw bytes, if this body is opaque.
    pub fn as_raw(&self) -> Option<&Bytes> {
        match self {
            Body::Raw(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Whether this is an opaque body.
    #[inline]
    pub fn is_raw(&self) -> bool {
        matches!(self, Body::Raw(_))
    }
}

impl PartialEq for Body {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Body::TerminalResponse(a), Body::TerminalResponse(b)) => a == b,
            (Body::PlatformResponse(a), Body::PlatformResponse(b)) => a == b,
            (Body::Heartbeat, Body::Heartbeat) => true,
            (Body::Register(a), Body::Register(b)) => a == b,
            (Body::RegisterResponse(a), Body::RegisterResponse(b)) => a == b,
            (Body::Authentication(a), Body::Authentication(b)) => a == b,
            (Body::Raw(a), Body::Raw(b)) => a == b,
            (Body::Extension(a), Body::Extension(b)) => a.eq_extension(b.as_ref()),
            _ => false,
        }
    }
}

/// A decoded or outbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message header.
    pub header: Header,
    /// Message body.
    pub body: Body,
}

impl Message {
    /// Create a message from header and body.
    pub fn new(header: Header, body: Body) -> Self {
        Self { header, body }
    }

    /// Create a message from a typed body.
    ///
    /// The header's id is set from the type and its body length from the
    /// encoded body. A body that fails to encode keeps the old length; the
    /// error resurfaces when the message is encoded.
    pub fn from_body<T: MessageBody>(mut header: Header, body: T) -> Self {
        header.message_id = T::MESSAGE_ID;
        let mut scratch = BytesMut::new();
        if body.encode(&header, &mut scratch).is_ok() {
            header.body_length = scratch.len();
        }
        Self {
            header,
            body: body.into_body(),
        }
    }

    /// Create a message with an opaque body; the body length is set from it.
    pub fn raw(mut header: Header, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        header.body_length = body.len();
        Self {
            header,
            body: Body::Raw(body),
        }
    }

    /// Get the message id.
    #[inline]
    pub fn message_id(&self) -> u16 {
        self.header.message_id
    }

    /// Get the device id.
    #[inline]
    pub fn device_id(&self) -> &DeviceId {
        &self.header.device_id
    }

    /// Get the serial number.
    #[inline]
    pub fn serial_number(&self) -> u16 {
        self.header.serial_number
    }

    /// Borrow the body as `T`.
    pub fn body_as<T: MessageBody>(&self) -> Option<&T> {
        T::from_body(&self.body)
    }
}

/// Cursor over body bytes that fails with `BodyTooShort`.
pub struct BodyReader<'a> {
    message_id: u16,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    /// Create a reader over the body of message `message_id`.
    pub fn new(message_id: u16, buf: &'a [u8]) -> Self {
        Self {
            message_id,
            buf,
            pos: 0,
        }
    }

    /// Bytes not yet consumed.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Take exactly `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Jt808Error::BodyTooShort {
                message_id: self.message_id,
                needed: self.pos + n,
                available: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Take everything left.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    /// Read a byte.
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a big-endian u16.
    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian u32.
    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a fixed-width text field, trimming trailing NUL padding.
    pub fn fixed_str(&mut self, width: usize) -> Result<String> {
        let raw = self.take(width)?;
        let end = raw.iter().rposition(|&b| b != 0x00).map_or(0, |i| i + 1);
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }
}

/// Write a text field padded with NUL to exactly `width` bytes.
pub fn put_fixed_str(
    buf: &mut BytesMut,
    field: &'static str,
    value: &str,
    width: usize,
) -> Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() > width {
        return Err(Jt808Error::FieldTooLong {
            field,
            max: width,
            actual: bytes.len(),
        });
    }
    buf.put_slice(bytes);
    buf.put_bytes(0x00, width - bytes.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Mileage {
        meters: u32,
    }

    impl MessageBody for Mileage {
        const MESSAGE_ID: u16 = 0x0F01;

        fn decode(_header: &Header, reader: &mut BodyReader<'_>) -> Result<Self> {
            Ok(Self {
                meters: reader.u32()?,
            })
        }

        fn encode(&self, _header: &Header, buf: &mut BytesMut) -> Result<()> {
            buf.put_u32(self.meters);
            Ok(())
        }
    }

    fn header() -> Header {
        Header::new(0, DeviceId::new("013912345678").unwrap(), 3)
    }

    #[test]
    fn test_extension_body_downcast_and_eq() {
        let message = Message::from_body(header(), Mileage { meters: 42 });

        assert_eq!(message.message_id(), 0x0F01);
        assert_eq!(message.body_as::<Mileage>(), Some(&Mileage { meters: 42 }));
        assert_eq!(message.body, Mileage { meters: 42 }.into_body());
        assert_ne!(message.body, Mileage { meters: 43 }.into_body());
        assert_ne!(message.body, Body::Raw(Bytes::from_static(&[0, 0, 0, 42])));
    }

    #[test]
    fn test_body_reader_reports_shortfall() {
        let mut reader = BodyReader::new(0x0F01, &[0x00, 0x01]);
        assert_eq!(reader.u16().unwrap(), 1);
        match reader.u8().unwrap_err() {
            Jt808Error::BodyTooShort {
                message_id,
                needed,
                available,
            } => {
                assert_eq!(message_id, 0x0F01);
                assert_eq!(needed, 3);
                assert_eq!(available, 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_fixed_str_trims_padding() {
        let mut buf = BytesMut::new();
        put_fixed_str(&mut buf, "model", "TX-1", 8).unwrap();
        assert_eq!(buf.len(), 8);

        let mut reader = BodyReader::new(0, &buf);
        assert_eq!(reader.fixed_str(8).unwrap(), "TX-1");
        assert!(put_fixed_str(&mut buf, "model", "too long", 4).is_err());
    }

    #[test]
    fn test_fixed_str_keeps_trailing_spaces() {
        let mut buf = BytesMut::new();
        put_fixed_str(&mut buf, "terminal_id", "T01 ", 7).unwrap();

        let mut reader = BodyReader::new(0, &buf);
        assert_eq!(reader.fixed_str(7).unwrap(), "T01 ");
    }

    #[test]
    fn test_constructors_set_body_length() {
        let typed = Message::from_body(header(), Mileage { meters: 42 });
        assert_eq!(typed.header.body_length, 4);

        let raw = Message::raw(header(), vec![1, 2, 3]);
        assert_eq!(raw.header.body_length, 3);
    }
}
