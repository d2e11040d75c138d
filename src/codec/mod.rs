//! Codec module - body codec strategies and the message registry.
//!
//! - [`BodyCodec`] - strategy turning body bytes into a [`Body`] and back
//! - [`TypedCodec`] - adapter from any [`MessageBody`] type to a `BodyCodec`
//! - [`RawCodec`] - opaque fallback that keeps bytes unmodified
//! - [`MessageRegistry`] - message id to codec map, full decode/encode pipeline
//!
//! # Example
//!
//! ```
//! use jt808_core::codec::MessageRegistry;
//! use jt808_core::message::{Heartbeat, Message};
//! use jt808_core::protocol::{DeviceId, Header};
//!
//! let registry = MessageRegistry::with_defaults();
//! let header = Header::new(0, DeviceId::new("013912345678").unwrap(), 5);
//! let message = Message::from_body(header, Heartbeat);
//!
//! let raw = registry.encode(&message).unwrap();
//! assert_eq!(registry.decode(&raw).unwrap(), message);
//! ```

mod raw;
mod registry;

use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};

use crate::error::{Jt808Error, Result};
use crate::message::{Body, BodyReader, MessageBody};
use crate::protocol::Header;

pub use raw::RawCodec;
pub use registry::{MessageRegistry, Packet};

/// Strategy for one message id's body.
pub trait BodyCodec: Send + Sync + 'static {
    /// Decode body bytes.
    fn decode_body(&self, header: &Header, body: &[u8]) -> Result<Body>;

    /// Encode a body. Fails with `BodyMismatch` if handed another type.
    fn encode_body(&self, header: &Header, body: &Body) -> Result<Bytes>;
}

/// `BodyCodec` for a concrete [`MessageBody`] type.
pub struct TypedCodec<T: MessageBody> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T: MessageBody> TypedCodec<T> {
    /// Create a new typed codec.
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T: MessageBody> Default for TypedCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: MessageBody> BodyCodec for TypedCodec<T> {
    fn decode_body(&self, header: &Header, body: &[u8]) -> Result<Body> {
        let mut reader = BodyReader::new(header.message_id, body);
        T::decode(header, &mut reader).map(T::into_body)
    }

    fn encode_body(&self, header: &Header, body: &Body) -> Result<Bytes> {
        let typed = T::from_body(body).ok_or(Jt808Error::BodyMismatch(header.message_id))?;
        let mut buf = BytesMut::new();
        typed.encode(header, &mut buf)?;
        Ok(buf.freeze())
    }
}
