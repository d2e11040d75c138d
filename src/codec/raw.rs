//! Raw codec - pass-through for opaque bodies.
//!
//! Used for message ids with no registered codec and for sub-packages that
//! have not been reassembled yet. Bytes are stored unmodified.
//!
//! # Example
//!
//! ```
//! use jt808_core::codec::{BodyCodec, RawCodec};
//! use jt808_core::protocol::{DeviceId, Header};
//!
//! let header = Header::new(0x0F00, DeviceId::new("013912345678").unwrap(), 1);
//! let body = RawCodec.decode_body(&header, b"\x01\x02").unwrap();
//! assert_eq!(&RawCodec.encode_body(&header, &body).unwrap()[..], b"\x01\x02");
//! ```

use bytes::Bytes;

use super::BodyCodec;
use crate::error::{Jt808Error, Result};
use crate::message::Body;
use crate::protocol::Header;

/// Codec that keeps body bytes as [`Body::Raw`].
pub struct RawCodec;

impl BodyCodec for RawCodec {
    fn decode_body(&self, _header: &Header, body: &[u8]) -> Result<Body> {
        Ok(Body::Raw(Bytes::copy_from_slice(body)))
    }

    fn encode_body(&self, header: &Header, body: &Body) -> Result<Bytes> {
        body.as_raw()
            .cloned()
            .ok_or(Jt808Error::BodyMismatch(header.message_id))
    }
}
