//! Message registry: message id to body codec, plus the full pipeline.
//!
//! ```text
//! decode: raw ─► frame::unwrap ─► Header::decode ─► codec.decode_body ─► Message
//! encode: Message ─► codec.encode_body ─► Header::encode ─► frame::wrap ─► raw
//! ```
//!
//! Ids with no codec decode to [`Body::Raw`]. An empty body that its codec
//! finds too short (a bare acknowledgement) also stays [`Body::Raw`].
//! Registration is allowed at any time and the last registration for an id
//! wins; decoding holds a shard lock only long enough to clone the codec
//! handle.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;

use super::{BodyCodec, RawCodec, TypedCodec};
use crate::error::{Jt808Error, Result};
use crate::message::{
    Body, Heartbeat, Message, MessageBody, PlatformGeneralResponse, RegisterResponse,
    TerminalAuth, TerminalGeneralResponse, TerminalRegister,
};
use crate::protocol::{self, Header, MAX_BODY_LENGTH};

/// A frame after unwrapping and header decoding, body still undecoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Decoded header.
    pub header: Header,
    /// Body bytes of this frame.
    pub body: Bytes,
}

/// Registry mapping message ids to body codecs.
pub struct MessageRegistry {
    codecs: DashMap<u16, Arc<dyn BodyCodec>>,
}

impl MessageRegistry {
    /// Create an empty registry: every id decodes to [`Body::Raw`].
    pub fn new() -> Self {
        Self {
            codecs: DashMap::new(),
        }
    }

    /// Create a registry with the built-in session-control bodies.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register_body::<TerminalGeneralResponse>();
        registry.register_body::<PlatformGeneralResponse>();
        registry.register_body::<Heartbeat>();
        registry.register_body::<TerminalRegister>();
        registry.register_body::<RegisterResponse>();
        registry.register_body::<TerminalAuth>();
        registry
    }

    /// Register a codec for `message_id`, replacing any previous one.
    pub fn register<C: BodyCodec>(&self, message_id: u16, codec: C) {
        self.register_arc(message_id, Arc::new(codec));
    }

    /// Register a shared codec for `message_id`, replacing any previous one.
    pub fn register_arc(&self, message_id: u16, codec: Arc<dyn BodyCodec>) {
        if self.codecs.insert(message_id, codec).is_some() {
            tracing::debug!("Replaced body codec for message {:#06x}", message_id);
        }
    }

    /// Register a [`MessageBody`] type under its own id.
    pub fn register_body<T: MessageBody>(&self) {
        self.register(T::MESSAGE_ID, TypedCodec::<T>::new());
    }

    /// Get the codec for a message id.
    pub fn codec_for(&self, message_id: u16) -> Option<Arc<dyn BodyCodec>> {
        self.codecs
            .get(&message_id)
            .map(|codec| codec.value().clone())
    }

    /// Check if a message id has a codec.
    pub fn is_registered(&self, message_id: u16) -> bool {
        self.codecs.contains_key(&message_id)
    }

    /// All registered message ids, ascending.
    pub fn registered_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.codecs.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Unwrap a frame and decode its header, leaving the body as bytes.
    ///
    /// # Errors
    ///
    /// `Framing`, `Checksum`, `HeaderTooShort`, or `Framing` when the declared
    /// body length disagrees with the bytes carried.
    pub fn unpack(&self, raw: &[u8]) -> Result<Packet> {
        let payload = protocol::unwrap(raw)?;
        let (header, offset) = Header::decode(&payload)?;
        let body = payload.slice(offset..);
        if body.len() != header.body_length {
            return Err(Jt808Error::Framing(format!(
                "message {:#06x} declares a {}-byte body but carries {}",
                header.message_id,
                header.body_length,
                body.len()
            )));
        }
        Ok(Packet { header, body })
    }

    /// Decode a body against its header.
    ///
    /// Sub-packages stay [`Body::Raw`]: only the joined body is meaningful.
    pub fn decode_body(&self, header: Header, body: Bytes) -> Result<Message> {
        if header.is_fragmented() {
            return Ok(Message::new(header, Body::Raw(body)));
        }
        let body = match self.codec_for(header.message_id) {
            Some(codec) => match codec.decode_body(&header, &body) {
                Err(Jt808Error::BodyTooShort { .. }) if body.is_empty() => {
                    tracing::trace!(
                        "Empty body for message {:#06x}, keeping it opaque",
                        header.message_id
                    );
                    Body::Raw(body)
                }
                decoded => decoded?,
            },
            None => {
                tracing::trace!(
                    "No codec for message {:#06x}, keeping body opaque",
                    header.message_id
                );
                RawCodec.decode_body(&header, &body)?
            }
        };
        Ok(Message::new(header, body))
    }

    /// Decode a raw frame into a message.
    ///
    /// # Example
    ///
    /// ```
    /// use jt808_core::codec::MessageRegistry;
    /// use jt808_core::protocol::wrap;
    ///
    /// let registry = MessageRegistry::with_defaults();
    /// let raw = wrap(&[0x00, 0x01, 0x00, 0x00, 0x12, 0x34, 0x56, 0x78, 0x90, 0x01, 0x00, 0x01]);
    /// let message = registry.decode(&raw).unwrap();
    ///
    /// assert_eq!(message.message_id(), 0x0001);
    /// assert_eq!(message.device_id().as_str(), "123456789001");
    /// assert_eq!(registry.encode(&message).unwrap(), raw);
    /// ```
    pub fn decode(&self, raw: &[u8]) -> Result<Message> {
        let Packet { header, body } = self.unpack(raw)?;
        self.decode_body(header, body)
    }

    /// Encode a message body through its codec.
    ///
    /// [`Body::Raw`] is written as-is; typed bodies need a registered codec.
    pub fn encode_body(&self, message: &Message) -> Result<Bytes> {
        let header = &message.header;
        if let Body::Raw(bytes) = &message.body {
            return Ok(bytes.clone());
        }
        let codec = self
            .codec_for(header.message_id)
            .ok_or(Jt808Error::UnregisteredMessage(header.message_id))?;
        codec.encode_body(header, &message.body)
    }

    /// Encode a message into one wire frame.
    ///
    /// The body length bits are taken from the encoded body, whatever
    /// `header.body_length` says. Messages built with [`Message::raw`] or
    /// [`Message::from_body`] already carry the right length; after editing a
    /// body in place use [`encode_and_refresh`](Self::encode_and_refresh).
    ///
    /// # Errors
    ///
    /// `BodyTooLong` when the body exceeds 1023 bytes; use
    /// [`encode_fragmented`](Self::encode_fragmented) for those.
    pub fn encode(&self, message: &Message) -> Result<Bytes> {
        let body = self.encode_body(message)?;
        frame_with(&message.header, &body)
    }

    /// Encode like [`encode`](Self::encode) and store the encoded body length
    /// in `message.header`, so the message equals its decoded frame.
    pub fn encode_and_refresh(&self, message: &mut Message) -> Result<Bytes> {
        let body = self.encode_body(message)?;
        let frame = frame_with(&message.header, &body)?;
        message.header.body_length = body.len();
        Ok(frame)
    }

    /// Encode a message into as many sub-package frames as its body needs.
    ///
    /// Each part carries at most `max_part_len` body bytes (clamped to
    /// 1..=1023) and takes its serial number from `next_serial`. A body that
    /// fits in one part produces a single unfragmented frame.
    pub fn encode_fragmented(
        &self,
        message: &Message,
        max_part_len: usize,
        mut next_serial: impl FnMut() -> u16,
    ) -> Result<Vec<Bytes>> {
        let body = self.encode_body(message)?;
        let max_part_len = max_part_len.clamp(1, MAX_BODY_LENGTH);

        let mut header = message.header.clone();
        if body.len() <= max_part_len {
            header.fragment = None;
            header.serial_number = next_serial();
            return Ok(vec![frame_with(&header, &body)?]);
        }

        let total = u16::try_from(body.len().div_ceil(max_part_len))
            .map_err(|_| Jt808Error::BodyTooLong(body.len()))?;
        body.chunks(max_part_len)
            .zip(1..=total)
            .map(|(part, index)| {
                let mut part_header = header.clone().with_fragment(total, index);
                part_header.serial_number = next_serial();
                frame_with(&part_header, part)
            })
            .collect()
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn frame_with(header: &Header, body: &[u8]) -> Result<Bytes> {
    let mut payload = BytesMut::with_capacity(header.encoded_len() + body.len());
    header.encode_into(body.len(), &mut payload)?;
    payload.extend_from_slice(body);
    Ok(protocol::wrap(&payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{response_result, BodyReader};
    use crate::protocol::{checksum, DeviceId};
    use bytes::BufMut;

    fn device() -> DeviceId {
        DeviceId::new("013912345678").unwrap()
    }

    #[derive(Debug, PartialEq)]
    struct Odometer(u32);

    impl MessageBody for Odometer {
        const MESSAGE_ID: u16 = 0x0F10;

        fn decode(_header: &Header, reader: &mut BodyReader<'_>) -> Result<Self> {
            Ok(Self(reader.u32()?))
        }

        fn encode(&self, _header: &Header, buf: &mut BytesMut) -> Result<()> {
            buf.put_u32(self.0);
            Ok(())
        }
    }

    #[test]
    fn test_scenario_frame_roundtrip() {
        let payload = [
            0x00, 0x01, 0x00, 0x00, 0x12, 0x34, 0x56, 0x78, 0x90, 0x01, 0x00, 0x01,
        ];
        let mut raw = vec![0x7E];
        raw.extend_from_slice(&payload);
        raw.push(checksum::xor(&payload));
        raw.push(0x7E);

        let registry = MessageRegistry::new();
        let message = registry.decode(&raw).unwrap();

        assert_eq!(message.header.message_id, 0x0001);
        assert_eq!(message.header.body_length, 0);
        assert_eq!(message.header.device_id.as_str(), "123456789001");
        assert_eq!(message.header.serial_number, 1);
        assert_eq!(message.body, Body::Raw(Bytes::new()));
        assert_eq!(&registry.encode(&message).unwrap()[..], &raw[..]);
    }

    #[test]
    fn test_unknown_id_decodes_to_raw() {
        let registry = MessageRegistry::with_defaults();
        let message = Message::raw(Header::new(0x0F99, device(), 3), vec![1, 2, 0x7E]);

        let raw = registry.encode(&message).unwrap();
        let decoded = registry.decode(&raw).unwrap();

        assert_eq!(decoded, message);
    }

    #[test]
    fn test_builtin_roundtrip() {
        let registry = MessageRegistry::with_defaults();
        let message = Message::from_body(
            Header::new(0, device(), 77),
            PlatformGeneralResponse {
                reply_serial: 12,
                reply_id: 0x0200,
                result: response_result::SUCCESS,
            },
        );

        let decoded = registry.decode(&registry.encode(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_register_extension_and_overwrite() {
        let registry = MessageRegistry::new();
        assert!(!registry.is_registered(0x0F10));

        registry.register(0x0F10, RawCodec);
        registry.register_body::<Odometer>();
        assert_eq!(registry.registered_ids(), vec![0x0F10]);

        let message = Message::from_body(Header::new(0, device(), 1), Odometer(123_456));
        let decoded = registry.decode(&registry.encode(&message).unwrap()).unwrap();

        assert_eq!(decoded.body_as::<Odometer>(), Some(&Odometer(123_456)));
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_typed_body_without_codec_is_rejected() {
        let registry = MessageRegistry::new();
        let message = Message::from_body(Header::new(0, device(), 1), Heartbeat);
        assert!(matches!(
            registry.encode(&message),
            Err(Jt808Error::UnregisteredMessage(0x0002))
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_body() {
        let registry = MessageRegistry::new();
        let message = Message::raw(Header::new(0x0F00, device(), 1), vec![0u8; 1024]);
        assert!(matches!(
            registry.encode(&message),
            Err(Jt808Error::BodyTooLong(1024))
        ));
    }

    #[test]
    fn test_declared_length_mismatch_is_rejected() {
        let registry = MessageRegistry::new();
        let mut payload = Header::new(0x0F00, device(), 1).encode(3).unwrap();
        payload.extend_from_slice(&[1, 2]);
        let raw = protocol::wrap(&payload);

        assert!(matches!(registry.decode(&raw), Err(Jt808Error::Framing(_))));
    }

    #[test]
    fn test_bad_body_is_reported() {
        let registry = MessageRegistry::with_defaults();
        let message = Message::raw(Header::new(0x8001, device(), 1), vec![0x00]);
        let raw = registry.encode(&message).unwrap();

        assert!(matches!(
            registry.decode(&raw),
            Err(Jt808Error::BodyTooShort { message_id: 0x8001, .. })
        ));
    }

    #[test]
    fn test_encode_fragmented_splits_and_numbers_parts() {
        let registry = MessageRegistry::new();
        let body: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let message = Message::raw(Header::new(0x0801, device(), 0), body.clone());

        let mut serial = 40u16;
        let frames = registry
            .encode_fragmented(&message, 1000, || {
                serial += 1;
                serial
            })
            .unwrap();

        assert_eq!(frames.len(), 3);
        let mut joined = Vec::new();
        for (i, raw) in frames.iter().enumerate() {
            let packet = registry.unpack(raw).unwrap();
            let info = packet.header.fragment.unwrap();
            assert_eq!(info.total, 3);
            assert_eq!(usize::from(info.index), i + 1);
            assert_eq!(packet.header.serial_number, 41 + i as u16);
            joined.extend_from_slice(&packet.body);
        }
        assert_eq!(joined, body);
    }

    #[test]
    fn test_encode_fragmented_small_body_is_single_frame() {
        let registry = MessageRegistry::new();
        let message = Message::raw(Header::new(0x0801, device(), 0), vec![1, 2, 3]);

        let frames = registry.encode_fragmented(&message, 1023, || 9).unwrap();

        assert_eq!(frames.len(), 1);
        let packet = registry.unpack(&frames[0]).unwrap();
        assert!(!packet.header.is_fragmented());
        assert_eq!(packet.header.serial_number, 9);
    }

    #[test]
    fn test_example_frame_decodes_with_defaults() {
        let payload = [
            0x00, 0x01, 0x00, 0x00, 0x12, 0x34, 0x56, 0x78, 0x90, 0x01, 0x00, 0x01,
        ];
        let raw = protocol::wrap(&payload);

        let registry = MessageRegistry::with_defaults();
        let message = registry.decode(&raw).unwrap();

        assert_eq!(message.message_id(), 0x0001);
        assert_eq!(message.body, Body::Raw(Bytes::new()));
        assert_eq!(registry.encode(&message).unwrap(), raw);
    }

    #[test]
    fn test_full_terminal_response_still_typed() {
        let registry = MessageRegistry::with_defaults();
        let message = Message::from_body(
            Header::new(0, device(), 5),
            TerminalGeneralResponse {
                reply_serial: 3,
                reply_id: 0x8103,
                result: response_result::SUCCESS,
            },
        );

        let decoded = registry.decode(&registry.encode(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert!(decoded.body_as::<TerminalGeneralResponse>().is_some());
    }

    #[test]
    fn test_constructed_messages_roundtrip() {
        let registry = MessageRegistry::with_defaults();
        let messages = [
            Message::from_body(
                Header::new(0, device(), 7),
                PlatformGeneralResponse {
                    reply_serial: 1,
                    reply_id: 0x0002,
                    result: response_result::SUCCESS,
                },
            ),
            Message::raw(Header::new(0x0F00, device(), 8), vec![9, 8, 7, 0x7D]),
            Message::from_body(Header::new(0, device(), 9), Heartbeat),
        ];

        for message in messages {
            let decoded = registry.decode(&registry.encode(&message).unwrap()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_encode_and_refresh_after_body_edit() {
        let registry = MessageRegistry::new();
        let mut message = Message::raw(Header::new(0x0F00, device(), 1), vec![1]);
        message.body = Body::Raw(Bytes::from_static(b"longer body"));

        let raw = registry.encode_and_refresh(&mut message).unwrap();

        assert_eq!(message.header.body_length, 11);
        assert_eq!(registry.decode(&raw).unwrap(), message);
    }

    #[test]
    fn test_2019_device_id_roundtrips() {
        let registry = MessageRegistry::new();
        let header = Header::new(0x0F00, DeviceId::new("00000000123456789012").unwrap(), 1)
            .with_version(1);
        let message = Message::raw(header, Bytes::new());

        let decoded = registry.decode(&registry.encode(&message).unwrap()).unwrap();
        assert_eq!(decoded.device_id(), message.device_id());

        let mismatched = Message::raw(Header::new(0x0F00, device(), 1).with_version(1), Bytes::new());
        assert!(matches!(
            registry.encode(&mismatched),
            Err(Jt808Error::InvalidDeviceId(_))
        ));
    }
}
