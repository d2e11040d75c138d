//! Context handed to message handlers.
//!
//! Gives a handler the session a message arrived on, plus the ways to answer
//! it:
//! - `reply` - encode and send any message, filling in serial numbers
//! - `general_response` - answer with a platform general response (0x8001)
//! - `send_frame` - push an already wrapped frame
//!
//! # Example
//!
//! ```ignore
//! async fn on_heartbeat(ctx: SessionContext, message: Message) -> HandlerResult {
//!     ctx.general_response(&message.header, response_result::SUCCESS).await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use bytes::Bytes;

use crate::codec::MessageRegistry;
use crate::error::{Jt808Error, Result};
use crate::message::{Message, MessageBody, PlatformGeneralResponse};
use crate::protocol::{DeviceId, Header, MAX_BODY_LENGTH};
use crate::session::{Session, SessionId, SessionTable};

/// Per-message view of the session, table and registry.
///
/// `Clone` and cheap: handlers may move it into spawned tasks.
#[derive(Clone)]
pub struct SessionContext {
    session: Arc<Session>,
    sessions: Arc<SessionTable>,
    registry: Arc<MessageRegistry>,
}

impl SessionContext {
    pub fn new(
        session: Arc<Session>,
        sessions: Arc<SessionTable>,
        registry: Arc<MessageRegistry>,
    ) -> Self {
        Self {
            session,
            sessions,
            registry,
        }
    }

    #[inline]
    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// Device currently bound to the session.
    pub fn device_id(&self) -> Option<DeviceId> {
        self.session.device_id()
    }

    #[inline]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    #[inline]
    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    #[inline]
    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    /// Header addressed back to the terminal that sent `request`.
    ///
    /// Copies device id and protocol version; the serial is filled in by
    /// [`reply`](Self::reply).
    pub fn header_for(&self, message_id: u16, request: &Header) -> Header {
        let header = Header::new(message_id, request.device_id.clone(), 0);
        match request.protocol_version {
            Some(version) => header.with_version(version),
            None => header,
        }
    }

    /// Encode `message` and send it to the terminal.
    ///
    /// Serial numbers come from the session counter; a body longer than one
    /// frame is split into sub-packages. Returns the serial of the first
    /// frame sent.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` if the session was evicted meanwhile, encode errors
    /// from the registry, and transport errors from the send.
    pub async fn reply(&self, message: Message) -> Result<u16> {
        if self.sessions.lookup_by_session(self.session_id()).is_none() {
            return Err(Jt808Error::SessionNotFound(self.session_id()));
        }

        let mut first_serial = None;
        let frames = self
            .registry
            .encode_fragmented(&message, MAX_BODY_LENGTH, || {
                let serial = self.session.next_serial();
                first_serial.get_or_insert(serial);
                serial
            })?;

        for frame in frames {
            self.session.send(frame).await?;
        }
        tracing::trace!(
            "Sent {:#06x} to session {}",
            message.message_id(),
            self.session_id()
        );
        Ok(first_serial.unwrap_or_default())
    }

    /// Reply with a typed body addressed back to the sender of `request`.
    pub async fn reply_body<T: MessageBody>(&self, request: &Header, body: T) -> Result<u16> {
        let header = self.header_for(T::MESSAGE_ID, request);
        self.reply(Message::from_body(header, body)).await
    }

    /// Answer `request` with a platform general response carrying `result`.
    pub async fn general_response(&self, request: &Header, result: u8) -> Result<u16> {
        self.reply_body(request, PlatformGeneralResponse::answering(request, result))
            .await
    }

    /// Send an already wrapped frame.
    pub async fn send_frame(&self, frame: Bytes) -> Result<()> {
        self.session.send(frame).await
    }

    /// Mark the session authenticated (or not).
    pub fn set_authenticated(&self, authenticated: bool) -> Result<()> {
        self.sessions
            .set_authenticated(self.session_id(), authenticated)
    }

    /// Close the connection; the dispatcher evicts the session.
    pub fn close(&self) {
        self.session.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, DuplexStream};

    use crate::message::{response_result, Body, Heartbeat};
    use crate::protocol::FrameBuffer;
    use crate::session::test_support::duplex_transport;

    fn context() -> (SessionContext, DuplexStream) {
        let sessions = Arc::new(SessionTable::default());
        let (transport, peer) = duplex_transport();
        let id = sessions.create(transport);
        let session = sessions.lookup_by_session(id).unwrap();
        let ctx = SessionContext::new(session, sessions, Arc::new(MessageRegistry::with_defaults()));
        (ctx, peer)
    }

    async fn read_frames(peer: &mut DuplexStream, count: usize) -> Vec<Bytes> {
        let mut buffer = FrameBuffer::new();
        let mut frames = Vec::new();
        let mut buf = [0u8; 4096];
        while frames.len() < count {
            let n = peer.read(&mut buf).await.unwrap();
            assert!(n > 0, "peer closed early");
            frames.extend(buffer.push(&buf[..n]).frames);
        }
        frames
    }

    fn request() -> Header {
        Header::new(0x0002, DeviceId::new("013912345678").unwrap(), 77)
    }

    #[tokio::test]
    async fn test_general_response_answers_request() {
        let (ctx, mut peer) = context();

        let serial = ctx
            .general_response(&request(), response_result::SUCCESS)
            .await
            .unwrap();
        assert_eq!(serial, 1);

        let frames = read_frames(&mut peer, 1).await;
        let reply = ctx.registry().decode(&frames[0]).unwrap();
        assert_eq!(reply.message_id(), 0x8001);
        assert_eq!(reply.serial_number(), 1);
        assert_eq!(reply.device_id().as_str(), "013912345678");
        assert_eq!(
            reply.body_as::<PlatformGeneralResponse>(),
            Some(&PlatformGeneralResponse {
                reply_serial: 77,
                reply_id: 0x0002,
                result: response_result::SUCCESS,
            })
        );
        assert_eq!(ctx.session().sent_count(), 1);
    }

    #[tokio::test]
    async fn test_reply_keeps_2019_layout() {
        let (ctx, mut peer) = context();
        let request = Header::new(0x0002, DeviceId::new("01391234567800000000").unwrap(), 1)
            .with_version(1);

        ctx.reply_body(&request, Heartbeat).await.unwrap();

        let frames = read_frames(&mut peer, 1).await;
        let reply = ctx.registry().decode(&frames[0]).unwrap();
        assert_eq!(reply.header.protocol_version, Some(1));
        assert_eq!(reply.body, Body::Heartbeat);
    }

    #[tokio::test]
    async fn test_long_reply_is_fragmented() {
        let (ctx, mut peer) = context();
        let header = ctx.header_for(0x8900, &request());

        let first = ctx
            .reply(Message::raw(header, vec![0x5A; 2100]))
            .await
            .unwrap();
        assert_eq!(first, 1);

        let frames = read_frames(&mut peer, 3).await;
        let serials: Vec<u16> = frames
            .iter()
            .map(|f| ctx.registry().unpack(f).unwrap().header.serial_number)
            .collect();
        assert_eq!(serials, vec![1, 2, 3]);
        assert_eq!(ctx.session().sent_count(), 3);
    }

    #[tokio::test]
    async fn test_reply_after_eviction_fails() {
        let (ctx, _peer) = context();
        ctx.sessions().evict(ctx.session_id());

        let err = ctx
            .general_response(&request(), response_result::SUCCESS)
            .await
            .unwrap_err();
        assert!(matches!(err, Jt808Error::SessionNotFound(_)));
    }
}
