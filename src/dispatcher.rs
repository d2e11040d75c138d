//! Frame-to-message pipeline shared by every connection and UDP worker.
//!
//! For each raw frame: unwrap and decode the header, record activity on the
//! session, (re)bind the header's device id to the session, feed
//! sub-packages through the reassembler, then decode the body. Every failure
//! here belongs to one frame only; callers log it and keep reading.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::codec::{MessageRegistry, Packet};
use crate::error::{Jt808Error, Result};
use crate::fragment::{FragmentReassembler, Reassembly};
use crate::handler::SessionContext;
use crate::message::Message;
use crate::protocol::checksum;
use crate::session::{Session, SessionTable};
use crate::transport::{TransportHandle, TransportKind};

/// Shared decode state: registry, sessions and fragment groups.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<MessageRegistry>,
    sessions: Arc<SessionTable>,
    fragments: Arc<FragmentReassembler>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<MessageRegistry>,
        sessions: Arc<SessionTable>,
        fragments: Arc<FragmentReassembler>,
    ) -> Self {
        Self {
            registry,
            sessions,
            fragments,
        }
    }

    #[inline]
    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    #[inline]
    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    #[inline]
    pub fn fragments(&self) -> &Arc<FragmentReassembler> {
        &self.fragments
    }

    /// Handler context for `session`.
    pub fn context(&self, session: Arc<Session>) -> SessionContext {
        SessionContext::new(session, self.sessions.clone(), self.registry.clone())
    }

    /// Process one raw frame received on `session`.
    ///
    /// Returns `Ok(None)` while a fragmented message is still incomplete.
    ///
    /// # Errors
    ///
    /// Any frame-local decode error, `InvalidFragment`, or `SessionNotFound`
    /// when the session was evicted while the frame was in flight.
    pub fn process_frame(&self, session: &Arc<Session>, raw: &[u8]) -> Result<Option<Message>> {
        let packet = self.registry.unpack(raw).inspect_err(|e| {
            tracing::debug!(
                "Session {} dropped frame ({}): {}",
                session.id(),
                e,
                checksum::to_hex(raw)
            );
        })?;
        self.process_packet(session, packet)
    }

    /// Route one UDP datagram to its session by device id.
    ///
    /// A device already bound to a session (over either transport) keeps it;
    /// an unknown device gets a new UDP session bound to its id.
    pub fn process_datagram(
        &self,
        socket: &Arc<UdpSocket>,
        peer: SocketAddr,
        raw: &[u8],
    ) -> Result<Option<(Arc<Session>, Message)>> {
        let packet = self.registry.unpack(raw).inspect_err(|e| {
            tracing::debug!(
                "Dropped datagram from {} ({}): {}",
                peer,
                e,
                checksum::to_hex(raw)
            );
        })?;

        let device_id = &packet.header.device_id;
        let session = match self.sessions.lookup_by_device(device_id) {
            Some(session) => {
                if session.transport().kind() == TransportKind::Udp {
                    session.transport().update_peer(peer);
                }
                session
            }
            None => {
                let id = self
                    .sessions
                    .create(TransportHandle::udp(socket.clone(), peer));
                self.sessions.bind(id, device_id.clone())?;
                self.sessions
                    .lookup_by_session(id)
                    .ok_or(Jt808Error::SessionNotFound(id))?
            }
        };

        let message = self.process_packet(&session, packet)?;
        Ok(message.map(|message| (session, message)))
    }

    fn process_packet(&self, session: &Arc<Session>, packet: Packet) -> Result<Option<Message>> {
        let Packet { header, body } = packet;
        if self.sessions.lookup_by_session(session.id()).is_none() {
            return Err(Jt808Error::SessionNotFound(session.id()));
        }

        session.touch();
        session.record_received();

        if session.device_id().as_ref() != Some(&header.device_id) {
            self.sessions.bind(session.id(), header.device_id.clone())?;
        }
        if session.protocol_version() != header.protocol_version {
            self.sessions
                .set_protocol_version(session.id(), header.protocol_version)?;
        }

        let device_id = header.device_id.clone();
        match self.fragments.accept(&device_id, &header, body)? {
            Reassembly::Complete(Packet { header, body }) => {
                self.registry.decode_body(header, body).map(Some)
            }
            Reassembly::Pending { received, total } => {
                tracing::trace!(
                    "Fragment {:#06x} from {}: {}/{} parts",
                    header.message_id,
                    device_id,
                    received,
                    total
                );
                Ok(None)
            }
        }
    }
}
