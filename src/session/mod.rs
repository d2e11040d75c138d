//! Per-terminal session state and the table that owns it.
//!
//! A [`Session`] is created when a TCP connection is accepted (or a UDP
//! terminal is first seen) and lives in the [`SessionTable`] until it is
//! evicted: on disconnect, on a transport error, or by the idle sweep.
//! Dispatchers and handlers only hold `Arc<Session>` clones looked up per
//! operation.

mod table;

use std::fmt;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::Result;
use crate::protocol::DeviceId;
use crate::transport::TransportHandle;

pub use table::{SessionTable, DEFAULT_IDLE_TIMEOUT};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value.
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
struct SessionState {
    device_id: Option<DeviceId>,
    authenticated: bool,
    protocol_version: Option<u8>,
    last_active: Instant,
}

/// One terminal's server-side state.
pub struct Session {
    id: SessionId,
    transport: TransportHandle,
    created_at: Instant,
    state: Mutex<SessionState>,
    /// Last serial handed out; 0 means none yet.
    serial: AtomicU16,
    received: AtomicU64,
    sent: AtomicU64,
}

impl Session {
    pub(crate) fn new(transport: TransportHandle) -> Self {
        let now = Instant::now();
        Self {
            id: SessionId::next(),
            transport,
            created_at: now,
            state: Mutex::new(SessionState {
                device_id: None,
                authenticated: false,
                protocol_version: None,
                last_active: now,
            }),
            serial: AtomicU16::new(0),
            received: AtomicU64::new(0),
            sent: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[inline]
    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    /// Bound device id, if any.
    pub fn device_id(&self) -> Option<DeviceId> {
        self.state().device_id.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state().authenticated
    }

    /// Protocol version byte last seen from the terminal (2019 layout only).
    pub fn protocol_version(&self) -> Option<u8> {
        self.state().protocol_version
    }

    #[inline]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_active(&self) -> Instant {
        self.state().last_active
    }

    /// Mark activity now.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&self, now: Instant) {
        let mut state = self.state();
        if now > state.last_active {
            state.last_active = now;
        }
    }

    /// Whether the session has been quiet for longer than `timeout` at `now`.
    pub fn is_idle_at(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_active()) > timeout
    }

    /// Messages received from the terminal.
    #[inline]
    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Frames sent to the terminal.
    #[inline]
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Next outbound serial: 1, 2, ..., 0xFFFF, 1, ...
    pub fn next_serial(&self) -> u16 {
        let advance = |current: u16| match current {
            0xFFFF => 1,
            n => n + 1,
        };
        // The closure always returns Some, so both arms carry the old value.
        let previous = match self
            .serial
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(advance(n)))
        {
            Ok(n) | Err(n) => n,
        };
        advance(previous)
    }

    /// Send one wrapped frame to the terminal.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.transport.send(frame).await?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Close the transport. The session stays in its table until evicted.
    pub fn close(&self) {
        if self.transport.close() {
            tracing::debug!("Session {} transport closed", self.id);
        }
    }

    pub(crate) fn set_device_id(&self, device_id: Option<DeviceId>) {
        self.state().device_id = device_id;
    }

    pub(crate) fn set_authenticated(&self, authenticated: bool) {
        self.state().authenticated = authenticated;
    }

    pub(crate) fn set_protocol_version(&self, version: Option<u8>) {
        self.state().protocol_version = version;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("device_id", &state.device_id)
            .field("authenticated", &state.authenticated)
            .field("protocol_version", &state.protocol_version)
            .field("received", &self.received_count())
            .field("sent", &self.sent_count())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::net::SocketAddr;

    use tokio::io::{duplex, DuplexStream};

    use crate::transport::TransportHandle;
    use crate::writer::{spawn_writer_task, WriterConfig};

    /// TCP-style handle writing into an in-memory pipe.
    pub(crate) fn duplex_transport() -> (TransportHandle, DuplexStream) {
        let (client, server) = duplex(64 * 1024);
        let (writer, _task) = spawn_writer_task(client, WriterConfig::default());
        let peer = SocketAddr::from(([127, 0, 0, 1], 6808));
        (TransportHandle::tcp(writer, peer), server)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::duplex_transport;
    use super::*;

    #[tokio::test]
    async fn test_serial_wraps_to_one() {
        let (transport, _peer) = duplex_transport();
        let session = Session::new(transport);

        assert_eq!(session.next_serial(), 1);
        assert_eq!(session.next_serial(), 2);

        session.serial.store(0xFFFE, Ordering::Release);
        assert_eq!(session.next_serial(), 0xFFFF);
        assert_eq!(session.next_serial(), 1);
    }

    #[tokio::test]
    async fn test_idle_tracking() {
        let (transport, _peer) = duplex_transport();
        let session = Session::new(transport);
        let start = session.last_active();
        let timeout = Duration::from_secs(300);

        assert!(!session.is_idle_at(start + Duration::from_secs(299), timeout));
        assert!(session.is_idle_at(start + Duration::from_secs(301), timeout));

        session.touch_at(start + Duration::from_secs(200));
        assert!(!session.is_idle_at(start + Duration::from_secs(301), timeout));

        // Clock going backwards never rewinds activity.
        session.touch_at(start);
        assert_eq!(session.last_active(), start + Duration::from_secs(200));
    }

    #[tokio::test]
    async fn test_send_counts_and_close() {
        use tokio::io::AsyncReadExt;

        let (transport, mut peer) = duplex_transport();
        let session = Session::new(transport);

        session.send(Bytes::from_static(b"\x7e\x00\x7e")).await.unwrap();
        let mut buf = [0u8; 3];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(session.sent_count(), 1);

        session.close();
        assert!(session.transport().is_closed());
        assert!(session.send(Bytes::from_static(b"x")).await.is_err());
        assert_eq!(session.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_session_ids_are_unique() {
        let (a, _pa) = duplex_transport();
        let (b, _pb) = duplex_transport();

        assert_ne!(Session::new(a).id(), Session::new(b).id());
    }
}
