//! Outbound side of a session's transport.
//!
//! A TCP session writes through its connection's writer task. A UDP session
//! shares the server socket and remembers the terminal's last source address.
//! Both carry a close signal: closing a TCP handle wakes the connection's
//! read loop so it stops reading and tears the connection down.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

use crate::error::{Jt808Error, Result};
use crate::writer::WriterHandle;

/// Transport a session runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Udp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Udp => write!(f, "udp"),
        }
    }
}

enum Link {
    Tcp {
        writer: WriterHandle,
        peer: SocketAddr,
    },
    Udp {
        socket: Arc<UdpSocket>,
        peer: Mutex<SocketAddr>,
    },
}

/// Sends wrapped frames to one terminal.
pub struct TransportHandle {
    link: Link,
    closed: AtomicBool,
    close_notify: Notify,
}

impl TransportHandle {
    /// Handle over a TCP connection's writer task.
    pub fn tcp(writer: WriterHandle, peer: SocketAddr) -> Self {
        Self::with_link(Link::Tcp { writer, peer })
    }

    /// Handle over the shared UDP socket, addressed to `peer`.
    pub fn udp(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self::with_link(Link::Udp {
            socket,
            peer: Mutex::new(peer),
        })
    }

    fn with_link(link: Link) -> Self {
        Self {
            link,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    /// Transport kind.
    pub fn kind(&self) -> TransportKind {
        match self.link {
            Link::Tcp { .. } => TransportKind::Tcp,
            Link::Udp { .. } => TransportKind::Udp,
        }
    }

    /// Current peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        match &self.link {
            Link::Tcp { peer, .. } => *peer,
            Link::Udp { peer, .. } => *peer.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Follow a UDP terminal to a new source address. No effect on TCP.
    pub fn update_peer(&self, addr: SocketAddr) {
        if let Link::Udp { peer, .. } = &self.link {
            let mut current = peer.lock().unwrap_or_else(PoisonError::into_inner);
            if *current != addr {
                tracing::debug!("UDP peer moved from {} to {}", *current, addr);
                *current = addr;
            }
        }
    }

    /// Send one wrapped frame.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` once closed, `Backpressure` from a saturated TCP
    /// writer, `Io` from the UDP socket.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Jt808Error::ConnectionClosed);
        }
        match &self.link {
            Link::Tcp { writer, .. } => writer.send(frame).await,
            Link::Udp { socket, .. } => {
                let peer = self.peer_addr();
                socket.send_to(&frame, peer).await?;
                Ok(())
            }
        }
    }

    /// Close the handle. Idempotent; returns whether this call closed it.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.close_notify.notify_waiters();
        }
        first
    }

    /// Whether [`close`](Self::close) has been called.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolve once the handle is closed.
    pub async fn closed(&self) {
        let notified = self.close_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("kind", &self.kind())
            .field("peer", &self.peer_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}
