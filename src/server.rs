//! Server builder and runtime loops.
//!
//! The [`ServerBuilder`] collects configuration, the message registry and
//! the handler. [`ServerBuilder::start`] binds the sockets and spawns:
//! 1. the TCP accept loop, one task per accepted connection
//! 2. `udp_workers` tasks receiving on the shared UDP socket
//! 3. one sweep task evicting idle sessions and expired fragment groups
//!
//! Each TCP connection runs a read loop feeding a [`FrameBuffer`], a writer
//! task, and a bounded handler queue. Messages are handed to the handler in
//! arrival order; when the queue is full the connection is closed.
//!
//! # Example
//!
//! ```ignore
//! use jt808_core::handler::{handler_fn, HandlerResult};
//! use jt808_core::message::response_result;
//! use jt808_core::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> jt808_core::Result<()> {
//!     let server = Server::builder()
//!         .tcp_bind("0.0.0.0:6808".parse().unwrap())
//!         .handler(handler_fn(|ctx, message| async move {
//!             ctx.general_response(&message.header, response_result::SUCCESS).await?;
//!             HandlerResult::Ok(())
//!         }))
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

use crate::codec::MessageRegistry;
use crate::config::{duration_ms, ServerConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{Jt808Error, Result};
use crate::fragment::FragmentReassembler;
use crate::handler::{MessageHandler, SessionContext};
use crate::message::Message;
use crate::protocol::FrameBuffer;
use crate::session::{Session, SessionTable};
use crate::transport::TransportHandle;
use crate::writer::spawn_writer_task;

/// TCP read buffer size.
const READ_BUFFER_SIZE: usize = 4 * 1024;

/// Pause after a failed accept or receive before trying again.
const SOCKET_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// UDP receive buffer size; larger datagrams are truncated.
const DATAGRAM_BUFFER_SIZE: usize = 64 * 1024;

/// Builder for configuring and starting a [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    registry: Option<Arc<MessageRegistry>>,
    handler: Option<Arc<dyn MessageHandler>>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            registry: None,
            handler: None,
        }
    }

    /// Replace every setting with `config`.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tcp_bind(mut self, addr: SocketAddr) -> Self {
        self.config.tcp_bind = Some(addr);
        self
    }

    pub fn udp_bind(mut self, addr: SocketAddr) -> Self {
        self.config.udp_bind = Some(addr);
        self
    }

    /// Idle time before a session is evicted. Default: 5 minutes
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout_ms = duration_ms(timeout);
        self
    }

    /// Time a fragment group may wait for its next part. Default: 30 seconds
    pub fn fragment_timeout(mut self, timeout: Duration) -> Self {
        self.config.fragment_timeout_ms = duration_ms(timeout);
        self
    }

    /// Largest part count a fragmented message may announce; larger ones
    /// are dropped as invalid. Default: 256
    pub fn max_fragment_parts(mut self, max_parts: u16) -> Self {
        self.config.max_fragment_parts = max_parts;
        self
    }

    /// Interval between sweeps. Default: 10 seconds
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval_ms = duration_ms(interval);
        self
    }

    /// Largest frame buffered from a TCP stream. Default: 8 KiB
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Messages queued per connection before it is closed. Default: 256
    pub fn handler_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.handler_queue_capacity = capacity;
        self
    }

    /// Tasks receiving on the UDP socket. Default: 4
    pub fn udp_workers(mut self, workers: usize) -> Self {
        self.config.udp_workers = workers;
        self
    }

    /// Concurrent UDP handler calls; datagrams beyond it are dropped.
    /// Default: 256
    pub fn max_udp_handlers(mut self, limit: usize) -> Self {
        self.config.max_udp_handlers = limit;
        self
    }

    /// Per-connection pending frames before sends wait. Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.max_pending_frames = limit;
        self
    }

    /// Per-connection writer channel capacity. Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// How long a send waits out backpressure. Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.backpressure_timeout_ms = duration_ms(timeout);
        self
    }

    /// Registry used for decoding and replies. Default:
    /// [`MessageRegistry::with_defaults`].
    pub fn registry(mut self, registry: impl Into<Arc<MessageRegistry>>) -> Self {
        self.registry = Some(registry.into());
        self
    }

    /// Handler receiving every decoded message. Without one, messages are
    /// decoded, counted and dropped.
    pub fn handler(mut self, handler: impl MessageHandler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Bind the configured sockets and start serving.
    pub async fn start(self) -> Result<Server> {
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(MessageRegistry::with_defaults()));
        Server::start(self.config, registry, self.handler).await
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by every server task.
struct Shared {
    dispatcher: Dispatcher,
    handler: Option<Arc<dyn MessageHandler>>,
    config: ServerConfig,
}

/// A running JT/T 808 server.
///
/// Dropping it stops every loop as [`shutdown`](Server::shutdown) does,
/// without waiting for them.
pub struct Server {
    shared: Arc<Shared>,
    tcp_addr: Option<SocketAddr>,
    udp_addr: Option<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    async fn start(
        config: ServerConfig,
        registry: Arc<MessageRegistry>,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Result<Self> {
        let dispatcher = Dispatcher::new(
            registry,
            Arc::new(SessionTable::new(config.idle_timeout())),
            Arc::new(
                FragmentReassembler::new(config.fragment_timeout())
                    .with_max_parts(config.max_fragment_parts),
            ),
        );
        let shared = Arc::new(Shared {
            dispatcher,
            handler,
            config,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let tcp_addr = match shared.config.tcp_bind {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                let local = listener.local_addr()?;
                tracing::info!("Listening for TCP terminals on {}", local);
                tasks.push(tokio::spawn(accept_loop(
                    listener,
                    shared.clone(),
                    shutdown_rx.clone(),
                )));
                Some(local)
            }
            None => None,
        };

        let udp_addr = match shared.config.udp_bind {
            Some(addr) => {
                let socket = Arc::new(UdpSocket::bind(addr).await?);
                let local = socket.local_addr()?;
                let handler_permits = Arc::new(Semaphore::new(shared.config.max_udp_handlers));
                let workers = shared.config.udp_workers.max(1);
                tracing::info!("Listening for UDP terminals on {} ({} workers)", local, workers);
                for _ in 0..workers {
                    tasks.push(tokio::spawn(udp_worker(
                        socket.clone(),
                        shared.clone(),
                        handler_permits.clone(),
                        shutdown_rx.clone(),
                    )));
                }
                Some(local)
            }
            None => None,
        };

        tasks.push(tokio::spawn(sweep_loop(shared.clone(), shutdown_rx)));

        Ok(Server {
            shared,
            tcp_addr,
            udp_addr,
            shutdown_tx,
            tasks,
        })
    }

    /// Bound TCP address, if TCP is enabled.
    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    /// Bound UDP address, if UDP is enabled.
    pub fn local_udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        self.shared.dispatcher.sessions()
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        self.shared.dispatcher.registry()
    }

    pub fn fragments(&self) -> &Arc<FragmentReassembler> {
        self.shared.dispatcher.fragments()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Stop accepting, evict every session and wait for the server tasks.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        let sessions = self.sessions().clone();
        for session in sessions.sessions() {
            sessions.evict(session.id());
        }

        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!("Server task failed: {}", e);
            }
        }
        tracing::info!("Server stopped");
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(stream, peer, shared.clone(), shutdown.clone()));
                }
                Err(e) => {
                    tracing::warn!("TCP accept failed: {}", e);
                    tokio::time::sleep(SOCKET_ERROR_BACKOFF).await;
                }
            },
        }
    }
}

/// Serve one TCP connection until it closes, then evict its session.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("set_nodelay failed for {}: {}", peer, e);
    }
    let (reader, write_half) = stream.into_split();
    let (writer, _writer_task) = spawn_writer_task(write_half, shared.config.writer_config());

    let sessions = shared.dispatcher.sessions();
    let id = sessions.create(TransportHandle::tcp(writer, peer));
    let Some(session) = sessions.lookup_by_session(id) else {
        return;
    };
    tracing::info!("Accepted {} as session {}", peer, id);

    let (queue_tx, queue_rx) = mpsc::channel(shared.config.handler_queue_capacity.max(1));
    let handler_task = shared.handler.clone().map(|handler| {
        tokio::spawn(run_handler_queue(
            queue_rx,
            shared.dispatcher.context(session.clone()),
            handler,
        ))
    });

    let overflowed = match read_loop(reader, &session, &shared, &queue_tx, shutdown).await {
        Ok(()) => {
            tracing::debug!("Session {} connection closed", id);
            false
        }
        Err(e) => {
            tracing::warn!("Session {} connection ended: {}", id, e);
            matches!(e, Jt808Error::Backpressure)
        }
    };

    drop(queue_tx);
    sessions.evict(id);
    drop(session);

    let Some(task) = handler_task else {
        return;
    };
    // The handler context keeps the writer alive; a stalled handler would
    // hold the socket open.
    if overflowed {
        task.abort();
    }
    match task.await {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => {
            tracing::debug!("Handler task for session {} aborted", id);
        }
        Err(e) => tracing::error!("Handler task for session {} failed: {}", id, e),
    }
}

/// Read frames until EOF, local close, shutdown, or a connection-level error.
async fn read_loop(
    mut reader: OwnedReadHalf,
    session: &Arc<Session>,
    shared: &Shared,
    queue: &mpsc::Sender<Message>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut frame_buffer = FrameBuffer::with_max_frame_size(shared.config.max_frame_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = session.transport().closed() => return Ok(()),
            _ = shutdown.changed() => return Ok(()),
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            return Ok(());
        }

        let extracted = frame_buffer.push(&buf[..n]);
        for e in extracted.errors {
            tracing::debug!("Session {} framing: {}", session.id(), e);
        }

        for frame in extracted.frames {
            let message = match shared.dispatcher.process_frame(session, &frame) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e @ Jt808Error::SessionNotFound(_)) => return Err(e),
                Err(e) => {
                    tracing::debug!("Session {} dropped frame: {}", session.id(), e);
                    continue;
                }
            };
            if shared.handler.is_none() {
                continue;
            }
            match queue.try_send(message) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        "Session {} handler queue full ({}), closing connection",
                        session.id(),
                        shared.config.handler_queue_capacity
                    );
                    return Err(Jt808Error::Backpressure);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(Jt808Error::ConnectionClosed);
                }
            }
        }
    }
}

/// Hand queued messages to the handler one at a time.
async fn run_handler_queue(
    mut queue: mpsc::Receiver<Message>,
    ctx: SessionContext,
    handler: Arc<dyn MessageHandler>,
) {
    while let Some(message) = queue.recv().await {
        let message_id = message.message_id();
        if let Err(e) = handler.on_message(ctx.clone(), message).await {
            tracing::warn!(
                "Handler error for message {:#06x} on session {}: {}",
                message_id,
                ctx.session_id(),
                e
            );
        }
    }
}

/// Receive one datagram. A failed receive is logged and backs off before
/// returning `None`.
async fn recv_datagram(socket: &UdpSocket, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
    match socket.recv_from(buf).await {
        Ok(received) => Some(received),
        Err(e) => {
            tracing::warn!("UDP receive failed: {}", e);
            tokio::time::sleep(SOCKET_ERROR_BACKOFF).await;
            None
        }
    }
}

async fn udp_worker(
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    handler_permits: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];

    loop {
        let (n, peer) = tokio::select! {
            _ = shutdown.changed() => return,
            received = recv_datagram(&socket, &mut buf) => match received {
                Some(received) => received,
                None => continue,
            },
        };

        let (session, message) = match shared.dispatcher.process_datagram(&socket, peer, &buf[..n]) {
            Ok(Some(routed)) => routed,
            Ok(None) => continue,
            Err(e) => {
                tracing::debug!("Dropped datagram from {}: {}", peer, e);
                continue;
            }
        };

        let Some(handler) = shared.handler.clone() else {
            continue;
        };
        let Ok(permit) = handler_permits.clone().try_acquire_owned() else {
            tracing::warn!(
                "UDP handler capacity reached, dropping {:#06x} from {}",
                message.message_id(),
                peer
            );
            continue;
        };

        let ctx = shared.dispatcher.context(session);
        tokio::spawn(async move {
            let _permit = permit;
            let message_id = message.message_id();
            if let Err(e) = handler.on_message(ctx.clone(), message).await {
                tracing::warn!(
                    "Handler error for message {:#06x} on session {}: {}",
                    message_id,
                    ctx.session_id(),
                    e
                );
            }
        });
    }
}

async fn sweep_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(shared.config.sweep_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }

        let evicted = shared.dispatcher.sessions().sweep_idle();
        if !evicted.is_empty() {
            tracing::info!("Evicted {} idle sessions", evicted.len());
        }
        for expired in shared.dispatcher.fragments().sweep_expired() {
            tracing::warn!("{}", expired);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_configuration() {
        let builder = Server::builder()
            .tcp_bind("127.0.0.1:0".parse().unwrap())
            .idle_timeout(Duration::from_millis(1500))
            .fragment_timeout(Duration::from_secs(5))
            .max_fragment_parts(64)
            .sweep_interval(Duration::from_millis(100))
            .handler_queue_capacity(8)
            .udp_workers(2)
            .max_udp_handlers(16)
            .max_pending_frames(64)
            .channel_capacity(32)
            .backpressure_timeout(Duration::from_secs(1));

        let config = &builder.config;
        assert_eq!(config.idle_timeout(), Duration::from_millis(1500));
        assert_eq!(config.fragment_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_fragment_parts, 64);
        assert_eq!(config.sweep_interval(), Duration::from_millis(100));
        assert_eq!(config.handler_queue_capacity, 8);
        assert_eq!(config.udp_workers, 2);
        assert_eq!(config.max_udp_handlers, 16);
        assert_eq!(config.writer_config().max_pending_frames, 64);
        assert_eq!(config.writer_config().channel_capacity, 32);
        assert!(config.udp_bind.is_none());
    }

    #[test]
    fn test_builder_takes_whole_config() {
        let config = ServerConfig {
            udp_workers: 9,
            ..ServerConfig::default()
        };
        let builder = ServerBuilder::default().config(config.clone());
        assert_eq!(builder.config, config);
    }

    #[tokio::test]
    async fn test_start_without_sockets_and_shutdown() {
        let server = Server::builder().start().await.unwrap();

        assert!(server.local_tcp_addr().is_none());
        assert!(server.local_udp_addr().is_none());
        assert!(server.registry().is_registered(0x0002));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_custom_registry_is_used() {
        let server = Server::builder()
            .registry(MessageRegistry::new())
            .start()
            .await
            .unwrap();

        assert!(server.registry().registered_ids().is_empty());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_receive_backs_off() {
        let closed = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = closed.local_addr().unwrap();
        drop(closed);

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(closed_addr).await.unwrap();
        socket.send(b"ping").await.unwrap();

        let mut buf = [0u8; 64];
        let started = tokio::time::Instant::now();
        let received = tokio::time::timeout(
            Duration::from_secs(5),
            recv_datagram(&socket, &mut buf),
        )
        .await
        .expect("refused send should surface as a receive error");

        assert!(received.is_none());
        assert!(started.elapsed() >= SOCKET_ERROR_BACKOFF);
    }
}
