//! Dedicated writer task for one TCP connection.
//!
//! Handlers never touch the socket. They push wrapped frames into an mpsc
//! channel and a single task drains it, batching whatever is ready into one
//! vectored write.
//!
//! ```text
//! Handler 1 ─┐
//! Handler 2 ─┼─► mpsc::Sender<Bytes> ─► Writer Task ─► OwnedWriteHalf
//! Handler N ─┘
//! ```
//!
//! Frames accepted by a [`WriterHandle`] but not yet on the socket are
//! counted. At `max_pending_frames` a sender parks until the writer drains a
//! batch, and gives up with `Backpressure` after the configured timeout.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::{Jt808Error, Result};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames drained per vectored write.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    /// Frames queued but unwritten before senders start waiting.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// How long a sender waits for the queue to drain.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Unwritten frame count shared between handles and the writer task.
#[derive(Debug)]
struct PendingGauge {
    count: AtomicUsize,
    limit: usize,
    drained: Notify,
}

impl PendingGauge {
    fn new(limit: usize) -> Self {
        Self {
            count: AtomicUsize::new(0),
            limit,
            drained: Notify::new(),
        }
    }

    fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn is_full(&self) -> bool {
        self.get() >= self.limit
    }

    fn add(&self, n: usize) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    fn release(&self, n: usize) {
        self.count.fetch_sub(n, Ordering::AcqRel);
        self.drained.notify_waiters();
    }

    /// Resolve once below the limit, or fail if the writer is gone.
    async fn wait_for_room(&self, tx: &mpsc::Sender<Bytes>) -> Result<()> {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_full() {
                return Ok(());
            }
            if tx.is_closed() {
                return Err(Jt808Error::ConnectionClosed);
            }
            notified.await;
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable; every clone feeds the same connection.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
    pending: Arc<PendingGauge>,
    timeout: Duration,
}

impl WriterHandle {
    /// Queue a wrapped frame, waiting out backpressure up to the timeout.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        if self.pending.is_full() {
            match tokio::time::timeout(self.timeout, self.pending.wait_for_room(&self.tx)).await {
                Ok(waited) => waited?,
                Err(_) => {
                    tracing::warn!(
                        "Writer backpressure did not clear within {:?} ({} frames pending)",
                        self.timeout,
                        self.pending.get()
                    );
                    return Err(Jt808Error::Backpressure);
                }
            }
        }

        // Counted before the send so the writer never releases below zero.
        self.pending.add(1);
        self.tx.send(frame).await.map_err(|_| {
            self.pending.release(1);
            Jt808Error::ConnectionClosed
        })
    }

    /// Queue a frame without waiting; `Backpressure` when at capacity.
    pub fn try_send(&self, frame: Bytes) -> Result<()> {
        if self.pending.is_full() {
            return Err(Jt808Error::Backpressure);
        }

        self.pending.add(1);
        self.tx.try_send(frame).map_err(|e| {
            self.pending.release(1);
            match e {
                mpsc::error::TrySendError::Full(_) => Jt808Error::Backpressure,
                mpsc::error::TrySendError::Closed(_) => Jt808Error::ConnectionClosed,
            }
        })
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.is_full()
    }

    /// Frames accepted but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.get()
    }

    /// Whether the writer task has stopped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends cleanly when every handle is dropped, or with an error when
/// the socket write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(PendingGauge::new(config.max_pending_frames));

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
        timeout: config.backpressure_timeout,
    };
    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
    pending: Arc<PendingGauge>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    while rx.recv_many(&mut batch, MAX_BATCH_SIZE).await > 0 {
        let result = write_batch(&mut writer, &batch).await;
        pending.release(batch.len());
        if let Err(e) = result {
            tracing::debug!("Writer stopped after {} frames failed: {}", batch.len(), e);
            rx.close();
            // Wake senders parked on a full gauge so they observe the close.
            pending.drained.notify_waiters();
            return Err(e);
        }
        batch.clear();
    }

    let _ = writer.shutdown().await;
    Ok(())
}

/// Write every frame of `batch` with scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut cursor = BatchCursor::default();
    let mut slices = Vec::with_capacity(batch.len());

    while cursor.fill(batch, &mut slices) {
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(Jt808Error::Io(std::io::ErrorKind::WriteZero.into()));
        }
        cursor.advance(batch, written);
    }

    writer.flush().await?;
    Ok(())
}

/// Position of the first unwritten byte in a batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct BatchCursor {
    frame: usize,
    offset: usize,
}

impl BatchCursor {
    /// Replace `slices` with the unwritten remainder; false when done.
    fn fill<'a>(&self, batch: &'a [Bytes], slices: &mut Vec<IoSlice<'a>>) -> bool {
        slices.clear();
        let mut offset = self.offset;
        for frame in batch.iter().skip(self.frame) {
            if offset < frame.len() {
                slices.push(IoSlice::new(&frame[offset..]));
            }
            offset = 0;
        }
        !slices.is_empty()
    }

    fn advance(&mut self, batch: &[Bytes], mut written: usize) {
        while let Some(frame) = batch.get(self.frame) {
            let left = frame.len() - self.offset;
            if written < left {
                self.offset += written;
                return;
            }
            written -= left;
            self.frame += 1;
            self.offset = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    use crate::protocol::wrap;

    fn frame(serial: u8) -> Bytes {
        wrap(&[0x80, 0x01, 0x00, 0x00, serial])
    }

    fn detached(limit: usize, timeout: Duration) -> (WriterHandle, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = WriterHandle {
            tx,
            pending: Arc::new(PendingGauge::new(limit)),
            timeout,
        };
        (handle, rx)
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, DEFAULT_MAX_PENDING_FRAMES);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        let frames: Vec<_> = (0..10).map(frame).collect();
        for f in &frames {
            handle.send(f.clone()).await.unwrap();
        }

        let expected: Vec<u8> = frames.iter().flat_map(|f| f.to_vec()).collect();
        let mut buf = vec![0u8; expected.len()];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn test_try_send_at_capacity() {
        let (handle, _rx) = detached(2, Duration::from_secs(1));
        handle.try_send(frame(1)).unwrap();
        handle.try_send(frame(2)).unwrap();

        assert!(handle.is_backpressure_active());
        assert!(matches!(handle.try_send(frame(3)), Err(Jt808Error::Backpressure)));
        assert_eq!(handle.pending_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out_under_backpressure() {
        let (handle, _rx) = detached(1, Duration::from_millis(20));
        handle.send(frame(1)).await.unwrap();

        let result = handle.send(frame(2)).await;
        assert!(matches!(result, Err(Jt808Error::Backpressure)));
        assert_eq!(handle.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_parked_sender_resumes_after_drain() {
        let (handle, mut rx) = detached(1, Duration::from_secs(5));
        handle.send(frame(1)).await.unwrap();

        let sender = handle.clone();
        let parked = tokio::spawn(async move { sender.send(frame(2)).await });
        tokio::task::yield_now().await;
        assert!(!parked.is_finished());

        rx.recv().await.unwrap();
        handle.pending.release(1);

        parked.await.unwrap().unwrap();
        assert_eq!(rx.recv().await.unwrap(), frame(2));
    }

    #[tokio::test]
    async fn test_send_after_writer_stopped() {
        let (handle, rx) = detached(10, Duration::ZERO);
        drop(rx);

        assert!(handle.is_closed());
        let result = handle.send(frame(1)).await;
        assert!(matches!(result, Err(Jt808Error::ConnectionClosed)));
        assert_eq!(handle.pending_count(), 0);
    }

    #[test]
    fn test_cursor_tracks_partial_writes() {
        let batch = vec![frame(1), frame(2)];
        let size = batch[0].len();
        let mut cursor = BatchCursor::default();
        let mut slices = Vec::new();

        assert!(cursor.fill(&batch, &mut slices));
        assert_eq!(slices.len(), 2);

        cursor.advance(&batch, 3);
        assert!(cursor.fill(&batch, &mut slices));
        assert_eq!(slices[0].len(), size - 3);

        cursor.advance(&batch, size - 3);
        assert_eq!(cursor, BatchCursor { frame: 1, offset: 0 });
        assert!(cursor.fill(&batch, &mut slices));
        assert_eq!(slices.len(), 1);

        cursor.advance(&batch, size);
        assert!(!cursor.fill(&batch, &mut slices));
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(frame).collect();

        write_batch(&mut buf, &batch).await.unwrap();

        let expected: Vec<u8> = batch.iter().flat_map(|f| f.to_vec()).collect();
        assert_eq!(buf.into_inner(), expected);
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, mut server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        drop(handle);

        assert!(task.await.unwrap().is_ok());
        let mut buf = Vec::new();
        assert_eq!(server.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
