//! Writer task of stream transports.
//!
//! Committing a frame never touches the stream. Packets are queued on an
//! mpsc channel and a single task drains it, writing every packet queued at
//! that moment with one vectored write.
//!
//! ```text
//! OutputBuffer::commit ─┐
//! OutputBuffer::commit ─┼─► mpsc<OutboundPacket> ─► writer task ─► stream
//! bootstrap handshake ──┘
//! ```
//!
//! Frame dispatch is synchronous, so commits use the non-blocking
//! [`WriterHandle::try_send`], which refuses packets with `Backpressure`
//! once `max_pending_packets` are queued and not yet written.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, RipleyError};
use crate::protocol::PACKET_LENGTH_SIZE;

/// Default limit of queued, unwritten packets.
pub const DEFAULT_MAX_PENDING_PACKETS: usize = 1024;

/// Default capacity of the packet channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Most packets drained into one write.
const MAX_BATCH: usize = 64;

/// Length-prefixed packet waiting for the writer task.
#[derive(Debug)]
pub struct OutboundPacket {
    prefix: [u8; PACKET_LENGTH_SIZE],
    payload: Bytes,
}

impl OutboundPacket {
    /// Wrap `payload`, failing if its length does not fit the prefix.
    pub fn new(payload: Bytes) -> Result<Self> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            RipleyError::Encoding(format!("packet of {} bytes is too large", payload.len()))
        })?;
        Ok(Self {
            prefix: len.to_be_bytes(),
            payload,
        })
    }

    /// Bytes this packet occupies on the stream.
    pub fn size(&self) -> usize {
        PACKET_LENGTH_SIZE + self.payload.len()
    }

    fn slices(&self) -> [IoSlice<'_>; 2] {
        [IoSlice::new(&self.prefix), IoSlice::new(&self.payload)]
    }
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub max_pending_packets: usize,
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_packets: DEFAULT_MAX_PENDING_PACKETS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Count of packets queued but not yet written.
#[derive(Debug, Default)]
struct Gauge(AtomicUsize);

impl Gauge {
    fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn raise(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    fn lower(&self, n: usize) {
        self.0.fetch_sub(n, Ordering::AcqRel);
    }
}

/// Sending side of a writer task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundPacket>,
    pending: Arc<Gauge>,
    limit: usize,
}

impl WriterHandle {
    /// Queue a packet, waiting for channel capacity.
    ///
    /// Not subject to the pending limit; used by the bootstrap handshake.
    pub async fn send(&self, packet: OutboundPacket) -> Result<()> {
        self.pending.raise();
        if self.tx.send(packet).await.is_err() {
            self.pending.lower(1);
            return Err(RipleyError::ConnectionClosed);
        }
        Ok(())
    }

    /// Queue a packet without waiting.
    pub fn try_send(&self, packet: OutboundPacket) -> Result<()> {
        if self.is_backpressure_active() {
            return Err(RipleyError::Backpressure);
        }
        self.pending.raise();
        self.tx.try_send(packet).map_err(|e| {
            self.pending.lower(1);
            match e {
                mpsc::error::TrySendError::Full(_) => RipleyError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => RipleyError::ConnectionClosed,
            }
        })
    }

    pub fn is_backpressure_active(&self) -> bool {
        self.pending.get() >= self.limit
    }

    pub fn pending_count(&self) -> usize {
        self.pending.get()
    }
}

/// Start the writer task on `writer`.
///
/// The task returns `Ok` once every handle is dropped and the queue is
/// drained, or the first I/O error.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(Gauge::default());
    let handle = WriterHandle {
        tx,
        pending: Arc::clone(&pending),
        limit: config.max_pending_packets,
    };
    (handle, tokio::spawn(writer_loop(rx, writer, pending)))
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundPacket>,
    mut writer: W,
    pending: Arc<Gauge>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH);
    while rx.recv_many(&mut batch, MAX_BATCH).await > 0 {
        let result = write_batch(&mut writer, &batch).await;
        pending.lower(batch.len());
        batch.clear();
        result?;
    }
    tracing::debug!("Writer task finished");
    Ok(())
}

/// Write every packet of `batch`, resuming vectored writes after short
/// writes, then flush.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundPacket]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut slices: Vec<IoSlice<'_>> = batch.iter().flat_map(OutboundPacket::slices).collect();
    let mut remaining: &mut [IoSlice<'_>] = &mut slices;
    while !remaining.is_empty() {
        let written = writer.write_vectored(&*remaining).await?;
        if written == 0 {
            return Err(RipleyError::Io(std::io::ErrorKind::WriteZero.into()));
        }
        IoSlice::advance_slices(&mut remaining, written);
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    fn packet(payload: &'static [u8]) -> OutboundPacket {
        OutboundPacket::new(Bytes::from_static(payload)).unwrap()
    }

    #[test]
    fn test_prefix_and_size() {
        let packet = packet(b"hello");
        assert_eq!(packet.prefix, [0, 0, 0, 5]);
        assert_eq!(packet.size(), 9);
    }

    #[tokio::test]
    async fn test_send_writes_prefixed_packet() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        handle.send(packet(b"hello")).await.unwrap();

        let mut buf = [0u8; 9];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x00\x00\x00\x05hello");
    }

    #[tokio::test]
    async fn test_queued_packets_arrive_in_order() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        for payload in [&b"one"[..], b"two", b"six"] {
            handle.try_send(OutboundPacket::new(Bytes::from_static(payload)).unwrap()).unwrap();
        }

        let mut buf = vec![0u8; 3 * 7];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x00\x00\x00\x03one\x00\x00\x00\x03two\x00\x00\x00\x03six");

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_short_writes_resume() {
        // A tiny duplex buffer forces partial vectored writes.
        let (client, mut server) = duplex(3);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());
        handle.try_send(packet(b"abcdefgh")).unwrap();
        handle.try_send(packet(b"ij")).unwrap();

        let mut buf = vec![0u8; 12 + 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x00\x00\x00\x08abcdefgh\x00\x00\x00\x02ij");
    }

    #[tokio::test]
    async fn test_try_send_refuses_over_limit() {
        // Nobody reads the duplex, so packets stay pending.
        let (client, _server) = duplex(1);
        let config = WriterConfig {
            max_pending_packets: 2,
            channel_capacity: 16,
        };
        let (handle, _task) = spawn_writer_task(client, config);

        handle.try_send(packet(b"a")).unwrap();
        handle.try_send(packet(b"b")).unwrap();
        assert!(handle.is_backpressure_active());
        assert!(matches!(
            handle.try_send(packet(b"c")),
            Err(RipleyError::Backpressure)
        ));
    }

    #[tokio::test]
    async fn test_closed_writer() {
        let (tx, rx) = mpsc::channel::<OutboundPacket>(4);
        drop(rx);
        let handle = WriterHandle {
            tx,
            pending: Arc::new(Gauge::default()),
            limit: 8,
        };

        assert!(matches!(
            handle.try_send(packet(b"x")),
            Err(RipleyError::ConnectionClosed)
        ));
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_task_ends_when_handles_drop() {
        let (client, _server) = duplex(64);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());
        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }
}
