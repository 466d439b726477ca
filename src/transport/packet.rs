//! Stream transport.
//!
//! Carries length-prefixed packets over any `AsyncRead`/`AsyncWrite` pair:
//! a pipe, a socket, or `tokio::io::duplex` in tests.
//!
//! ```text
//! ┌──────────────┬────────────┬──────────────┐
//! │ Length       │ RouteToken │ Frame        │
//! │ 4 bytes BE   │ varint     │ ...          │
//! └──────────────┴────────────┴──────────────┘
//! ```
//!
//! Until the transport is engaged the read half belongs to the bootstrap
//! handshake; engaging hands it to the read loop.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{
    decode_client_hello, encode_client_hello, spawn_writer_task, BootstrapOffer,
    BootstrapTransport, BoxFuture, OutboundPacket, RouteEndpoints, Transport, WriterConfig,
    WriterHandle,
};
use crate::error::{Result, RipleyError};
use crate::protocol::{BusId, PacketBuffer, RouteToken, DEFAULT_MAX_PACKET_SIZE};
use crate::route::{FrameSink, OutputBuffer};

const READ_CHUNK: usize = 64 * 1024;

pub struct PacketTransport {
    endpoints: Arc<RouteEndpoints>,
    sink: Arc<PacketSink>,
    reader: Mutex<Option<PacketReader>>,
    remote: OnceLock<BusId>,
    _writer_task: JoinHandle<Result<()>>,
}

struct PacketSink {
    writer: WriterHandle,
}

impl FrameSink for PacketSink {
    fn commit(&self, packet: Bytes) -> Result<()> {
        self.writer.try_send(OutboundPacket::new(packet)?)
    }
}

struct PacketReader {
    stream: Box<dyn AsyncRead + Unpin + Send>,
    buffer: PacketBuffer,
    ready: VecDeque<Bytes>,
    chunk: Vec<u8>,
}

impl PacketReader {
    /// Next complete packet, or `None` at end of stream.
    async fn next_packet(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(packet) = self.ready.pop_front() {
                return Ok(Some(packet));
            }
            let n = self.stream.read(&mut self.chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            let packets = self.buffer.push(&self.chunk[..n])?;
            self.ready.extend(packets);
        }
    }
}

impl PacketTransport {
    /// Build a transport over separate read and write halves.
    ///
    /// Must be called inside a Tokio runtime; the writer task starts here.
    pub fn new<R, W>(reader: R, writer: W, config: WriterConfig) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_max_packet(reader, writer, config, DEFAULT_MAX_PACKET_SIZE)
    }

    pub fn with_max_packet<R, W>(
        reader: R,
        writer: W,
        config: WriterConfig,
        max_packet_size: u32,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer, writer_task) = spawn_writer_task(writer, config);
        Arc::new(Self {
            endpoints: Arc::new(RouteEndpoints::new()),
            sink: Arc::new(PacketSink { writer }),
            reader: Mutex::new(Some(PacketReader {
                stream: Box::new(reader),
                buffer: PacketBuffer::with_max_packet(max_packet_size),
                ready: VecDeque::new(),
                chunk: vec![0u8; READ_CHUNK],
            })),
            remote: OnceLock::new(),
            _writer_task: writer_task,
        })
    }

    /// Build a transport over a bidirectional stream.
    pub fn from_stream<S>(stream: S, config: WriterConfig) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, config)
    }

    /// Packets queued but not yet written.
    pub fn pending_packets(&self) -> usize {
        self.sink.writer.pending_count()
    }

    async fn send_raw(&self, packet: BytesMut) -> Result<()> {
        self.sink
            .writer
            .send(OutboundPacket::new(packet.freeze())?)
            .await
    }

    async fn read_raw(&self) -> Result<Bytes> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(RipleyError::AlreadyBootstrapped)?;
        reader
            .next_packet()
            .await?
            .ok_or(RipleyError::ConnectionClosed)
    }
}

async fn read_loop(mut reader: PacketReader, endpoints: Arc<RouteEndpoints>) -> Result<()> {
    while let Some(packet) = reader.next_packet().await? {
        if let Err(e) = endpoints.deliver(packet) {
            tracing::warn!("Dropped undecodable packet: {}", e);
        }
    }
    tracing::debug!("Packet stream closed by peer");
    Ok(())
}

impl Transport for PacketTransport {
    fn endpoints(&self) -> &RouteEndpoints {
        &self.endpoints
    }

    fn open_buffer(&self, shiboleth: RouteToken) -> Result<OutputBuffer> {
        let mut out = OutputBuffer::new(Arc::clone(&self.sink) as Arc<dyn FrameSink>);
        shiboleth.encode(&mut out);
        Ok(out)
    }

    fn engage(&self, remote: BusId) {
        let _ = self.remote.set(remote);
        let reader = match self.reader.try_lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                tracing::warn!("Transport engaged while bootstrap is reading");
                return;
            }
        };
        if let Some(reader) = reader {
            let endpoints = Arc::clone(&self.endpoints);
            tokio::spawn(async move {
                if let Err(e) = read_loop(reader, endpoints).await {
                    tracing::error!("Read loop error: {}", e);
                }
            });
        }
    }

    fn remote_bus_id(&self) -> Option<BusId> {
        self.remote.get().copied()
    }
}

impl BootstrapTransport for PacketTransport {
    fn client_bootstrap(&self, client_token: RouteToken) -> BoxFuture<'_, Result<BootstrapOffer>> {
        Box::pin(async move {
            let mut hello = BytesMut::new();
            encode_client_hello(client_token, &mut hello);
            self.send_raw(hello).await?;

            let mut packet = self.read_raw().await?;
            BootstrapOffer::decode(&mut packet)
        })
    }

    fn master_bootstrap(&self, offer: BootstrapOffer) -> BoxFuture<'_, Result<RouteToken>> {
        Box::pin(async move {
            let mut out = BytesMut::new();
            offer.encode(&mut out);
            self.send_raw(out).await?;

            let mut packet = self.read_raw().await?;
            decode_client_hello(&mut packet)
        })
    }
}
