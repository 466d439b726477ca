//! In-process transport.
//!
//! Committed packets are queued and dispatched by a task started at
//! [`Transport::engage`], never from inside `commit`.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{RouteEndpoints, Transport};
use crate::error::{Result, RipleyError};
use crate::protocol::{BusId, RouteToken};
use crate::route::{FrameSink, OutputBuffer};

pub struct LoopbackTransport {
    endpoints: Arc<RouteEndpoints>,
    sink: Arc<LoopbackSink>,
    queue: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    remote: OnceLock<BusId>,
}

struct LoopbackSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl FrameSink for LoopbackSink {
    fn commit(&self, packet: Bytes) -> Result<()> {
        self.tx
            .send(packet)
            .map_err(|_| RipleyError::ConnectionClosed)
    }
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            endpoints: Arc::new(RouteEndpoints::new()),
            sink: Arc::new(LoopbackSink { tx }),
            queue: Mutex::new(Some(rx)),
            remote: OnceLock::new(),
        })
    }
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<Bytes>, endpoints: Arc<RouteEndpoints>) {
    while let Some(packet) = rx.recv().await {
        if let Err(e) = endpoints.deliver(packet) {
            tracing::warn!("Loopback packet dropped: {}", e);
        }
    }
}

impl Transport for LoopbackTransport {
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
        if let Some(rx) = self.queue.lock().take() {
            tokio::spawn(dispatch_loop(rx, Arc::clone(&self.endpoints)));
        }
    }

    fn remote_bus_id(&self) -> Option<BusId> {
        self.remote.get().copied()
    }
}
