//! Transport module - packet carriers between buses.
//!
//! A transport moves packets of the form `RouteToken frame` and dispatches
//! each incoming packet to the [`TransportRoute`] registered under its token.
//!
//! - [`LoopbackTransport`] - in-process, for connections on the same bus
//! - [`PacketTransport`] - length-prefixed packets over any byte stream

mod loopback;
mod packet;
mod writer;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::RwLock;

use crate::error::{Result, RipleyError};
use crate::protocol::{BusId, ConnectionId, Reference, RouteToken, BOOTSTRAP_MAGIC};
use crate::route::{OutputBuffer, Route, TransportRoute};

pub use loopback::LoopbackTransport;
pub use packet::PacketTransport;
pub use writer::{
    spawn_writer_task, OutboundPacket, WriterConfig, WriterHandle, DEFAULT_CHANNEL_CAPACITY,
    DEFAULT_MAX_PENDING_PACKETS,
};

/// Boxed future returned by object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Packet carrier.
pub trait Transport: Send + Sync {
    /// Route table of this transport.
    fn endpoints(&self) -> &RouteEndpoints;

    /// Open a buffer for a packet addressed to the peer route `shiboleth`.
    fn open_buffer(&self, shiboleth: RouteToken) -> Result<OutputBuffer>;

    /// Start delivering incoming packets. `remote` is the bus at the far end.
    fn engage(&self, remote: BusId);

    fn remote_bus_id(&self) -> Option<BusId>;

    fn allocate_token(&self) -> RouteToken {
        self.endpoints().allocate()
    }

    fn register_route(&self, token: RouteToken, route: &Arc<TransportRoute>) {
        self.endpoints().register(token, route);
    }

    fn unregister_route(&self, token: RouteToken) {
        self.endpoints().unregister(token);
    }
}

/// Transport that can run the bootstrap handshake before it is engaged.
pub trait BootstrapTransport: Transport {
    /// Client side: announce `client_token`, receive the master's offer.
    fn client_bootstrap(&self, client_token: RouteToken) -> BoxFuture<'_, Result<BootstrapOffer>>;

    /// Master side: send `offer`, receive the client's route token.
    fn master_bootstrap(&self, offer: BootstrapOffer) -> BoxFuture<'_, Result<RouteToken>>;
}

/// What the master tells a new client during bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapOffer {
    /// Connection id issued to the client.
    pub neonate: ConnectionId,
    /// Token of the master's route for this client.
    pub route_token: RouteToken,
    /// The master object.
    pub master: Reference,
    /// The master's bus.
    pub bus: BusId,
}

impl BootstrapOffer {
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_slice(BOOTSTRAP_MAGIC);
        self.neonate.encode(out);
        self.route_token.encode(out);
        self.master.encode(out);
        self.bus.encode(out);
    }

    pub fn decode(packet: &mut Bytes) -> Result<Self> {
        strip_magic(packet)?;
        Ok(Self {
            neonate: ConnectionId::decode(packet)?,
            route_token: RouteToken::decode(packet)?,
            master: Reference::decode(packet)?,
            bus: BusId::decode(packet)?,
        })
    }
}

/// Client half of the handshake: magic followed by the client's route token.
pub fn encode_client_hello(token: RouteToken, out: &mut BytesMut) {
    out.put_slice(BOOTSTRAP_MAGIC);
    token.encode(out);
}

pub fn decode_client_hello(packet: &mut Bytes) -> Result<RouteToken> {
    strip_magic(packet)?;
    RouteToken::decode(packet)
}

fn strip_magic(packet: &mut Bytes) -> Result<()> {
    if !packet.starts_with(BOOTSTRAP_MAGIC) {
        return Err(RipleyError::decoding("missing bootstrap magic"));
    }
    packet.advance(BOOTSTRAP_MAGIC.len());
    Ok(())
}

/// Route table shared by a transport and its receive task.
#[derive(Default)]
pub struct RouteEndpoints {
    next_token: AtomicU64,
    routes: RwLock<HashMap<RouteToken, Weak<TransportRoute>>>,
}

impl RouteEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self) -> RouteToken {
        RouteToken::new(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register(&self, token: RouteToken, route: &Arc<TransportRoute>) {
        self.routes.write().insert(token, Arc::downgrade(route));
    }

    pub fn unregister(&self, token: RouteToken) {
        self.routes.write().remove(&token);
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatch one incoming packet to the connection behind its route.
    ///
    /// Packets for unknown or dropped routes are discarded.
    pub fn deliver(&self, mut packet: Bytes) -> Result<()> {
        let token = RouteToken::decode(&mut packet)?;
        let route = self.routes.read().get(&token).and_then(Weak::upgrade);
        let Some(route) = route else {
            tracing::debug!("Dropped packet for unknown route token {}", token);
            return Ok(());
        };
        let Some(connection) = route.origin() else {
            tracing::debug!("Dropped packet for route {} without a connection", token);
            return Ok(());
        };
        let origin: Arc<dyn Route> = route;
        connection.handle_received(&origin, packet)
    }
}
