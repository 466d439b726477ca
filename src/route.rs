//! Routes: addressable paths from a connection to a peer.
//!
//! A route hands out [`OutputBuffer`]s. Frames are written into the buffer
//! and sent by [`OutputBuffer::commit`].
//!
//! ```text
//! Connection ─► TransportRoute ─► Transport ─► peer
//!                    ▲
//!      FilteredRoute / ReplyFilteredRoute (wrap a parent, share its key)
//! ```

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::{BufMut, Bytes, BytesMut};

use crate::connection::Connection;
use crate::error::{Result, RipleyError};
use crate::object::FilterElement;
use crate::protocol::{headers, BusId, ConnectionId, Reference, RouteToken};
use crate::transport::Transport;

static NEXT_ROUTE_KEY: AtomicU64 = AtomicU64::new(1);

/// Process-wide identity of a route.
///
/// Pending replies remember the key of the route their request left on; a
/// reply arriving on any other route is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteKey(u64);

impl RouteKey {
    pub fn next() -> Self {
        RouteKey(NEXT_ROUTE_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "route#{}", self.0)
    }
}

/// Receives committed packets.
pub trait FrameSink: Send + Sync {
    fn commit(&self, packet: Bytes) -> Result<()>;
}

/// Writable buffer bound to the sink that sends it.
///
/// Dereferences to `BytesMut`, so frames are written with `BufMut`.
pub struct OutputBuffer {
    data: BytesMut,
    sink: Arc<dyn FrameSink>,
}

impl OutputBuffer {
    pub fn new(sink: Arc<dyn FrameSink>) -> Self {
        Self {
            data: BytesMut::with_capacity(64),
            sink,
        }
    }

    /// Send the buffer. Consumes it, so a frame is committed at most once.
    pub fn commit(self) -> Result<()> {
        self.sink.commit(self.data.freeze())
    }
}

impl Deref for OutputBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.data
    }
}

impl DerefMut for OutputBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }
}

/// Path from a connection to a peer.
pub trait Route: Send + Sync {
    fn key(&self) -> RouteKey;

    /// Open a buffer whose commit delivers one frame to the peer.
    fn output_buffer(&self) -> Result<OutputBuffer>;

    /// The local connection this route belongs to.
    fn connection(&self) -> Result<Arc<Connection>>;

    /// Bus at the far end, once known.
    fn remote_bus_id(&self) -> Option<BusId>;

    /// Stop receiving on this route.
    fn unregister(&self);
}

/// Route carried by a [`Transport`].
///
/// Incoming packets addressed to [`TransportRoute::token`] are dispatched to
/// the origin connection. Outgoing packets are prefixed with the peer's
/// token (the shiboleth) once a destination is set.
pub struct TransportRoute {
    key: RouteKey,
    token: RouteToken,
    transport: Arc<dyn Transport>,
    shiboleth: OnceLock<RouteToken>,
    origin: OnceLock<Weak<Connection>>,
}

impl TransportRoute {
    /// Create a route and register it on `transport`.
    pub fn open(transport: Arc<dyn Transport>) -> Arc<Self> {
        let token = transport.allocate_token();
        let route = Arc::new(Self {
            key: RouteKey::next(),
            token,
            transport: Arc::clone(&transport),
            shiboleth: OnceLock::new(),
            origin: OnceLock::new(),
        });
        transport.register_route(token, &route);
        route
    }

    pub fn token(&self) -> RouteToken {
        self.token
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Bind the route to the connection that receives its packets.
    pub fn set_origin(&self, connection: &Arc<Connection>) {
        let _ = self.origin.set(Arc::downgrade(connection));
    }

    /// Record the peer's token and make this route the way to `remote`.
    pub fn set_destination(
        self: &Arc<Self>,
        shiboleth: RouteToken,
        remote: ConnectionId,
    ) -> Result<()> {
        let _ = self.shiboleth.set(shiboleth);
        let connection = self.connection()?;
        connection.register_route(remote, Arc::clone(self) as Arc<dyn Route>);
        Ok(())
    }

    pub(crate) fn origin(&self) -> Option<Arc<Connection>> {
        self.origin.get().and_then(Weak::upgrade)
    }
}

impl Route for TransportRoute {
    fn key(&self) -> RouteKey {
        self.key
    }

    fn output_buffer(&self) -> Result<OutputBuffer> {
        let shiboleth = self.shiboleth.get().ok_or(RipleyError::RouteClosed)?;
        self.transport.open_buffer(*shiboleth)
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.origin().ok_or(RipleyError::RouteClosed)
    }

    fn remote_bus_id(&self) -> Option<BusId> {
        self.transport.remote_bus_id()
    }

    fn unregister(&self) {
        self.transport.unregister_route(self.token);
    }
}

impl fmt::Debug for TransportRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRoute")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("shiboleth", &self.shiboleth.get())
            .finish()
    }
}

/// Route whose frames are encoded by a local filter and decoded by a filter
/// on the peer.
///
/// Every committed frame becomes
/// `FILTER_IN + remote filter Reference + transcoded frame` on the parent.
/// Used both to send filtered requests and as the reply route of an
/// incoming FILTER_OUT.
pub struct FilteredRoute {
    parent: Arc<dyn Route>,
    sink: Arc<FilterSink>,
}

struct FilterSink {
    parent: Arc<dyn Route>,
    filter: Arc<dyn FilterElement>,
    remote: Reference,
}

impl FrameSink for FilterSink {
    fn commit(&self, packet: Bytes) -> Result<()> {
        let mut out = self.parent.output_buffer()?;
        out.put_u8(headers::FILTER_IN);
        self.remote.encode(&mut out);
        self.filter.transcode(&packet, &mut out)?;
        out.commit()
    }
}

impl FilteredRoute {
    pub fn new(parent: Arc<dyn Route>, filter: Arc<dyn FilterElement>, remote: Reference) -> Self {
        let sink = Arc::new(FilterSink {
            parent: Arc::clone(&parent),
            filter,
            remote,
        });
        Self { parent, sink }
    }
}

impl Route for FilteredRoute {
    fn key(&self) -> RouteKey {
        self.parent.key()
    }

    fn output_buffer(&self) -> Result<OutputBuffer> {
        Ok(OutputBuffer::new(Arc::clone(&self.sink) as Arc<dyn FrameSink>))
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.parent.connection()
    }

    fn remote_bus_id(&self) -> Option<BusId> {
        self.parent.remote_bus_id()
    }

    fn unregister(&self) {
        self.parent.unregister();
    }
}

/// Route that asks the peer to filter its replies.
///
/// Every frame is prefixed with
/// `FILTER_OUT + remote encoder Reference + local decoder Reference`.
pub struct ReplyFilteredRoute {
    parent: Arc<dyn Route>,
    remote_encoder: Reference,
    local_decoder: Reference,
}

impl ReplyFilteredRoute {
    pub fn new(
        parent: Arc<dyn Route>,
        remote_encoder: Reference,
        local_decoder: Reference,
    ) -> Self {
        Self {
            parent,
            remote_encoder,
            local_decoder,
        }
    }
}

impl Route for ReplyFilteredRoute {
    fn key(&self) -> RouteKey {
        self.parent.key()
    }

    fn output_buffer(&self) -> Result<OutputBuffer> {
        let mut out = self.parent.output_buffer()?;
        out.put_u8(headers::FILTER_OUT);
        self.remote_encoder.encode(&mut out);
        self.local_decoder.encode(&mut out);
        Ok(out)
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.parent.connection()
    }

    fn remote_bus_id(&self) -> Option<BusId> {
        self.parent.remote_bus_id()
    }

    fn unregister(&self) {
        self.parent.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Capture(Mutex<Vec<Bytes>>);

    impl FrameSink for Capture {
        fn commit(&self, packet: Bytes) -> Result<()> {
            self.0.lock().push(packet);
            Ok(())
        }
    }

    #[test]
    fn test_route_keys_are_unique() {
        let a = RouteKey::next();
        let b = RouteKey::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_output_buffer_commit() {
        let capture = Arc::new(Capture::default());
        let mut out = OutputBuffer::new(Arc::clone(&capture) as Arc<dyn FrameSink>);
        out.put_u8(headers::HUP);
        out.extend_from_slice(b"x");
        out.commit().unwrap();

        let packets = capture.0.lock();
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0][..], &[0x00, b'x']);
    }
}
