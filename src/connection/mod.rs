//! Connections: object tables, transverse exposure and frame dispatch.
//!
//! A connection owns the objects it has handed out references for, the
//! transverse maps it exposes, and the routes toward the connections its
//! proxies point at. Frames arrive through [`Connection::handle_received`]
//! and leave through the outbound operations in this module.
//!
//! # Example
//!
//! ```ignore
//! use ripley::bus::FullBus;
//! use ripley::object::{callable, ServiceImplementation};
//! use ripley::protocol::TransverseId;
//!
//! let bus = FullBus::new(BusId::new(1), BusConfig::default())?;
//! let server = bus.connection();
//! server.add_service(
//!     ServiceImplementation::new("demo")
//!         .expose(TransverseId::from_static("demo.echo"), callable(|_c, (s,): (String,)| Ok(s))),
//! );
//!
//! let client = bus.connection();
//! let (route, _) = bus.link_local(&client, &server)?;
//! let echo: String = client
//!     .evaluate_transverse(&route, &TransverseId::from_static("demo.echo"), &("hi".to_string(),))
//!     .await?;
//! ```

mod dispatch;
mod outbound;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};

use crate::bus::BusCore;
use crate::codec::Marshal;
use crate::error::{Result, RipleyError};
use crate::object::{
    ObjectProxy, ObjectTable, ReferenceKind, ServiceImplementation, SharedObject, TransverseMap,
};
use crate::protocol::{ConnectionId, Reference, TransverseId};
use crate::route::{Route, RouteKey};

pub struct Connection {
    id: ConnectionId,
    bus: Arc<BusCore>,
    objects: Mutex<ObjectTable>,
    transverse_maps: RwLock<Vec<Arc<TransverseMap>>>,
    routes: RwLock<HashMap<ConnectionId, Arc<dyn Route>>>,
    resolved: Mutex<HashMap<(RouteKey, TransverseId), Reference>>,
}

impl Connection {
    pub fn new(id: ConnectionId, bus: Arc<BusCore>) -> Arc<Self> {
        Arc::new(Self {
            id,
            bus,
            objects: Mutex::new(ObjectTable::new()),
            transverse_maps: RwLock::new(Vec::new()),
            routes: RwLock::new(HashMap::new()),
            resolved: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn bus(&self) -> &Arc<BusCore> {
        &self.bus
    }

    /// Number of objects this connection has issued ids for.
    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    // ------------------------------------------------------------------
    // Reference contract
    // ------------------------------------------------------------------

    /// Reference for `object`, registering it on first sight.
    ///
    /// A proxy yields the reference it carries. Repeated calls with the
    /// same object return the same reference.
    pub fn object_to_reference(&self, object: &SharedObject) -> Reference {
        if let Some(proxy) = object.as_proxy() {
            return proxy.reference();
        }
        let id = self.objects.lock().intern(object);
        Reference::new(self.id, id)
    }

    /// Resolve `reference` as a `T`.
    ///
    /// Local references are looked up and type checked; foreign ones become
    /// a proxy over the route registered for the owning connection.
    pub fn reference_to_object<T: ReferenceKind>(&self, reference: Reference) -> Result<T> {
        if reference.connection == self.id {
            let object = self
                .objects
                .lock()
                .get(reference.object)
                .ok_or(RipleyError::UnknownObjectId(reference.object))?;
            return T::from_local(&object).ok_or_else(|| RipleyError::ReferenceTypeMismatch {
                expected: T::TYPE_NAME.to_string(),
                found: object.kind_name().to_string(),
            });
        }

        let route = self
            .route_to(reference.connection)
            .ok_or(RipleyError::RouteNotFound(reference.connection))?;
        T::from_proxy(ObjectProxy::new(route, reference))
    }

    /// Marshal one value, or a tuple of values in index order.
    pub fn serialize_object<T: Marshal>(&self, value: &T, out: &mut BytesMut) -> Result<()> {
        value.marshal(self, out)
    }

    /// Unmarshal one value, or a tuple of values in index order.
    pub fn deserialize_object<T: Marshal>(&self, input: &mut Bytes) -> Result<T> {
        T::unmarshal(self, input)
    }

    // ------------------------------------------------------------------
    // Transverse exposure
    // ------------------------------------------------------------------

    /// Append a transverse map. Earlier maps take precedence on lookup.
    pub fn add_transverse_map(&self, map: TransverseMap) {
        self.transverse_maps.write().push(Arc::new(map));
    }

    /// Expose every entry of `service`.
    pub fn add_service(&self, service: ServiceImplementation) {
        tracing::debug!("Connection {} exposes service {}", self.id, service.name());
        self.add_transverse_map(service.into_map());
    }

    /// Object exposed under `id` by the first map containing it.
    pub fn transverse_id_to_object(&self, id: &TransverseId) -> Result<SharedObject> {
        self.transverse_maps
            .read()
            .iter()
            .find_map(|map| map.get(id).cloned())
            .ok_or_else(|| RipleyError::UnknownTransverseId(id.clone()))
    }

    pub fn transverse_id_to_reference(&self, id: &TransverseId) -> Result<Reference> {
        let object = self.transverse_id_to_object(id)?;
        Ok(self.object_to_reference(&object))
    }

    // ------------------------------------------------------------------
    // Proxy routes
    // ------------------------------------------------------------------

    /// Make `route` the way to objects owned by `remote`.
    pub fn register_route(&self, remote: ConnectionId, route: Arc<dyn Route>) {
        self.routes.write().insert(remote, route);
    }

    pub fn route_to(&self, remote: ConnectionId) -> Option<Arc<dyn Route>> {
        self.routes.read().get(&remote).cloned()
    }

    /// Forget every proxy route with `key` and its cached resolutions.
    pub fn drop_route(&self, key: RouteKey) {
        self.routes.write().retain(|_, route| route.key() != key);
        self.resolved.lock().retain(|(route, _), _| *route != key);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("objects", &self.object_count())
            .field("transverse_maps", &self.transverse_maps.read().len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::bus::BusConfig;
    use crate::protocol::BusId;
    use crate::route::{FrameSink, OutputBuffer};

    /// Route that records every committed frame.
    pub(crate) struct RecordingRoute {
        key: RouteKey,
        connection: std::sync::Weak<Connection>,
        sink: Arc<Recorder>,
    }

    #[derive(Default)]
    pub(crate) struct Recorder {
        frames: Mutex<Vec<Bytes>>,
        refuse: Option<fn() -> RipleyError>,
    }

    impl FrameSink for Recorder {
        fn commit(&self, packet: Bytes) -> Result<()> {
            if let Some(refuse) = self.refuse {
                return Err(refuse());
            }
            self.frames.lock().push(packet);
            Ok(())
        }
    }

    impl RecordingRoute {
        pub(crate) fn new(connection: &Arc<Connection>) -> Arc<Self> {
            Arc::new(Self {
                key: RouteKey::next(),
                connection: Arc::downgrade(connection),
                sink: Arc::new(Recorder::default()),
            })
        }

        /// Route whose every commit fails with `refuse()`.
        pub(crate) fn refusing(
            connection: &Arc<Connection>,
            refuse: fn() -> RipleyError,
        ) -> Arc<Self> {
            Arc::new(Self {
                key: RouteKey::next(),
                connection: Arc::downgrade(connection),
                sink: Arc::new(Recorder {
                    frames: Mutex::new(Vec::new()),
                    refuse: Some(refuse),
                }),
            })
        }

        pub(crate) fn frames(&self) -> Vec<Bytes> {
            self.sink.frames.lock().clone()
        }
    }

    impl Route for RecordingRoute {
        fn key(&self) -> RouteKey {
            self.key
        }

        fn output_buffer(&self) -> Result<OutputBuffer> {
            Ok(OutputBuffer::new(Arc::clone(&self.sink) as Arc<dyn FrameSink>))
        }

        fn connection(&self) -> Result<Arc<Connection>> {
            self.connection.upgrade().ok_or(RipleyError::RouteClosed)
        }

        fn remote_bus_id(&self) -> Option<BusId> {
            None
        }

        fn unregister(&self) {}
    }

    pub(crate) fn connection(id: u64) -> Arc<Connection> {
        let bus = BusCore::new(BusConfig::default());
        Connection::new(ConnectionId::new(id), bus)
    }
}
