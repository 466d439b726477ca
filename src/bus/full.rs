//! Bus hosting many connections and reaching many peers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tokio::sync::OnceCell;

use super::{services, BusConfig, BusCore, BusMaster, BusRouting, TransportConnector};
use crate::connection::Connection;
use crate::error::{Result, RipleyError};
use crate::object::{callable, SharedObject};
use crate::protocol::{BusId, ConnectionId};
use crate::route::{Route, TransportRoute};
use crate::transport::{BootstrapOffer, BootstrapTransport, BoxFuture, LoopbackTransport, Transport};

type TransportSlot = Arc<OnceCell<Arc<dyn Transport>>>;

/// Bus owning a [`BusMaster`].
///
/// Connections on this bus talk to each other over a loopback transport and
/// to other buses over transports found through the master. Each remote bus
/// gets at most one transport; concurrent requests share the one being
/// opened.
pub struct FullBus {
    core: Arc<BusCore>,
    bus_id: BusId,
    master: Arc<BusMaster>,
    master_object: SharedObject,
    transports: Mutex<HashMap<BusId, TransportSlot>>,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    loopback: OnceLock<Arc<LoopbackTransport>>,
    no_loopback: AtomicBool,
}

impl FullBus {
    pub fn new(bus_id: BusId, config: BusConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let master = Arc::new(BusMaster::for_bus(bus_id));
        let issuer = Arc::clone(&master);
        let master_object =
            SharedObject::Callable(callable(move |_c, (): ()| Ok(issuer.neonate_id())));
        Ok(Arc::new(Self {
            core: BusCore::new(config),
            bus_id,
            master,
            master_object,
            transports: Mutex::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            loopback: OnceLock::new(),
            no_loopback: AtomicBool::new(false),
        }))
    }

    pub fn bus_id(&self) -> BusId {
        self.bus_id
    }

    pub fn master(&self) -> &Arc<BusMaster> {
        &self.master
    }

    /// Callable handed to bootstrapped clients; evaluating it issues a
    /// fresh connection id.
    pub fn master_object(&self) -> &SharedObject {
        &self.master_object
    }

    /// Mark the bus ready. With `loopback`, the transport to this bus's own
    /// id is started now instead of on first use. Without it, resolving this
    /// bus's own id fails with [`RipleyError::UnknownBus`];
    /// [`FullBus::link_local`] still works.
    ///
    /// Must be called inside a Tokio runtime when `loopback` is set.
    pub fn engage_bus(&self, loopback: bool) {
        self.no_loopback.store(!loopback, Ordering::Release);
        if loopback {
            self.loopback();
        }
        tracing::info!("Bus {} engaged (loopback: {})", self.bus_id, loopback);
    }

    /// Create a connection with a fresh id and the basic-error map.
    pub fn connection(&self) -> Arc<Connection> {
        let connection = Connection::new(self.master.neonate_id(), Arc::clone(&self.core));
        connection.add_transverse_map(services::basic_error_map());
        self.connections
            .write()
            .insert(connection.id(), Arc::clone(&connection));
        tracing::debug!("Bus {} created connection {}", self.bus_id, connection.id());
        connection
    }

    pub fn connection_by_id(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    /// Record where this bus listens so other buses can reach it.
    pub fn register_server(&self, address: impl Into<String>) {
        self.master.register_server(self.bus_id, address);
    }

    pub fn register_connector(
        &self,
        scheme: impl Into<String>,
        connector: Arc<dyn TransportConnector>,
    ) {
        self.master.register_connector(scheme, connector);
    }

    /// Use `transport` for every route toward `bus`.
    ///
    /// An existing transport for `bus` is kept.
    pub fn register_transport(&self, bus: BusId, transport: Arc<dyn Transport>) {
        self.transports
            .lock()
            .entry(bus)
            .or_insert_with(|| Arc::new(OnceCell::new_with(Some(transport))));
    }

    fn loopback(&self) -> Arc<LoopbackTransport> {
        let loopback = self.loopback.get_or_init(|| {
            let transport = LoopbackTransport::new();
            transport.engage(self.bus_id);
            transport
        });
        Arc::clone(loopback)
    }

    /// Join two connections of this bus with a pair of loopback routes.
    ///
    /// Returns the route from `a` toward `b` and the one from `b` toward
    /// `a`. Must be called inside a Tokio runtime.
    pub fn link_local(
        &self,
        a: &Arc<Connection>,
        b: &Arc<Connection>,
    ) -> Result<(Arc<dyn Route>, Arc<dyn Route>)> {
        let transport = self.loopback() as Arc<dyn Transport>;
        let a_to_b = TransportRoute::open(Arc::clone(&transport));
        let b_to_a = TransportRoute::open(transport);
        a_to_b.set_origin(a);
        b_to_a.set_origin(b);
        a_to_b.set_destination(b_to_a.token(), b.id())?;
        b_to_a.set_destination(a_to_b.token(), a.id())?;
        Ok((a_to_b as Arc<dyn Route>, b_to_a as Arc<dyn Route>))
    }

    /// Master side of the bootstrap handshake on `transport`.
    ///
    /// Issues the client its connection id, offers the master object owned
    /// by `master_connection`, and routes `master_connection` to the client.
    /// Returns the client's connection id.
    pub async fn await_client<T>(
        &self,
        transport: Arc<T>,
        master_connection: &Arc<Connection>,
    ) -> Result<ConnectionId>
    where
        T: BootstrapTransport + 'static,
    {
        let route = TransportRoute::open(Arc::clone(&transport) as Arc<dyn Transport>);
        route.set_origin(master_connection);

        let neonate = self.master.neonate_id();
        let offer = BootstrapOffer {
            neonate,
            route_token: route.token(),
            master: master_connection.object_to_reference(&self.master_object),
            bus: self.bus_id,
        };
        let client_bus = BusId::from(neonate);
        if client_bus == self.bus_id {
            return Err(RipleyError::Config(format!(
                "client bus id {client_bus} collides with bus {}",
                self.bus_id
            )));
        }
        let client_token = transport.master_bootstrap(offer).await?;
        route.set_destination(client_token, neonate)?;

        transport.engage(client_bus);
        self.register_transport(client_bus, transport);
        tracing::info!("Bus {} accepted client connection {}", self.bus_id, neonate);
        Ok(neonate)
    }

    async fn transport_to(&self, bus: BusId) -> Result<Arc<dyn Transport>> {
        if bus == self.bus_id {
            if self.no_loopback.load(Ordering::Acquire) {
                return Err(RipleyError::UnknownBus(bus));
            }
            return Ok(self.loopback() as Arc<dyn Transport>);
        }
        let slot = Arc::clone(self.transports.lock().entry(bus).or_default());
        let transport = slot
            .get_or_try_init(|| async {
                let transport = self.master.request_transport(bus).await?;
                transport.engage(bus);
                tracing::debug!("Bus {} opened transport to bus {}", self.bus_id, bus);
                Ok::<_, RipleyError>(transport)
            })
            .await?;
        Ok(Arc::clone(transport))
    }
}

impl BusRouting for FullBus {
    fn core(&self) -> &Arc<BusCore> {
        &self.core
    }

    fn resolve_transport(&self, bus: BusId) -> BoxFuture<'_, Result<Arc<dyn Transport>>> {
        Box::pin(self.transport_to(bus))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingConnector {
        opened: AtomicUsize,
    }

    impl TransportConnector for CountingConnector {
        fn connect(&self, _address: &str) -> BoxFuture<'static, Result<Arc<dyn Transport>>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(LoopbackTransport::new() as Arc<dyn Transport>) })
        }
    }

    #[tokio::test]
    async fn test_connection_ids_are_unique() {
        let bus = FullBus::new(BusId::new(1), BusConfig::default()).unwrap();
        let a = bus.connection();
        let b = bus.connection();
        assert_ne!(a.id(), b.id());
        assert!(bus.connection_by_id(a.id()).is_some());
    }

    #[tokio::test]
    async fn test_same_bus_resolves_to_loopback() {
        let bus = FullBus::new(BusId::new(1), BusConfig::default()).unwrap();
        bus.engage_bus(true);
        let first = bus.resolve_transport(BusId::new(1)).await.unwrap();
        let second = bus.resolve_transport(BusId::new(1)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.remote_bus_id(), Some(BusId::new(1)));
    }

    #[tokio::test]
    async fn test_no_loopback_refuses_own_bus() {
        let bus = FullBus::new(BusId::new(1), BusConfig::default()).unwrap();
        bus.engage_bus(false);
        assert!(matches!(
            bus.resolve_transport(BusId::new(1)).await,
            Err(RipleyError::UnknownBus(id)) if id == BusId::new(1)
        ));

        let a = bus.connection();
        let b = bus.connection();
        assert!(bus.link_local(&a, &b).is_ok());
        assert!(bus.resolve_transport(BusId::new(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_remote_transport_opened_once() {
        let bus = FullBus::new(BusId::new(1), BusConfig::default()).unwrap();
        let connector = Arc::new(CountingConnector {
            opened: AtomicUsize::new(0),
        });
        bus.register_connector("mem", Arc::clone(&connector) as Arc<dyn TransportConnector>);
        bus.master().register_server(BusId::new(2), "mem://two");

        let (first, second) = tokio::join!(
            bus.resolve_transport(BusId::new(2)),
            bus.resolve_transport(BusId::new(2))
        );
        assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_bus_fails() {
        let bus = FullBus::new(BusId::new(1), BusConfig::default()).unwrap();
        assert!(matches!(
            bus.resolve_transport(BusId::new(8)).await,
            Err(RipleyError::UnknownBus(_))
        ));
    }

    #[tokio::test]
    async fn test_link_local_registers_routes() {
        let bus = FullBus::new(BusId::new(1), BusConfig::default()).unwrap();
        let a = bus.connection();
        let b = bus.connection();
        let (a_to_b, b_to_a) = bus.link_local(&a, &b).unwrap();
        assert_eq!(a.route_to(b.id()).unwrap().key(), a_to_b.key());
        assert_eq!(b.route_to(a.id()).unwrap().key(), b_to_a.key());
    }
}
