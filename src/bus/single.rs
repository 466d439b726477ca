//! Bus with exactly one peer.

use std::sync::{Arc, OnceLock};

use super::{BusConfig, BusCore, BusRouting, Bootstrapped};
use crate::connection::Connection;
use crate::error::{Result, RipleyError};
use crate::object::ObjectProxy;
use crate::protocol::BusId;
use crate::route::Route;
use crate::transport::{BootstrapTransport, BoxFuture, Transport};

/// Client bus bootstrapped on a single transport.
///
/// Every object it can reach lives behind that transport, so
/// [`BusRouting::resolve_transport`] only answers for the peer's bus.
pub struct SingleBus {
    core: Arc<BusCore>,
    peer: OnceLock<Bootstrapped>,
}

impl SingleBus {
    pub fn new(config: BusConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            core: BusCore::new(config),
            peer: OnceLock::new(),
        })
    }

    /// Run the client handshake on `transport` and return the connection
    /// the master issued.
    pub async fn bootstrap_on_transport<T>(&self, transport: Arc<T>) -> Result<Arc<Connection>>
    where
        T: BootstrapTransport + 'static,
    {
        if self.peer.get().is_some() {
            return Err(RipleyError::AlreadyBootstrapped);
        }
        let bootstrapped = self.core.bootstrap_connection(transport).await?;
        let connection = Arc::clone(&bootstrapped.connection);
        self.peer
            .set(bootstrapped)
            .map_err(|_| RipleyError::AlreadyBootstrapped)?;
        tracing::info!("Bus bootstrapped as connection {}", connection.id());
        Ok(connection)
    }

    fn peer(&self) -> Result<&Bootstrapped> {
        self.peer.get().ok_or(RipleyError::NotBootstrapped)
    }

    pub fn connection(&self) -> Result<Arc<Connection>> {
        Ok(Arc::clone(&self.peer()?.connection))
    }

    /// Proxy for the master object.
    pub fn master(&self) -> Result<ObjectProxy> {
        Ok(self.peer()?.master.clone())
    }

    /// Route toward the master connection.
    pub fn master_route(&self) -> Result<Arc<dyn Route>> {
        Ok(Arc::clone(&self.peer()?.route) as Arc<dyn Route>)
    }

    pub fn remote_bus_id(&self) -> Result<BusId> {
        Ok(self.peer()?.remote_bus)
    }

    fn peer_transport(&self, bus: BusId) -> Result<Arc<dyn Transport>> {
        let peer = self.peer()?;
        if bus != peer.remote_bus {
            return Err(RipleyError::PeerMismatch {
                expected: peer.remote_bus,
                requested: bus,
            });
        }
        Ok(Arc::clone(peer.route.transport()))
    }
}

impl BusRouting for SingleBus {
    fn core(&self) -> &Arc<BusCore> {
        &self.core
    }

    fn resolve_transport(&self, bus: BusId) -> BoxFuture<'_, Result<Arc<dyn Transport>>> {
        let result = self.peer_transport(bus);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unbootstrapped_bus() {
        let bus = SingleBus::new(BusConfig::default()).unwrap();
        assert!(matches!(bus.connection(), Err(RipleyError::NotBootstrapped)));
        assert!(matches!(
            bus.resolve_transport(BusId::new(1)).await,
            Err(RipleyError::NotBootstrapped)
        ));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = BusConfig::default().with_queue_len(0);
        assert!(matches!(SingleBus::new(config), Err(RipleyError::Config(_))));
    }
}
