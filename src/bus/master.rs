//! Bus master: connection id issuance and the listening-endpoint registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Result, RipleyError};
use crate::protocol::{BusId, ConnectionId};
use crate::transport::{BoxFuture, Transport};

/// Opens transports for one address scheme, e.g. `tcp` or `unix`.
pub trait TransportConnector: Send + Sync {
    /// Connect to `address` (the part after `scheme://`).
    fn connect(&self, address: &str) -> BoxFuture<'static, Result<Arc<dyn Transport>>>;
}

#[derive(Default)]
pub struct BusMaster {
    next_connection: AtomicU64,
    reserved: Option<BusId>,
    servers: RwLock<HashMap<BusId, String>>,
    connectors: RwLock<HashMap<String, Arc<dyn TransportConnector>>>,
}

impl BusMaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Master owned by the bus `bus`. Its numeric id is never issued as a
    /// connection id, so a client's bus id cannot equal the owner's.
    pub fn for_bus(bus: BusId) -> Self {
        Self {
            reserved: Some(bus),
            ..Self::default()
        }
    }

    /// Issue a fresh connection id. Ids start at 0 and skip the reserved
    /// bus id.
    pub fn neonate_id(&self) -> ConnectionId {
        loop {
            let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
            if self.reserved.map(BusId::get) != Some(id) {
                return ConnectionId::new(id);
            }
        }
    }

    /// Record where `bus` listens, as `scheme://address`.
    pub fn register_server(&self, bus: BusId, address: impl Into<String>) {
        self.servers.write().insert(bus, address.into());
    }

    pub fn server_address(&self, bus: BusId) -> Option<String> {
        self.servers.read().get(&bus).cloned()
    }

    pub fn register_connector(
        &self,
        scheme: impl Into<String>,
        connector: Arc<dyn TransportConnector>,
    ) {
        self.connectors.write().insert(scheme.into(), connector);
    }

    /// Open a transport to the listening endpoint of `bus`.
    pub fn request_transport(&self, bus: BusId) -> BoxFuture<'static, Result<Arc<dyn Transport>>> {
        match self.connector_for(bus) {
            Ok(connect) => connect,
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }

    fn connector_for(&self, bus: BusId) -> Result<BoxFuture<'static, Result<Arc<dyn Transport>>>> {
        let address = self.server_address(bus).ok_or(RipleyError::UnknownBus(bus))?;
        let (scheme, rest) = address
            .split_once("://")
            .ok_or_else(|| RipleyError::Config(format!("address without scheme: {address}")))?;
        let connector = self
            .connectors
            .read()
            .get(scheme)
            .cloned()
            .ok_or_else(|| RipleyError::UnsupportedScheme(scheme.to_string()))?;
        Ok(connector.connect(rest))
    }
}
