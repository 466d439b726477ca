//! Buses: correlation of replies, fault policy and transport selection.
//!
//! [`BusCore`] is shared by every connection of a bus. It issues message ids,
//! matches replies to pending calls, expires calls nobody answered, and
//! decides what happens to faults that are not reported back to a caller.
//!
//! Two bus flavours decide how transports are found:
//! - [`SingleBus`] - one peer, reached over the transport it bootstrapped on
//! - [`FullBus`] - many peers, transports resolved through a [`BusMaster`]

mod config;
mod correlation;
mod full;
mod master;
pub mod services;
mod single;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::error::{Result, RipleyError};
use crate::object::ObjectProxy;
use crate::protocol::{BusId, MessageId};
use crate::route::{Route, RouteKey, TransportRoute};
use crate::transport::{BootstrapTransport, BoxFuture, Transport};

pub use config::{BusConfig, DEFAULT_QUEUE_LEN, DEFAULT_TICK_INTERVAL};
pub use correlation::{PendingCall, PendingReply};
pub use full::FullBus;
pub use master::{BusMaster, TransportConnector};
pub use single::SingleBus;

use correlation::MessageQueues;

/// Callback for faults the bus handles.
pub type FaultHook = Arc<dyn Fn(&dyn Route, &RipleyError) + Send + Sync>;

/// Transport selection shared by the bus flavours.
pub trait BusRouting: Send + Sync {
    fn core(&self) -> &Arc<BusCore>;

    /// Transport reaching `bus`.
    fn resolve_transport(&self, bus: BusId) -> BoxFuture<'_, Result<Arc<dyn Transport>>>;
}

/// Result of the client side of the bootstrap handshake.
pub struct Bootstrapped {
    /// Connection created with the id the master issued.
    pub connection: Arc<Connection>,
    /// Route toward the master connection.
    pub route: Arc<TransportRoute>,
    /// The master object.
    pub master: ObjectProxy,
    /// The master's bus.
    pub remote_bus: BusId,
}

/// State shared by all connections of one bus.
pub struct BusCore {
    config: BusConfig,
    queues: Mutex<MessageQueues>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    local_fault: RwLock<Option<FaultHook>>,
    general_fault: RwLock<Option<FaultHook>>,
}

impl BusCore {
    pub fn new(config: BusConfig) -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(MessageQueues::new(config.queue_len)),
            config,
            watchdog: Mutex::new(None),
            local_fault: RwLock::new(None),
            general_fault: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Issue a message id for a request leaving on `route`.
    ///
    /// The first call made inside a Tokio runtime starts the timeout
    /// watchdog.
    pub fn wait_for_reply(self: &Arc<Self>, route: RouteKey) -> (MessageId, PendingReply) {
        self.ensure_watchdog();
        self.queues.lock().insert(route)
    }

    /// Take the pending call `id` if it was sent on `route`.
    pub fn resolve_message_id(&self, id: MessageId, route: RouteKey) -> Result<PendingCall> {
        self.queues.lock().resolve(id, route)
    }

    /// Withdraw the call `id` whose request never left.
    pub fn cancel(&self, id: MessageId, route: RouteKey) {
        if self.queues.lock().resolve(id, route).is_ok() {
            tracing::trace!("Withdrew message {} on {}", id, route);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.queues.lock().len()
    }

    /// Advance the correlation ring one step, failing expired calls with
    /// `Timeout`. Returns how many expired.
    pub fn tick(&self) -> usize {
        let expired = self.queues.lock().rotate();
        let count = expired.len();
        for call in expired {
            call.fail(RipleyError::Timeout);
        }
        if count > 0 {
            tracing::debug!("{} calls timed out", count);
        }
        count
    }

    /// Run [`BusCore::tick`] every `tick_interval` until the bus is dropped.
    pub fn spawn_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = Arc::downgrade(self);
        let period = self.config.tick_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                match bus.upgrade() {
                    Some(bus) => {
                        bus.tick();
                    }
                    None => break,
                }
            }
        })
    }

    /// Start the watchdog unless one is running. A watchdog whose runtime
    /// shut down is replaced.
    fn ensure_watchdog(self: &Arc<Self>) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let mut watchdog = self.watchdog.lock();
        if watchdog.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        if watchdog.is_some() {
            tracing::debug!("Restarting stopped watchdog");
        }
        *watchdog = Some(self.spawn_watchdog());
    }

    /// Replace the handler for local faults (default: log at error level).
    pub fn on_local_exception(&self, hook: FaultHook) {
        *self.local_fault.write() = Some(hook);
    }

    /// Replace the handler for GENERAL_ERROR frames (default: log at warn
    /// level).
    pub fn on_general_error(&self, hook: FaultHook) {
        *self.general_fault.write() = Some(hook);
    }

    /// A request failed here for a reason the caller is not told about.
    pub fn handle_local_exception(&self, route: &dyn Route, error: RipleyError) {
        let hook = self.local_fault.read().clone();
        match hook {
            Some(hook) => hook(route, &error),
            None => tracing::error!("Local exception on {}: {}", route.key(), error),
        }
    }

    /// The peer reported an error not tied to a request.
    pub fn handle_general_error(&self, route: &dyn Route, error: RipleyError) {
        let hook = self.general_fault.read().clone();
        match hook {
            Some(hook) => hook(route, &error),
            None => tracing::warn!("General error from {}: {}", route.key(), error),
        }
    }

    /// `route` can no longer be written to: stop using it.
    pub fn report_destination_failure(&self, route: &dyn Route) {
        tracing::warn!("Destination failure on {}", route.key());
        if let Ok(connection) = route.connection() {
            connection.drop_route(route.key());
        }
        route.unregister();
    }

    /// Client side of the bootstrap handshake on `transport`.
    ///
    /// Creates the connection with the id the master issued, routes it to
    /// the master connection, installs the bus-client and basic-error maps
    /// and engages the transport.
    pub async fn bootstrap_connection<T>(
        self: &Arc<Self>,
        transport: Arc<T>,
    ) -> Result<Bootstrapped>
    where
        T: BootstrapTransport + 'static,
    {
        let route = TransportRoute::open(Arc::clone(&transport) as Arc<dyn Transport>);
        let offer = transport.client_bootstrap(route.token()).await?;

        let connection = Connection::new(offer.neonate, Arc::clone(self));
        route.set_origin(&connection);
        route.set_destination(offer.route_token, offer.master.connection)?;
        connection.add_transverse_map(services::bus_client_map(BusId::from(offer.neonate)));
        connection.add_transverse_map(services::basic_error_map());
        transport.engage(offer.bus);

        let master = connection.reference_to_object::<ObjectProxy>(offer.master)?;
        tracing::debug!(
            "Bootstrapped connection {} to bus {}",
            offer.neonate,
            offer.bus
        );
        Ok(Bootstrapped {
            connection,
            route,
            master,
            remote_bus: offer.bus,
        })
    }
}
