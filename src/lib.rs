//! # ripley
//!
//! Distributed object RPC substrate.
//!
//! Connections hand out references to local objects, discover each other's
//! objects by well-known transverse ids, and call them over a compact
//! binary protocol. Frames travel on routes carried by transports: an
//! in-process loopback, or length-prefixed packets over any byte stream.
//!
//! ## Architecture
//!
//! - **Protocol**: header bytes, varint ids, packet framing
//! - **Codec**: value and reference marshalling
//! - **Objects**: callables, filters, error constructors and proxies
//! - **Connections**: object tables, transverse maps, frame dispatch
//! - **Buses**: reply correlation, timeouts, bootstrap, transport selection
//!
//! ## Example
//!
//! ```ignore
//! use ripley::bus::{BusConfig, FullBus};
//! use ripley::object::{callable, ServiceImplementation};
//! use ripley::protocol::{BusId, TransverseId};
//!
//! #[tokio::main]
//! async fn main() -> ripley::Result<()> {
//!     let bus = FullBus::new(BusId::new(1), BusConfig::default())?;
//!     let server = bus.connection();
//!     server.add_service(ServiceImplementation::new("greeter").expose(
//!         TransverseId::from_static("greeter.hello"),
//!         callable(|_conn, (name,): (String,)| Ok(format!("hello {name}"))),
//!     ));
//!
//!     let client = bus.connection();
//!     let (route, _) = bus.link_local(&client, &server)?;
//!     let greeting: String = client
//!         .evaluate_transverse(
//!             &route,
//!             &TransverseId::from_static("greeter.hello"),
//!             &("world".to_string(),),
//!         )
//!         .await?;
//!     assert_eq!(greeting, "hello world");
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod codec;
pub mod connection;
pub mod error;
pub mod object;
pub mod protocol;
pub mod route;
pub mod transport;

pub use bus::{BusConfig, BusCore, BusRouting, FullBus, SingleBus};
pub use connection::Connection;
pub use error::{Result, RipleyError, TransverseError};
pub use object::{callable, ObjectProxy, ServiceImplementation, SharedObject};
pub use protocol::{BusId, ConnectionId, Reference, TransverseId};
