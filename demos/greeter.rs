//! Greeter - a client bus bootstrapped on a master bus.
//!
//! This demo shows:
//! - Exposing a service on a master connection
//! - Bootstrapping a client bus over an in-memory stream
//! - Discovering and calling the service by its transverse id
//! - Passing a local callable to the master as a callback

use std::sync::Arc;

use ripley::bus::{BusConfig, FullBus, SingleBus};
use ripley::object::{callable, ExposedCallable, ObjectProxy, ServiceImplementation};
use ripley::protocol::{BusId, TransverseId};
use ripley::transport::{PacketTransport, WriterConfig};

const HELLO: TransverseId = TransverseId::from_static("greeter.hello");
const WATCH: TransverseId = TransverseId::from_static("greeter.watch");

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let master_bus = FullBus::new(BusId::new(1), BusConfig::default())?;
    let master = master_bus.connection();
    master.add_service(
        ServiceImplementation::new("greeter")
            .expose(
                HELLO,
                callable(|_conn, (name,): (String,)| Ok(format!("hello {name}"))),
            )
            .expose(
                WATCH,
                callable(|_conn, (watcher,): (ObjectProxy,)| {
                    watcher.notify(&("someone said hello".to_string(),))?;
                    Ok(())
                }),
            ),
    );

    let (a, b) = tokio::io::duplex(64 * 1024);
    let master_side = PacketTransport::from_stream(a, WriterConfig::default());
    let client_side = PacketTransport::from_stream(b, WriterConfig::default());

    let client_bus = SingleBus::new(BusConfig::default())?;
    let (accepted, client) = tokio::join!(
        master_bus.await_client(master_side, &master),
        client_bus.bootstrap_on_transport(client_side)
    );
    println!("client connection {}", accepted?);
    let client = client?;
    let route = client_bus.master_route()?;

    let greeting: String = client
        .evaluate_transverse(&route, &HELLO, &("ripley".to_string(),))
        .await?;
    println!("{greeting}");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let watcher: Arc<dyn ExposedCallable> = callable(move |_conn, (event,): (String,)| {
        let _ = tx.send(event);
        Ok(())
    });
    client
        .evaluate_transverse::<_, ()>(&route, &WATCH, &(watcher,))
        .await?;
    if let Some(event) = rx.recv().await {
        println!("event: {event}");
    }

    Ok(())
}
