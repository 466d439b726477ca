use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use super::ExposedCallable;
use crate::codec::Marshal;
use crate::connection::Connection;
use crate::error::{Result, RipleyError};
use crate::protocol::{headers, Reference};
use crate::route::Route;

/// Local stand-in for an object owned by another connection.
///
/// Holds the route toward the owner and the object's reference there.
#[derive(Clone)]
pub struct ObjectProxy {
    route: Arc<dyn Route>,
    reference: Reference,
}

impl ObjectProxy {
    pub fn new(route: Arc<dyn Route>, reference: Reference) -> Self {
        Self { route, reference }
    }

    pub fn reference(&self) -> Reference {
        self.reference
    }

    pub fn route(&self) -> &Arc<dyn Route> {
        &self.route
    }

    /// Send a NOTIFY to the remote object.
    pub fn notify<A: Marshal>(&self, args: &A) -> Result<()> {
        let connection = self.route.connection()?;
        connection.notify(&self.route, self.reference, args)
    }

    /// Send an EVAL to the remote object and wait for its result.
    pub fn evaluate<A: Marshal, R: Marshal>(&self, args: &A) -> impl Future<Output = Result<R>> {
        let call = self
            .route
            .connection()
            .map(|connection| connection.evaluate(&self.route, self.reference, args));
        async move { call?.await }
    }

    /// Tell the owner this side no longer needs the object.
    pub fn release(&self) -> Result<()> {
        let connection = self.route.connection()?;
        connection.transmit_deref(&self.route, self.reference)
    }
}

impl ExposedCallable for ObjectProxy {
    fn notify(&self, _connection: &Connection, args: &mut Bytes) -> Result<()> {
        let mut out = self.route.output_buffer()?;
        out.put_u8(headers::NOTIFY);
        self.reference.encode(&mut out);
        out.extend_from_slice(args);
        args.clear();
        out.commit()
    }

    fn evaluate(
        &self,
        _connection: &Connection,
        _args: &mut Bytes,
        _reply: &mut BytesMut,
    ) -> Result<()> {
        Err(RipleyError::NotLocal(self.reference))
    }

    fn as_proxy(&self) -> Option<&ObjectProxy> {
        Some(self)
    }
}

impl fmt::Debug for ObjectProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectProxy")
            .field("reference", &self.reference)
            .field("route", &self.route.key())
            .finish()
    }
}
