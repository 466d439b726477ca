//! Closure-backed callables.
//!
//! # Example
//!
//! ```
//! use ripley::object::callable;
//!
//! let add = callable(|_conn, (a, b): (i32, i32)| Ok(a + b));
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::ExposedCallable;
use crate::codec::Marshal;
use crate::connection::Connection;
use crate::error::Result;

/// Wrapper that unmarshals arguments before calling the closure and marshals
/// its result into the reply.
pub struct TypedCallable<F, A, R>
where
    F: Fn(&Connection, A) -> Result<R> + Send + Sync + 'static,
    A: Marshal + 'static,
    R: Marshal + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(A) -> R>,
}

impl<F, A, R> TypedCallable<F, A, R>
where
    F: Fn(&Connection, A) -> Result<R> + Send + Sync + 'static,
    A: Marshal + 'static,
    R: Marshal + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, A, R> ExposedCallable for TypedCallable<F, A, R>
where
    F: Fn(&Connection, A) -> Result<R> + Send + Sync + 'static,
    A: Marshal + 'static,
    R: Marshal + 'static,
{
    fn notify(&self, connection: &Connection, args: &mut Bytes) -> Result<()> {
        let parsed = A::unmarshal(connection, args)?;
        (self.handler)(connection, parsed).map(drop)
    }

    fn evaluate(
        &self,
        connection: &Connection,
        args: &mut Bytes,
        reply: &mut BytesMut,
    ) -> Result<()> {
        let parsed = A::unmarshal(connection, args)?;
        let result = (self.handler)(connection, parsed)?;
        result.marshal(connection, reply)
    }
}

/// Box a closure as a shared callable.
pub fn callable<F, A, R>(handler: F) -> Arc<dyn ExposedCallable>
where
    F: Fn(&Connection, A) -> Result<R> + Send + Sync + 'static,
    A: Marshal + 'static,
    R: Marshal + 'static,
{
    Arc::new(TypedCallable::new(handler))
}
