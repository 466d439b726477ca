//! Shared objects and the traits they expose.
//!
//! A [`SharedObject`] is anything a connection can hand out a [`Reference`]
//! for. Its variant is the type descriptor checked when a reference is turned
//! back into an object ([`ReferenceKind`]).

mod callable;
mod proxy;
mod table;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::codec::Marshal;
use crate::connection::Connection;
use crate::error::{Result, RipleyError};
use crate::protocol::{Reference, TransverseId};

pub use callable::{callable, TypedCallable};
pub use proxy::ObjectProxy;
pub(crate) use table::ObjectTable;

/// Object that can be invoked with NOTIFY and EVAL frames.
pub trait ExposedCallable: Send + Sync {
    /// One-way call. `args` holds the remainder of the frame.
    fn notify(&self, connection: &Connection, args: &mut Bytes) -> Result<()>;

    /// Call whose result is appended to `reply` after the REPLY header.
    fn evaluate(&self, connection: &Connection, args: &mut Bytes, reply: &mut BytesMut)
        -> Result<()>;

    /// The proxy behind this callable, if it stands for a remote object.
    fn as_proxy(&self) -> Option<&ObjectProxy> {
        None
    }
}

/// Byte transcoder used by FILTER_IN and FILTER_OUT frames.
pub trait FilterElement: Send + Sync {
    fn transcode(&self, input: &[u8], output: &mut BytesMut) -> Result<()>;
}

/// Rebuilds an error from the arguments of an error constructor.
pub trait ErrorConstructor: Send + Sync {
    fn construct(&self, connection: &Connection, args: &mut Bytes) -> Result<RipleyError>;
}

/// Filter that copies bytes unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityFilter;

impl FilterElement for IdentityFilter {
    fn transcode(&self, input: &[u8], output: &mut BytesMut) -> Result<()> {
        output.extend_from_slice(input);
        Ok(())
    }
}

/// Object registered in, or resolved through, a connection.
#[derive(Clone)]
pub enum SharedObject {
    Callable(Arc<dyn ExposedCallable>),
    Filter(Arc<dyn FilterElement>),
    ErrorConstructor(Arc<dyn ErrorConstructor>),
    Opaque(Arc<dyn Any + Send + Sync>),
    Proxy(ObjectProxy),
}

impl SharedObject {
    pub fn callable(callable: impl ExposedCallable + 'static) -> Self {
        SharedObject::Callable(Arc::new(callable))
    }

    pub fn filter(filter: impl FilterElement + 'static) -> Self {
        SharedObject::Filter(Arc::new(filter))
    }

    pub fn error_constructor(constructor: impl ErrorConstructor + 'static) -> Self {
        SharedObject::ErrorConstructor(Arc::new(constructor))
    }

    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        SharedObject::Opaque(Arc::new(value))
    }

    /// Name of the variant, used in type mismatch errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            SharedObject::Callable(_) => "callable",
            SharedObject::Filter(_) => "filter",
            SharedObject::ErrorConstructor(_) => "error constructor",
            SharedObject::Opaque(_) => "opaque",
            SharedObject::Proxy(_) => "proxy",
        }
    }

    /// The proxy this object stands for, if it is remote.
    pub fn as_proxy(&self) -> Option<&ObjectProxy> {
        match self {
            SharedObject::Proxy(proxy) => Some(proxy),
            SharedObject::Callable(callable) => callable.as_proxy(),
            _ => None,
        }
    }

    /// Downcast an opaque object.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            SharedObject::Opaque(value) => Arc::clone(value).downcast::<T>().ok(),
            _ => None,
        }
    }

    /// Address of the shared allocation. Proxies have none.
    pub(crate) fn identity(&self) -> Option<usize> {
        let ptr = match self {
            SharedObject::Callable(c) => Arc::as_ptr(c) as *const (),
            SharedObject::Filter(f) => Arc::as_ptr(f) as *const (),
            SharedObject::ErrorConstructor(e) => Arc::as_ptr(e) as *const (),
            SharedObject::Opaque(o) => Arc::as_ptr(o) as *const (),
            SharedObject::Proxy(_) => return None,
        };
        Some(ptr as usize)
    }
}

impl fmt::Debug for SharedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_proxy() {
            Some(proxy) => write!(f, "SharedObject::Proxy({})", proxy.reference()),
            None => write!(f, "SharedObject::{}", self.kind_name()),
        }
    }
}

impl From<Arc<dyn ExposedCallable>> for SharedObject {
    fn from(callable: Arc<dyn ExposedCallable>) -> Self {
        SharedObject::Callable(callable)
    }
}

impl From<Arc<dyn FilterElement>> for SharedObject {
    fn from(filter: Arc<dyn FilterElement>) -> Self {
        SharedObject::Filter(filter)
    }
}

impl From<Arc<dyn ErrorConstructor>> for SharedObject {
    fn from(constructor: Arc<dyn ErrorConstructor>) -> Self {
        SharedObject::ErrorConstructor(constructor)
    }
}

impl From<ObjectProxy> for SharedObject {
    fn from(proxy: ObjectProxy) -> Self {
        SharedObject::Proxy(proxy)
    }
}

/// Type a reference can be resolved into.
pub trait ReferenceKind: Sized {
    const TYPE_NAME: &'static str;

    /// Accept a locally stored object, or `None` on a type mismatch.
    fn from_local(object: &SharedObject) -> Option<Self>;

    /// Build the stand-in for an object owned by another connection.
    fn from_proxy(proxy: ObjectProxy) -> Result<Self>;
}

fn proxy_mismatch(expected: &str) -> RipleyError {
    RipleyError::ReferenceTypeMismatch {
        expected: expected.to_string(),
        found: "proxy".to_string(),
    }
}

impl ReferenceKind for Arc<dyn ExposedCallable> {
    const TYPE_NAME: &'static str = "callable";

    fn from_local(object: &SharedObject) -> Option<Self> {
        match object {
            SharedObject::Callable(callable) => Some(Arc::clone(callable)),
            SharedObject::Proxy(proxy) => Some(Arc::new(proxy.clone())),
            _ => None,
        }
    }

    fn from_proxy(proxy: ObjectProxy) -> Result<Self> {
        Ok(Arc::new(proxy))
    }
}

impl ReferenceKind for Arc<dyn FilterElement> {
    const TYPE_NAME: &'static str = "filter";

    fn from_local(object: &SharedObject) -> Option<Self> {
        match object {
            SharedObject::Filter(filter) => Some(Arc::clone(filter)),
            _ => None,
        }
    }

    fn from_proxy(_proxy: ObjectProxy) -> Result<Self> {
        Err(proxy_mismatch(Self::TYPE_NAME))
    }
}

impl ReferenceKind for Arc<dyn ErrorConstructor> {
    const TYPE_NAME: &'static str = "error constructor";

    fn from_local(object: &SharedObject) -> Option<Self> {
        match object {
            SharedObject::ErrorConstructor(constructor) => Some(Arc::clone(constructor)),
            _ => None,
        }
    }

    fn from_proxy(_proxy: ObjectProxy) -> Result<Self> {
        Err(proxy_mismatch(Self::TYPE_NAME))
    }
}

impl ReferenceKind for ObjectProxy {
    const TYPE_NAME: &'static str = "proxy";

    fn from_local(object: &SharedObject) -> Option<Self> {
        object.as_proxy().cloned()
    }

    fn from_proxy(proxy: ObjectProxy) -> Result<Self> {
        Ok(proxy)
    }
}

impl ReferenceKind for SharedObject {
    const TYPE_NAME: &'static str = "object";

    fn from_local(object: &SharedObject) -> Option<Self> {
        Some(object.clone())
    }

    fn from_proxy(proxy: ObjectProxy) -> Result<Self> {
        Ok(SharedObject::Proxy(proxy))
    }
}

macro_rules! marshal_by_reference {
    ($($ty:ty),*) => {
        $(
            impl Marshal for $ty {
                fn marshal(&self, connection: &Connection, out: &mut BytesMut) -> Result<()> {
                    let object = SharedObject::from(self.clone());
                    connection.object_to_reference(&object).encode(out);
                    Ok(())
                }

                fn unmarshal(connection: &Connection, input: &mut Bytes) -> Result<Self> {
                    let reference = Reference::decode(input)?;
                    connection.reference_to_object::<Self>(reference)
                }
            }
        )*
    };
}

marshal_by_reference!(
    Arc<dyn ExposedCallable>,
    Arc<dyn FilterElement>,
    Arc<dyn ErrorConstructor>,
    ObjectProxy,
    SharedObject
);

/// Transverse ids and the objects exposed under them.
pub type TransverseMap = HashMap<TransverseId, SharedObject>;

/// Named bundle of transverse exposures, offered on a connection at once.
///
/// # Example
///
/// ```
/// use ripley::object::{callable, ServiceImplementation};
/// use ripley::protocol::TransverseId;
///
/// let service = ServiceImplementation::new("demo").expose(
///     TransverseId::from_static("demo.echo"),
///     callable(|_conn, (text,): (String,)| Ok(text)),
/// );
/// assert_eq!(service.name(), "demo");
/// assert_eq!(service.into_map().len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ServiceImplementation {
    name: String,
    exposures: TransverseMap,
}

impl ServiceImplementation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exposures: TransverseMap::new(),
        }
    }

    /// Expose `object` under `id`. A later exposure of the same id replaces
    /// the earlier one.
    pub fn expose(mut self, id: TransverseId, object: impl Into<SharedObject>) -> Self {
        self.exposures.insert(id, object.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_map(self) -> TransverseMap {
        self.exposures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_follows_allocation() {
        let filter: Arc<dyn FilterElement> = Arc::new(IdentityFilter);
        let a = SharedObject::Filter(Arc::clone(&filter));
        let b = SharedObject::Filter(filter);
        let c = SharedObject::filter(IdentityFilter);

        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity(), c.identity());
    }

    #[test]
    fn test_kind_checks() {
        let filter = SharedObject::filter(IdentityFilter);
        assert!(<Arc<dyn FilterElement>>::from_local(&filter).is_some());
        assert!(<Arc<dyn ExposedCallable>>::from_local(&filter).is_none());
        assert!(SharedObject::from_local(&filter).is_some());
        assert_eq!(filter.kind_name(), "filter");
    }

    #[test]
    fn test_opaque_downcast() {
        let object = SharedObject::opaque(42u32);
        assert_eq!(object.downcast::<u32>().as_deref(), Some(&42));
        assert!(object.downcast::<String>().is_none());
        assert!(SharedObject::filter(IdentityFilter).downcast::<u32>().is_none());
    }

    #[test]
    fn test_identity_filter() {
        let mut out = BytesMut::new();
        IdentityFilter.transcode(b"abc", &mut out).unwrap();
        assert_eq!(&out[..], b"abc");
    }
}
