//! Standard transverse maps.
//!
//! - basic-error: constructors for the errors the substrate itself reports
//! - bus-client: liveness and identity of a bootstrapped client
//!
//! Applications expose their own error types with
//! [`transverse_error_constructor`].

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::codec::ValueType;
use crate::connection::Connection;
use crate::error::{Result, RipleyError, TransverseError};
use crate::object::{callable, ErrorConstructor, ReferenceKind, SharedObject, TransverseMap};
use crate::protocol::{BusId, ConnectionId, ObjectId, TransverseId};

pub const UNKNOWN_OBJECT_ID_ERROR: TransverseId =
    TransverseId::from_static("ripley.UnknownObjectIDError");
pub const REFERENCE_TYPE_MISMATCH_ERROR: TransverseId =
    TransverseId::from_static("ripley.ReferenceTypeMismatchError");
pub const ROUTE_NOT_FOUND_ERROR: TransverseId = TransverseId::from_static("ripley.RouteNotFound");
pub const UNKNOWN_TRANSVERSE_ID_ERROR: TransverseId =
    TransverseId::from_static("ripley.UnknownTransverseIDError");

pub const BUS_CLIENT_PING: TransverseId = TransverseId::from_static("ripley.BusClient.ping");
pub const BUS_CLIENT_BUS_ID: TransverseId = TransverseId::from_static("ripley.BusClient.busID");

/// Write the error constructor for a transverse error.
pub fn serialize_error(error: &RipleyError, out: &mut BytesMut) -> Result<()> {
    match error {
        RipleyError::UnknownObjectId(id) => {
            UNKNOWN_OBJECT_ID_ERROR.encode(out)?;
            id.encode(out);
        }
        RipleyError::ReferenceTypeMismatch { expected, found } => {
            REFERENCE_TYPE_MISMATCH_ERROR.encode(out)?;
            expected.serialize(out)?;
            found.serialize(out)?;
        }
        RipleyError::RouteNotFound(id) => {
            ROUTE_NOT_FOUND_ERROR.encode(out)?;
            id.encode(out);
        }
        RipleyError::UnknownTransverseId(id) => {
            UNKNOWN_TRANSVERSE_ID_ERROR.encode(out)?;
            id.encode(out)?;
        }
        RipleyError::Transverse(error) => {
            error.id.encode(out)?;
            error.message.serialize(out)?;
        }
        other => {
            return Err(RipleyError::Encoding(format!(
                "{other} cannot be sent to a peer"
            )))
        }
    }
    Ok(())
}

pub(crate) fn as_error_constructor(object: &SharedObject) -> Option<Arc<dyn ErrorConstructor>> {
    <Arc<dyn ErrorConstructor>>::from_local(object)
}

type ConstructFn = fn(&mut Bytes) -> Result<RipleyError>;

struct BasicErrorConstructor(ConstructFn);

impl ErrorConstructor for BasicErrorConstructor {
    fn construct(&self, _connection: &Connection, args: &mut Bytes) -> Result<RipleyError> {
        (self.0)(args)
    }
}

fn unknown_object_id(args: &mut Bytes) -> Result<RipleyError> {
    Ok(RipleyError::UnknownObjectId(ObjectId::decode(args)?))
}

fn reference_type_mismatch(args: &mut Bytes) -> Result<RipleyError> {
    let expected = String::deserialize(args)?;
    let found = String::deserialize(args)?;
    Ok(RipleyError::ReferenceTypeMismatch { expected, found })
}

fn route_not_found(args: &mut Bytes) -> Result<RipleyError> {
    Ok(RipleyError::RouteNotFound(ConnectionId::decode(args)?))
}

fn unknown_transverse_id(args: &mut Bytes) -> Result<RipleyError> {
    Ok(RipleyError::UnknownTransverseId(TransverseId::decode(args)?))
}

/// Constructors for the errors in [`serialize_error`] other than
/// application errors.
pub fn basic_error_map() -> TransverseMap {
    let entries: [(TransverseId, ConstructFn); 4] = [
        (UNKNOWN_OBJECT_ID_ERROR, unknown_object_id),
        (REFERENCE_TYPE_MISMATCH_ERROR, reference_type_mismatch),
        (ROUTE_NOT_FOUND_ERROR, route_not_found),
        (UNKNOWN_TRANSVERSE_ID_ERROR, unknown_transverse_id),
    ];
    entries
        .into_iter()
        .map(|(id, construct)| {
            (
                id,
                SharedObject::error_constructor(BasicErrorConstructor(construct)),
            )
        })
        .collect()
}

/// Rebuilds a [`TransverseError`] carrying its message.
struct MessageErrorConstructor {
    id: TransverseId,
}

impl ErrorConstructor for MessageErrorConstructor {
    fn construct(&self, _connection: &Connection, args: &mut Bytes) -> Result<RipleyError> {
        let message = String::deserialize(args)?;
        Ok(TransverseError::new(self.id.clone(), message).into())
    }
}

/// Error constructor for an application error named `id`. Expose it under
/// the same id so the peer's errors are rebuilt instead of reported as
/// unsupported.
pub fn transverse_error_constructor(id: TransverseId) -> SharedObject {
    SharedObject::error_constructor(MessageErrorConstructor { id })
}

/// Map a bootstrapped client exposes to its master.
pub fn bus_client_map(bus_id: BusId) -> TransverseMap {
    let mut map = TransverseMap::new();
    map.insert(
        BUS_CLIENT_PING,
        SharedObject::Callable(callable(|_c, (): ()| Ok(()))),
    );
    map.insert(
        BUS_CLIENT_BUS_ID,
        SharedObject::Callable(callable(move |_c, (): ()| Ok(bus_id))),
    );
    map
}
