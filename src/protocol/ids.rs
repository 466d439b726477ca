//! Identifier types carried in frames.

use std::fmt;

use bytes::{Bytes, BytesMut};

use super::wire_format::{decode_serial, decode_terminated, encode_serial, encode_terminated};
use crate::error::{Result, RipleyError};

macro_rules! serial_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> u64 {
                self.0
            }

            /// Append the varint form.
            pub fn encode(self, out: &mut BytesMut) {
                encode_serial(self.0, out);
            }

            /// Read and consume the varint form.
            pub fn decode(input: &mut Bytes) -> Result<Self> {
                decode_serial(input).map(Self)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

serial_id!(
    /// Index of an object in its connection's object table.
    ObjectId
);
serial_id!(
    /// Identity of a connection, issued by the bus master.
    ConnectionId
);
serial_id!(
    /// Correlation id of a pending request.
    MessageId
);
serial_id!(
    /// Identity of a bus.
    BusId
);
serial_id!(
    /// Per-transport route address; also the shiboleth a peer writes in
    /// front of every packet sent to the route.
    RouteToken
);

impl From<ConnectionId> for BusId {
    fn from(id: ConnectionId) -> Self {
        BusId(id.get())
    }
}

/// Location-independent handle to an object: the owning connection plus the
/// object's index in that connection's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reference {
    pub connection: ConnectionId,
    pub object: ObjectId,
}

impl Reference {
    pub const fn new(connection: ConnectionId, object: ObjectId) -> Self {
        Self { connection, object }
    }

    pub fn encode(self, out: &mut BytesMut) {
        self.connection.encode(out);
        self.object.encode(out);
    }

    pub fn decode(input: &mut Bytes) -> Result<Self> {
        let connection = ConnectionId::decode(input)?;
        let object = ObjectId::decode(input)?;
        Ok(Self { connection, object })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connection, self.object)
    }
}

/// Well-known name under which a connection exposes an object.
///
/// Arbitrary bytes without NUL; written NUL-terminated.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransverseId(Bytes);

impl TransverseId {
    /// Build a transverse id, rejecting interior NUL bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.contains(&0) {
            return Err(RipleyError::Encoding(
                "transverse id contains a NUL byte".to_string(),
            ));
        }
        Ok(Self(bytes))
    }

    /// Build a transverse id from a literal.
    pub const fn from_static(name: &'static str) -> Self {
        Self(Bytes::from_static(name.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn encode(&self, out: &mut BytesMut) -> Result<()> {
        encode_terminated(&self.0, out)
    }

    pub fn decode(input: &mut Bytes) -> Result<Self> {
        Ok(Self(decode_terminated(input)))
    }
}

impl fmt::Display for TransverseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for TransverseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransverseId({:?})", String::from_utf8_lossy(&self.0))
    }
}
