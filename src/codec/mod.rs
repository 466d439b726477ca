//! Codec module - value and reference marshalling.
//!
//! Two contracts describe how a type crosses the wire:
//!
//! - [`ValueType`] - self-contained values that need nothing but the bytes
//!   (integers, strings, ids, [`MsgPack`] payloads)
//! - [`Marshal`] - the general contract, given the [`Connection`] the value
//!   travels on so references can be interned and resolved
//!
//! Every value type is also `Marshal`. Reference types (callables, filters,
//! error constructors, proxies) implement `Marshal` only.
//!
//! Tuples marshal their elements in index order, which gives the list
//! variants of the connection's serialize/deserialize operations.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use ripley::codec::ValueType;
//!
//! let mut out = BytesMut::new();
//! "hi".to_string().serialize(&mut out).unwrap();
//! 7i32.serialize(&mut out).unwrap();
//!
//! let mut input = out.freeze();
//! assert_eq!(String::deserialize(&mut input).unwrap(), "hi");
//! assert_eq!(i32::deserialize(&mut input).unwrap(), 7);
//! ```

mod msgpack;
mod value;

use bytes::{Bytes, BytesMut};

use crate::connection::Connection;
use crate::error::Result;

pub use msgpack::MsgPack;

/// Self-contained wire value.
pub trait ValueType: Sized {
    /// Append the wire form of `self`.
    fn serialize(&self, out: &mut BytesMut) -> Result<()>;

    /// Read and consume exactly one value from the front of `input`.
    fn deserialize(input: &mut Bytes) -> Result<Self>;
}

/// Value or reference marshalled in the context of a connection.
pub trait Marshal: Sized {
    fn marshal(&self, connection: &Connection, out: &mut BytesMut) -> Result<()>;

    fn unmarshal(connection: &Connection, input: &mut Bytes) -> Result<Self>;
}

/// Implement [`Marshal`] for value types by ignoring the connection.
macro_rules! marshal_by_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::codec::Marshal for $ty {
                fn marshal(
                    &self,
                    _connection: &$crate::connection::Connection,
                    out: &mut ::bytes::BytesMut,
                ) -> $crate::error::Result<()> {
                    $crate::codec::ValueType::serialize(self, out)
                }

                fn unmarshal(
                    _connection: &$crate::connection::Connection,
                    input: &mut ::bytes::Bytes,
                ) -> $crate::error::Result<Self> {
                    <$ty as $crate::codec::ValueType>::deserialize(input)
                }
            }
        )*
    };
}

pub(crate) use marshal_by_value;

macro_rules! marshal_tuple {
    ($($name:ident : $index:tt),+) => {
        impl<$($name: Marshal),+> Marshal for ($($name,)+) {
            fn marshal(&self, connection: &Connection, out: &mut BytesMut) -> Result<()> {
                $(self.$index.marshal(connection, out)?;)+
                Ok(())
            }

            fn unmarshal(connection: &Connection, input: &mut Bytes) -> Result<Self> {
                Ok(($($name::unmarshal(connection, input)?,)+))
            }
        }
    };
}

marshal_tuple!(A: 0);
marshal_tuple!(A: 0, B: 1);
marshal_tuple!(A: 0, B: 1, C: 2);
marshal_tuple!(A: 0, B: 1, C: 2, D: 3);
