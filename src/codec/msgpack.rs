//! MessagePack value type using `rmp-serde`.
//!
//! Wraps any serde type so it can be passed as a call argument or result.
//! MessagePack is self-delimiting, so a `MsgPack<T>` consumes exactly one
//! encoded value and leaves the rest of the frame for the next argument.
//!
//! Structs are written with `to_vec_named` (struct-as-map) so peers in other
//! languages can read them by field name.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use ripley::codec::{MsgPack, ValueType};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Point {
//!     x: i32,
//!     y: i32,
//! }
//!
//! let mut out = BytesMut::new();
//! MsgPack(Point { x: 1, y: 2 }).serialize(&mut out).unwrap();
//!
//! let mut input = out.freeze();
//! let MsgPack(point) = MsgPack::<Point>::deserialize(&mut input).unwrap();
//! assert_eq!(point, Point { x: 1, y: 2 });
//! ```

use bytes::{Buf, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Marshal, ValueType};
use crate::connection::Connection;
use crate::error::Result;

/// Serde value carried as MessagePack.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MsgPack<T>(pub T);

impl<T> MsgPack<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: Serialize + DeserializeOwned> ValueType for MsgPack<T> {
    fn serialize(&self, out: &mut BytesMut) -> Result<()> {
        let encoded = rmp_serde::to_vec_named(&self.0)?;
        out.extend_from_slice(&encoded);
        Ok(())
    }

    fn deserialize(input: &mut Bytes) -> Result<Self> {
        let mut cursor: &[u8] = &input[..];
        let value = rmp_serde::from_read(&mut cursor)?;
        let consumed = input.len() - cursor.len();
        input.advance(consumed);
        Ok(MsgPack(value))
    }
}

impl<T: Serialize + DeserializeOwned> Marshal for MsgPack<T> {
    fn marshal(&self, _connection: &Connection, out: &mut BytesMut) -> Result<()> {
        ValueType::serialize(self, out)
    }

    fn unmarshal(_connection: &Connection, input: &mut Bytes) -> Result<Self> {
        <Self as ValueType>::deserialize(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Job {
        id: u32,
        name: String,
        tags: Vec<String>,
    }

    #[test]
    fn test_struct_as_map() {
        let mut out = BytesMut::new();
        MsgPack(Job {
            id: 1,
            name: "a".into(),
            tags: vec![],
        })
        .serialize(&mut out)
        .unwrap();

        // fixmap with 3 entries
        assert_eq!(out[0], 0x83);
    }

    #[test]
    fn test_consumes_one_value() {
        let mut out = BytesMut::new();
        MsgPack(vec![1u8, 2, 3]).serialize(&mut out).unwrap();
        MsgPack("next".to_string()).serialize(&mut out).unwrap();

        let mut input = out.freeze();
        let first = MsgPack::<Vec<u8>>::deserialize(&mut input).unwrap();
        assert_eq!(first.into_inner(), vec![1, 2, 3]);
        let second = MsgPack::<String>::deserialize(&mut input).unwrap();
        assert_eq!(second.0, "next");
        assert!(input.is_empty());
    }

    #[test]
    fn test_map_value() {
        let mut map = HashMap::new();
        map.insert("k".to_string(), 9i64);

        let mut out = BytesMut::new();
        MsgPack(map.clone()).serialize(&mut out).unwrap();
        let mut input = out.freeze();
        let decoded = MsgPack::<HashMap<String, i64>>::deserialize(&mut input).unwrap();
        assert_eq!(decoded.0, map);
    }

    #[test]
    fn test_truncated_input() {
        let mut out = BytesMut::new();
        MsgPack("a longer string".to_string()).serialize(&mut out).unwrap();
        let mut input = out.freeze().slice(..4);
        assert!(MsgPack::<String>::deserialize(&mut input).is_err());
    }
}
