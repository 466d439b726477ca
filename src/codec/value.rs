//! Built-in value types.
//!
//! | Type           | Wire form                      |
//! |----------------|--------------------------------|
//! | `()`           | nothing                        |
//! | `bool`         | one byte, 0 or 1               |
//! | `i32` / `i64`  | Big Endian                     |
//! | `String`       | UTF-8, NUL-terminated          |
//! | `TransverseId` | bytes, NUL-terminated          |
//! | serial ids     | varint                         |
//! | `Reference`    | ConnectionID varint + ObjectID |

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{marshal_by_value, ValueType};
use crate::error::{Result, RipleyError};
use crate::protocol::{
    decode_terminated, encode_terminated, BusId, ConnectionId, MessageId, ObjectId, Reference,
    RouteToken, TransverseId,
};

fn ensure(input: &Bytes, needed: usize, what: &str) -> Result<()> {
    if input.remaining() < needed {
        return Err(RipleyError::Decoding(format!(
            "truncated {what}: need {needed} bytes, have {}",
            input.remaining()
        )));
    }
    Ok(())
}

impl ValueType for () {
    fn serialize(&self, _out: &mut BytesMut) -> Result<()> {
        Ok(())
    }

    fn deserialize(_input: &mut Bytes) -> Result<Self> {
        Ok(())
    }
}

impl ValueType for bool {
    fn serialize(&self, out: &mut BytesMut) -> Result<()> {
        out.put_u8(u8::from(*self));
        Ok(())
    }

    fn deserialize(input: &mut Bytes) -> Result<Self> {
        ensure(input, 1, "Bool")?;
        match input.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(RipleyError::Decoding(format!("invalid Bool byte {other}"))),
        }
    }
}

impl ValueType for i32 {
    fn serialize(&self, out: &mut BytesMut) -> Result<()> {
        out.put_i32(*self);
        Ok(())
    }

    fn deserialize(input: &mut Bytes) -> Result<Self> {
        ensure(input, 4, "Int32")?;
        Ok(input.get_i32())
    }
}

impl ValueType for i64 {
    fn serialize(&self, out: &mut BytesMut) -> Result<()> {
        out.put_i64(*self);
        Ok(())
    }

    fn deserialize(input: &mut Bytes) -> Result<Self> {
        ensure(input, 8, "Int64")?;
        Ok(input.get_i64())
    }
}

impl ValueType for String {
    fn serialize(&self, out: &mut BytesMut) -> Result<()> {
        encode_terminated(self.as_bytes(), out)
    }

    fn deserialize(input: &mut Bytes) -> Result<Self> {
        let raw = decode_terminated(input);
        String::from_utf8(raw.to_vec())
            .map_err(|e| RipleyError::Decoding(format!("invalid UTF-8 string: {e}")))
    }
}

impl ValueType for TransverseId {
    fn serialize(&self, out: &mut BytesMut) -> Result<()> {
        self.encode(out)
    }

    fn deserialize(input: &mut Bytes) -> Result<Self> {
        TransverseId::decode(input)
    }
}

impl ValueType for Reference {
    fn serialize(&self, out: &mut BytesMut) -> Result<()> {
        self.encode(out);
        Ok(())
    }

    fn deserialize(input: &mut Bytes) -> Result<Self> {
        Reference::decode(input)
    }
}

macro_rules! serial_value {
    ($($ty:ty),*) => {
        $(
            impl ValueType for $ty {
                fn serialize(&self, out: &mut BytesMut) -> Result<()> {
                    self.encode(out);
                    Ok(())
                }

                fn deserialize(input: &mut Bytes) -> Result<Self> {
                    <$ty>::decode(input)
                }
            }
        )*
    };
}

serial_value!(ObjectId, ConnectionId, MessageId, BusId, RouteToken);

marshal_by_value!(
    (),
    bool,
    i32,
    i64,
    String,
    TransverseId,
    Reference,
    ObjectId,
    ConnectionId,
    MessageId,
    BusId,
    RouteToken,
);
