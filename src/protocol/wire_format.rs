//! Wire format encoding and decoding.
//!
//! A frame is a header byte followed by header-specific fields:
//! ```text
//! HUP            0x00
//! RESOLVE        0x11 MessageID TransverseID
//! NOTIFY         0x12 Reference args...
//! EVAL           0x13 MessageID Reference args...
//! REPLY          0x16 MessageID result...
//! MESSAGE_ERROR  0x17 MessageID TransverseID args...
//! GENERAL_ERROR  0x18 TransverseID args...
//! FILTER_IN      0x1A Reference transcoded-frame...
//! FILTER_OUT     0x1B Reference Reference frame...
//! DEREF          0x1D Reference
//! ```
//!
//! Serial ids are base-128 varints, least significant group first. Strings
//! and transverse ids are NUL-terminated. Fixed-width integers are Big Endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, RipleyError};

/// Longest valid serial id encoding (ceil(64 / 7)).
pub const MAX_SERIAL_BYTES: usize = 10;

/// Size of the length prefix in front of every stream packet.
pub const PACKET_LENGTH_SIZE: usize = 4;

/// Default maximum packet size on stream transports (16 MiB).
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 16 * 1024 * 1024;

/// Prefix of both bootstrap handshake packets.
pub const BOOTSTRAP_MAGIC: &[u8; 8] = b"BOOTSTRP";

/// Frame header bytes.
pub mod headers {
    /// Peer hang-up.
    pub const HUP: u8 = 0x00;
    /// Request the reference exposed under a transverse id.
    pub const RESOLVE: u8 = 0x11;
    /// One-way call.
    pub const NOTIFY: u8 = 0x12;
    /// Call expecting a reply.
    pub const EVAL: u8 = 0x13;
    /// Successful result of RESOLVE or EVAL.
    pub const REPLY: u8 = 0x16;
    /// Failure of a request carrying a message id.
    pub const MESSAGE_ERROR: u8 = 0x17;
    /// Failure not tied to a message id.
    pub const GENERAL_ERROR: u8 = 0x18;
    /// Remainder of the frame is encoded by a filter.
    pub const FILTER_IN: u8 = 0x1A;
    /// Replies to the remainder must pass through a filter.
    pub const FILTER_OUT: u8 = 0x1B;
    /// Peer no longer needs a reference.
    pub const DEREF: u8 = 0x1D;
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Hup,
    Resolve,
    Notify,
    Eval,
    Reply,
    MessageError,
    GeneralError,
    FilterIn,
    FilterOut,
    Deref,
}

impl FrameKind {
    /// Map a header byte to its kind.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            headers::HUP => FrameKind::Hup,
            headers::RESOLVE => FrameKind::Resolve,
            headers::NOTIFY => FrameKind::Notify,
            headers::EVAL => FrameKind::Eval,
            headers::REPLY => FrameKind::Reply,
            headers::MESSAGE_ERROR => FrameKind::MessageError,
            headers::GENERAL_ERROR => FrameKind::GeneralError,
            headers::FILTER_IN => FrameKind::FilterIn,
            headers::FILTER_OUT => FrameKind::FilterOut,
            headers::DEREF => FrameKind::Deref,
            _ => return None,
        })
    }

    /// Header byte written on the wire.
    pub fn header_byte(self) -> u8 {
        match self {
            FrameKind::Hup => headers::HUP,
            FrameKind::Resolve => headers::RESOLVE,
            FrameKind::Notify => headers::NOTIFY,
            FrameKind::Eval => headers::EVAL,
            FrameKind::Reply => headers::REPLY,
            FrameKind::MessageError => headers::MESSAGE_ERROR,
            FrameKind::GeneralError => headers::GENERAL_ERROR,
            FrameKind::FilterIn => headers::FILTER_IN,
            FrameKind::FilterOut => headers::FILTER_OUT,
            FrameKind::Deref => headers::DEREF,
        }
    }

    /// Read and consume the header byte at the front of `input`.
    pub fn decode(input: &mut Bytes) -> Result<Self> {
        if !input.has_remaining() {
            return Err(RipleyError::decoding("empty frame"));
        }
        let byte = input.get_u8();
        Self::try_from(byte)
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = RipleyError;

    fn try_from(byte: u8) -> Result<Self> {
        Self::from_byte(byte)
            .ok_or_else(|| RipleyError::Decoding(format!("unknown frame header 0x{byte:02x}")))
    }
}

/// Append a serial id as a varint.
///
/// # Example
///
/// ```
/// use bytes::BytesMut;
/// use ripley::protocol::encode_serial;
///
/// let mut out = BytesMut::new();
/// encode_serial(300, &mut out);
/// assert_eq!(&out[..], &[0xAC, 0x02]);
/// ```
pub fn encode_serial(mut value: u64, out: &mut BytesMut) {
    loop {
        let group = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.put_u8(group);
            return;
        }
        out.put_u8(group | 0x80);
    }
}

/// Number of bytes [`encode_serial`] writes for `value`.
pub fn serial_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Read and consume a varint serial id.
pub fn decode_serial(input: &mut Bytes) -> Result<u64> {
    let mut value: u64 = 0;
    for index in 0..MAX_SERIAL_BYTES {
        if !input.has_remaining() {
            return Err(RipleyError::decoding("truncated serial id"));
        }
        let byte = input.get_u8();
        let group = u64::from(byte & 0x7F);
        let shift = 7 * index as u32;
        if shift == 63 && group > 1 {
            return Err(RipleyError::decoding("serial id overflows 64 bits"));
        }
        value |= group << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(RipleyError::decoding("serial id longer than 10 bytes"))
}

/// Append NUL-terminated bytes.
pub fn encode_terminated(bytes: &[u8], out: &mut BytesMut) -> Result<()> {
    if bytes.contains(&0) {
        return Err(RipleyError::Encoding(
            "terminated value contains a NUL byte".to_string(),
        ));
    }
    out.reserve(bytes.len() + 1);
    out.put_slice(bytes);
    out.put_u8(0);
    Ok(())
}

/// Read and consume bytes up to a NUL terminator.
///
/// End of input also terminates the value.
pub fn decode_terminated(input: &mut Bytes) -> Bytes {
    match input.iter().position(|&b| b == 0) {
        Some(end) => {
            let value = input.split_to(end);
            input.advance(1);
            value
        }
        None => input.split_to(input.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(value: u64) -> Vec<u8> {
        let mut out = BytesMut::new();
        encode_serial(value, &mut out);
        out.to_vec()
    }

    #[test]
    fn test_serial_known_encodings() {
        assert_eq!(encoded(0), vec![0x00]);
        assert_eq!(encoded(1), vec![0x01]);
        assert_eq!(encoded(127), vec![0x7F]);
        assert_eq!(encoded(128), vec![0x80, 0x01]);
        assert_eq!(encoded(300), vec![0xAC, 0x02]);
        assert_eq!(encoded(u64::MAX).len(), MAX_SERIAL_BYTES);
    }

    #[test]
    fn test_serial_len_matches_encoding() {
        for value in [0, 1, 127, 128, 16_383, 16_384, 1 << 35, u64::MAX] {
            assert_eq!(serial_len(value), encoded(value).len(), "value {value}");
        }
    }

    #[test]
    fn test_serial_decode_consumes_exactly() {
        let mut input = Bytes::from_static(&[0xAC, 0x02, 0x07]);
        assert_eq!(decode_serial(&mut input).unwrap(), 300);
        assert_eq!(&input[..], &[0x07]);
        assert_eq!(decode_serial(&mut input).unwrap(), 7);
        assert!(input.is_empty());
    }

    #[test]
    fn test_serial_max_value() {
        let mut input = Bytes::from(encoded(u64::MAX));
        assert_eq!(decode_serial(&mut input).unwrap(), u64::MAX);
    }

    #[test]
    fn test_serial_truncated() {
        let mut input = Bytes::from_static(&[0x80, 0x80]);
        assert!(matches!(
            decode_serial(&mut input),
            Err(RipleyError::Decoding(_))
        ));
    }

    #[test]
    fn test_serial_overflow() {
        let mut input = Bytes::from_static(&[0xFF; 11]);
        assert!(decode_serial(&mut input).is_err());

        let mut input =
            Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x02]);
        assert!(decode_serial(&mut input).is_err());
    }

    #[test]
    fn test_frame_kind_bytes() {
        assert_eq!(FrameKind::from_byte(0x13), Some(FrameKind::Eval));
        assert_eq!(FrameKind::Reply.header_byte(), headers::REPLY);
        assert_eq!(FrameKind::from_byte(0x14), None);
        assert!(FrameKind::try_from(0xFF).is_err());

        let mut input = Bytes::new();
        assert!(FrameKind::decode(&mut input).is_err());
    }

    #[test]
    fn test_terminated_values() {
        let mut out = BytesMut::new();
        encode_terminated(b"echo", &mut out).unwrap();
        encode_terminated(b"", &mut out).unwrap();
        assert_eq!(&out[..], b"echo\0\0");

        let mut input = out.freeze();
        assert_eq!(&decode_terminated(&mut input)[..], b"echo");
        assert_eq!(&decode_terminated(&mut input)[..], b"");
        assert!(input.is_empty());
    }

    #[test]
    fn test_terminated_at_end_of_input() {
        let mut input = Bytes::from_static(b"tail");
        assert_eq!(&decode_terminated(&mut input)[..], b"tail");
        assert!(input.is_empty());
    }

    #[test]
    fn test_terminated_rejects_interior_nul() {
        let mut out = BytesMut::new();
        assert!(encode_terminated(b"a\0b", &mut out).is_err());
        assert!(out.is_empty());
    }
}
