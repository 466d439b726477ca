//! Reassembly of length-prefixed packets from a byte stream.
//!
//! Reads from a stream split packets arbitrarily. [`PacketBuffer`] keeps the
//! unconsumed bytes and alternates between two phases: reading the 4-byte
//! Big Endian length prefix, then waiting until that many bytes are
//! buffered.
//!
//! # Example
//!
//! ```
//! use ripley::protocol::PacketBuffer;
//!
//! let mut buffer = PacketBuffer::new();
//!
//! let packets = buffer.push(&[0, 0, 0, 2, 0x01]).unwrap();
//! assert!(packets.is_empty());
//!
//! let packets = buffer.push(&[0x13]).unwrap();
//! assert_eq!(&packets[0][..], &[0x01, 0x13]);
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::wire_format::{DEFAULT_MAX_PACKET_SIZE, PACKET_LENGTH_SIZE};
use crate::error::{Result, RipleyError};

const INITIAL_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prefix,
    Body(usize),
}

pub struct PacketBuffer {
    pending: BytesMut,
    phase: Phase,
    max_packet_size: u32,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::with_max_packet(DEFAULT_MAX_PACKET_SIZE)
    }

    /// Buffer rejecting packets longer than `max_packet_size`.
    pub fn with_max_packet(max_packet_size: u32) -> Self {
        Self {
            pending: BytesMut::with_capacity(INITIAL_CAPACITY),
            phase: Phase::Prefix,
            max_packet_size,
        }
    }

    /// Append `data` and return every packet it completed, in order.
    ///
    /// Fails with a decoding error when a prefix announces a packet over the
    /// size limit; the stream cannot be resynchronized after that.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.pending.extend_from_slice(data);
        let mut packets = Vec::new();
        loop {
            match self.phase {
                Phase::Prefix => {
                    if self.pending.len() < PACKET_LENGTH_SIZE {
                        break;
                    }
                    let length = self.pending.get_u32();
                    if length > self.max_packet_size {
                        return Err(RipleyError::Decoding(format!(
                            "packet size {} exceeds maximum {}",
                            length, self.max_packet_size
                        )));
                    }
                    self.phase = Phase::Body(length as usize);
                }
                Phase::Body(length) => {
                    if self.pending.len() < length {
                        break;
                    }
                    packets.push(self.pending.split_to(length).freeze());
                    self.phase = Phase::Prefix;
                }
            }
        }
        Ok(packets)
    }

    /// Bytes buffered toward the next packet, excluding a consumed prefix.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop buffered bytes and expect a length prefix next.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.phase = Phase::Prefix;
    }
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Prepend the length prefix to a packet.
pub fn frame_packet(packet: &[u8]) -> Result<Bytes> {
    let length = u32::try_from(packet.len())
        .map_err(|_| RipleyError::Encoding(format!("packet of {} bytes", packet.len())))?;
    let mut out = BytesMut::with_capacity(PACKET_LENGTH_SIZE + packet.len());
    out.put_u32(length);
    out.put_slice(packet);
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(payload: &[u8]) -> Vec<u8> {
        frame_packet(payload).unwrap().to_vec()
    }

    #[test]
    fn test_packets_in_one_read() {
        let mut buffer = PacketBuffer::new();
        let mut stream = framed(b"\x01\x13hello");
        stream.extend_from_slice(&framed(b"second"));
        stream.extend_from_slice(&framed(b""));

        let packets = buffer.push(&stream).unwrap();
        assert_eq!(packets.len(), 3);
        assert_eq!(&packets[0][..], b"\x01\x13hello");
        assert_eq!(&packets[1][..], b"second");
        assert!(packets[2].is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_split_inside_prefix() {
        let mut buffer = PacketBuffer::new();
        let bytes = framed(b"test");

        assert!(buffer.push(&bytes[..2]).unwrap().is_empty());
        assert_eq!(buffer.phase, Phase::Prefix);

        let packets = buffer.push(&bytes[2..]).unwrap();
        assert_eq!(&packets[0][..], b"test");
    }

    #[test]
    fn test_split_inside_body() {
        let mut buffer = PacketBuffer::new();
        let payload = b"a packet that arrives in two reads";
        let bytes = framed(payload);

        let split = PACKET_LENGTH_SIZE + 10;
        assert!(buffer.push(&bytes[..split]).unwrap().is_empty());
        assert_eq!(buffer.phase, Phase::Body(payload.len()));
        assert_eq!(buffer.len(), 10);

        let packets = buffer.push(&bytes[split..]).unwrap();
        assert_eq!(&packets[0][..], payload);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = PacketBuffer::new();
        let mut packets = Vec::new();
        for byte in framed(b"drip") {
            packets.extend(buffer.push(&[byte]).unwrap());
        }
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0][..], b"drip");
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let mut buffer = PacketBuffer::with_max_packet(100);
        assert!(matches!(
            buffer.push(&1000u32.to_be_bytes()),
            Err(RipleyError::Decoding(_))
        ));
    }

    #[test]
    fn test_clear() {
        let mut buffer = PacketBuffer::new();
        buffer.push(&framed(b"test")[..PACKET_LENGTH_SIZE + 1]).unwrap();
        buffer.clear();
        assert_eq!(buffer.phase, Phase::Prefix);
        assert!(buffer.is_empty());
    }
}
