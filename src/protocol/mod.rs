//! Protocol module - wire format, identifiers and packet framing.
//!
//! This module implements the binary protocol shared by every transport:
//! - Frame header bytes and their kinds
//! - Varint serial ids, references and transverse ids
//! - Length-prefixed packet reassembly for stream transports

mod ids;
mod packet_buffer;
mod wire_format;

pub use ids::{BusId, ConnectionId, MessageId, ObjectId, Reference, RouteToken, TransverseId};
pub use packet_buffer::{frame_packet, PacketBuffer};
pub use wire_format::{
    decode_serial, decode_terminated, encode_serial, encode_terminated, headers, serial_len,
    FrameKind, BOOTSTRAP_MAGIC, DEFAULT_MAX_PACKET_SIZE, MAX_SERIAL_BYTES, PACKET_LENGTH_SIZE,
};
