//! Error types for the ripley substrate.
//!
//! The variants split into two families. Transverse errors
//! ([`RipleyError::is_transverse`]) describe a fault the remote caller caused
//! and are serialized back to it as a MESSAGE_ERROR. Everything else is a
//! local fault handled by the bus.

use thiserror::Error;

use crate::protocol::{BusId, ConnectionId, MessageId, ObjectId, Reference, TransverseId};

/// Application-level error that can cross the wire.
///
/// Carried by [`RipleyError::Transverse`]. The `id` names the error
/// constructor that rebuilds it on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{id}: {message}")]
pub struct TransverseError {
    pub id: TransverseId,
    pub message: String,
}

impl TransverseError {
    pub fn new(id: TransverseId, message: impl Into<String>) -> Self {
        Self {
            id,
            message: message.into(),
        }
    }
}

/// Main error type for ripley operations.
#[derive(Debug, Error)]
pub enum RipleyError {
    /// I/O error from a stream transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (configuration loading).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Malformed or truncated input.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// A value could not be written in its wire form.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Local reference to an object id that was never issued.
    #[error("unknown object id {0}")]
    UnknownObjectId(ObjectId),

    /// The referenced object is not of the requested type.
    #[error("reference type mismatch: expected {expected}, found {found}")]
    ReferenceTypeMismatch { expected: String, found: String },

    /// No proxy route is registered toward the connection.
    #[error("no route to connection {0}")]
    RouteNotFound(ConnectionId),

    /// No transverse map exposes the id.
    #[error("unknown transverse id {0}")]
    UnknownTransverseId(TransverseId),

    /// Reply for a message that is not pending on this route.
    #[error("unknown message id {0}")]
    UnknownMessageId(MessageId),

    /// No reply arrived before the correlation queue rotated out.
    #[error("call timed out")]
    Timeout,

    /// Application error reconstructed from the wire.
    #[error("remote error: {0}")]
    Transverse(#[from] TransverseError),

    /// A MESSAGE_ERROR named an error constructor this side cannot resolve.
    #[error("unsupported error constructor {0}")]
    Unsupported(TransverseId),

    /// The route has no destination or its transport is gone.
    #[error("route closed")]
    RouteClosed,

    /// Synchronous evaluation of an object that lives on another connection.
    #[error("object {0} is not local")]
    NotLocal(Reference),

    /// The transport's writer or peer has gone away.
    #[error("connection closed")]
    ConnectionClosed,

    /// The transport's outbound queue is full.
    #[error("outbound queue full")]
    Backpressure,

    /// A single-peer bus was asked for a bus other than its peer.
    #[error("bus {requested} is not reachable, sole peer is {expected}")]
    PeerMismatch { expected: BusId, requested: BusId },

    /// The bus has not completed its bootstrap handshake.
    #[error("bus not bootstrapped")]
    NotBootstrapped,

    /// The bus already has its peer.
    #[error("bus already bootstrapped")]
    AlreadyBootstrapped,

    /// No listening endpoint is known for the bus.
    #[error("unknown bus {0}")]
    UnknownBus(BusId),

    /// No connector is registered for the address scheme.
    #[error("unsupported address scheme: {0}")]
    UnsupportedScheme(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for ripley operations.
pub type Result<T> = std::result::Result<T, RipleyError>;

impl RipleyError {
    /// Shorthand for a [`RipleyError::Decoding`] error.
    pub fn decoding(msg: impl Into<String>) -> Self {
        RipleyError::Decoding(msg.into())
    }

    /// Whether this error is reported back to the remote caller.
    pub fn is_transverse(&self) -> bool {
        matches!(
            self,
            RipleyError::UnknownObjectId(_)
                | RipleyError::ReferenceTypeMismatch { .. }
                | RipleyError::RouteNotFound(_)
                | RipleyError::UnknownTransverseId(_)
                | RipleyError::Transverse(_)
        )
    }
}
