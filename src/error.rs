//! Error types shared across the codec, ring, dispatcher and storage layers.

use thiserror::Error;

/// Failure decoding a field out of a [`crate::codec::MessageReader`].
///
/// Decode errors are never surfaced to a peer: handlers that hit one drop the
/// inbound message silently (spec: "on any decode error inside a handler,
/// the handler silently drops the message").
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("short read: wanted {want} more byte(s)")]
    ShortRead { want: usize },
    #[error("malformed field: {0}")]
    Malformed(String),
    #[error("invalid utf-8 in string field")]
    Utf8,
}

/// Response-code-bearing errors produced by the storage state machine and by
/// ring/dispatch plumbing that needs to answer a caller.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("not found")]
    NotFound,

    #[error("io error: {0}")]
    Io(String),

    #[error("dead target node")]
    DeadTargetNode,

    #[error("illegal request")]
    Illegal,

    #[error("redirect loop")]
    Loop,

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("msgpack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode error: {0}")]
    Msgpack(#[from] rmp_serde::decode::Error),
}

impl MeshError {
    /// Human-readable message for the `IoError` reply payload. Clients must
    /// not parse this string (spec §7): it is free-form.
    pub fn io_message(&self) -> String {
        match self {
            MeshError::Sled(e) => e.to_string(),
            MeshError::Encode(e) => e.to_string(),
            MeshError::Msgpack(e) => e.to_string(),
            MeshError::Loop => "Redirect Loop".to_string(),
            other => other.to_string(),
        }
    }
}
