// Copyright (c) TinyMQ contributors.
// Licensed under the MIT License.

//! Error types shared across the client.

use thiserror::Error;

/// Error type returned by fallible [`crate`] operations. The category of
/// failure is carried by [`TinyMqErrorKind`].
#[derive(Debug, Error)]
#[error(transparent)]
pub struct TinyMqError(pub(crate) TinyMqErrorKind);

impl TinyMqError {
    /// Returns the kind of error that occurred.
    #[must_use]
    pub fn kind(&self) -> &TinyMqErrorKind {
        &self.0
    }
}

/// Error kind for [`TinyMqError`].
#[derive(Debug, Error)]
pub enum TinyMqErrorKind {
    /// The underlying TCP connection is not open, or was lost mid-operation.
    #[error("not connected to broker")]
    NotConnected,
    /// A transport-level I/O failure occurred on the broker connection.
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The broker did not send `CONNACK` within the connect timeout.
    #[error("timed out waiting for broker CONNACK")]
    ConnectTimeout,
    /// A correlated request did not receive its expected response in time.
    #[error("timed out waiting for {0:?} response")]
    RequestTimeout(crate::codec::PacketType),
    /// A correlated request's waiter slot was replaced by a newer request of
    /// the same expected type before a response arrived.
    #[error("correlation waiter for {0:?} was replaced by a newer request")]
    Replaced(crate::codec::PacketType),
    /// The connection was lost while a correlated request was outstanding.
    #[error("connection lost while awaiting {0:?} response")]
    ConnectionLost(crate::codec::PacketType),
    /// A value exceeded a wire-format limit (e.g. a topic longer than 255 bytes).
    #[error("{0}")]
    Encoding(String),
    /// The broker rejected an operation with a named validation error.
    #[error("{code}: {message}")]
    Validation {
        /// Machine-readable error code as sent by the broker (e.g. `ALREADY_HAS_ADMIN`).
        code: String,
        /// Human-readable message accompanying the code.
        message: String,
    },
    /// The local store failed to complete an operation.
    #[error("local store error: {0}")]
    Store(#[from] rusqlite::Error),
    /// The serial device is not open, or the requested operation requires it to be.
    #[error("serial device not open")]
    SerialNotOpen,
    /// A serial port I/O failure occurred.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    /// A value failed to (de)serialize as JSON where JSON was expected.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// A single blanket conversion covers `TinyMqErrorKind` itself (via the
// standard library's reflexive `From<T> for T`) and every type the kind
// enum accepts via `#[from]` (`io::Error`, `rusqlite::Error`, ...), so `?`
// works directly against `Result<T>` from any of those error sources.
impl<E> From<E> for TinyMqError
where
    TinyMqErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Self(TinyMqErrorKind::from(err))
    }
}

/// Convenience alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, TinyMqError>;
