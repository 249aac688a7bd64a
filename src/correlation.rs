// Copyright (c) TinyMQ contributors.
// Licensed under the MIT License.

//! One-shot request/response correlation keyed by expected packet type.
//!
//! The broker does not tag responses with a request id; instead, each
//! outstanding request "claims" the next frame of its expected
//! [`PacketType`]. Only one request per expected type may be outstanding at a
//! time: registering a new one releases whatever waiter was already
//! registered for that type with [`TinyMqErrorKind::Replaced`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use log::trace;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::codec::PacketType;
use crate::error::{Result, TinyMqErrorKind};

type Waiter = oneshot::Sender<std::result::Result<(u8, Bytes), TinyMqErrorKind>>;

/// Table of outstanding one-shot waiters, keyed by the packet type each is
/// waiting to observe. Held only across synchronous critical sections, never
/// across an `.await`.
#[derive(Default)]
pub struct CorrelationTable {
    waiters: Mutex<HashMap<PacketType, Waiter>>,
}

impl CorrelationTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new waiter for `expected_type`, returning its receiver. If
    /// a waiter was already registered for this type, it is resolved with
    /// [`TinyMqErrorKind::Replaced`] before being dropped.
    pub fn register(&self, expected_type: PacketType) -> oneshot::Receiver<std::result::Result<(u8, Bytes), TinyMqErrorKind>> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().expect("correlation mutex poisoned");
        if let Some(prev) = waiters.insert(expected_type, tx) {
            let _ = prev.send(Err(TinyMqErrorKind::Replaced(expected_type)));
        }
        rx
    }

    /// Resolves the waiter registered for `packet_type`, if any, with the
    /// given flags and payload. Returns `true` if a waiter was present and
    /// claimed the frame. Carrying `flags` lets callers read success/failure
    /// out of responses that encode it there (e.g. `ADMIN_RESIGN_ACK`).
    pub fn resolve(&self, packet_type: PacketType, flags: u8, payload: Bytes) -> bool {
        let waiter = self
            .waiters
            .lock()
            .expect("correlation mutex poisoned")
            .remove(&packet_type);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok((flags, payload)));
                true
            }
            None => false,
        }
    }

    /// Releases every outstanding waiter with [`TinyMqErrorKind::ConnectionLost`].
    /// Called by the connection engine when the socket closes.
    pub fn fail_all_connection_lost(&self) {
        let mut waiters = self.waiters.lock().expect("correlation mutex poisoned");
        for (packet_type, tx) in waiters.drain() {
            let _ = tx.send(Err(TinyMqErrorKind::ConnectionLost(packet_type)));
        }
    }
}

/// Awaits a single correlated response, mapping a closed channel or elapsed
/// timeout to the corresponding [`TinyMqErrorKind`].
///
/// # Errors
/// Returns an error if the waiter is replaced, the connection is lost, or no
/// response arrives within `request_timeout`.
pub async fn await_response(
    rx: oneshot::Receiver<std::result::Result<(u8, Bytes), TinyMqErrorKind>>,
    expected_type: PacketType,
    request_timeout: Duration,
) -> Result<(u8, Bytes)> {
    match timeout(request_timeout, rx).await {
        Ok(Ok(Ok((flags, payload)))) => {
            trace!("correlation for {expected_type:?} resolved with {} byte payload, flags={flags}", payload.len());
            Ok((flags, payload))
        }
        Ok(Ok(Err(kind))) => Err(kind.into()),
        Ok(Err(_recv_error)) => Err(TinyMqErrorKind::ConnectionLost(expected_type).into()),
        Err(_elapsed) => Err(TinyMqErrorKind::RequestTimeout(expected_type).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_payload_to_registered_waiter() {
        let table = CorrelationTable::new();
        let rx = table.register(PacketType::ConnAck);
        assert!(table.resolve(PacketType::ConnAck, 0, Bytes::from_static(b"ok")));
        let (flags, payload) = await_response(rx, PacketType::ConnAck, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(flags, 0);
        assert_eq!(&payload[..], b"ok");
    }

    #[tokio::test]
    async fn resolve_carries_flags_through_to_the_waiter() {
        let table = CorrelationTable::new();
        let rx = table.register(PacketType::AdminResignAck);
        assert!(table.resolve(PacketType::AdminResignAck, 1, Bytes::from_static(b"{}")));
        let (flags, _payload) = await_response(rx, PacketType::AdminResignAck, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(flags, 1);
    }

    #[tokio::test]
    async fn resolve_with_no_waiter_returns_false() {
        let table = CorrelationTable::new();
        assert!(!table.resolve(PacketType::ConnAck, 0, Bytes::new()));
    }

    #[tokio::test]
    async fn registering_twice_replaces_the_first_waiter() {
        let table = CorrelationTable::new();
        let first = table.register(PacketType::SubAck);
        let _second = table.register(PacketType::SubAck);
        let err = await_response(first, PacketType::SubAck, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), TinyMqErrorKind::Replaced(PacketType::SubAck)));
    }

    #[tokio::test]
    async fn fail_all_connection_lost_releases_every_waiter() {
        let table = CorrelationTable::new();
        let a = table.register(PacketType::ConnAck);
        let b = table.register(PacketType::SubAck);
        table.fail_all_connection_lost();
        assert!(matches!(
            await_response(a, PacketType::ConnAck, Duration::from_secs(1)).await.unwrap_err().kind(),
            TinyMqErrorKind::ConnectionLost(PacketType::ConnAck)
        ));
        assert!(matches!(
            await_response(b, PacketType::SubAck, Duration::from_secs(1)).await.unwrap_err().kind(),
            TinyMqErrorKind::ConnectionLost(PacketType::SubAck)
        ));
    }

    #[tokio::test]
    async fn timeout_elapses_when_nothing_resolves() {
        let table = CorrelationTable::new();
        let rx = table.register(PacketType::UnsubAck);
        let err = await_response(rx, PacketType::UnsubAck, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), TinyMqErrorKind::RequestTimeout(PacketType::UnsubAck)));
    }
}
