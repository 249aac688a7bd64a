// Copyright (c) TinyMQ contributors.
// Licensed under the MIT License.

//! The publish/subscribe surface (spec §4.F): `publish`, `subscribe`,
//! `unsubscribe`, and inbound message dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, warn};
use serde_json::Value;

use crate::codec::{Frame, PacketType};
use crate::connection::Connection;
use crate::error::{Result, TinyMqErrorKind};
use crate::store::LocalStore;

/// Callback invoked with the raw message body of an inbound `PUB` whose
/// topic matched a registered subscription.
pub type InboundHandler = Box<dyn Fn(Bytes) + Send + Sync>;

/// The publish/subscribe surface over a [`Connection`].
pub struct PubSub {
    connection: Arc<Connection>,
    client_id: String,
    handlers: Arc<StdMutex<HashMap<String, InboundHandler>>>,
}

impl PubSub {
    /// Builds a pub/sub surface over `connection`, spawning a background
    /// task that dispatches inbound `PUB` frames to registered handlers and
    /// records each delivery against its matching active subscription, if
    /// one exists, in `store`.
    #[must_use]
    pub fn new(connection: Arc<Connection>, client_id: String, store: Arc<dyn LocalStore>) -> Self {
        let handlers: Arc<StdMutex<HashMap<String, InboundHandler>>> =
            Arc::new(StdMutex::new(HashMap::new()));
        spawn_dispatch(connection.clone(), handlers.clone(), store);
        Self {
            connection,
            client_id,
            handlers,
        }
    }

    /// Publishes `message` on `topic`. The wire topic is namespaced under
    /// the publishing client's effective identity: `message`'s `"cliente"`
    /// JSON field if present, else this client's own id.
    ///
    /// Fire-and-forget: the broker does not ack `PUB`, so this returns as
    /// soon as the frame is written.
    ///
    /// # Errors
    /// Returns an error if the topic exceeds 255 encoded bytes or the
    /// connection is not open.
    pub async fn publish(&self, topic: &str, message: &[u8]) -> Result<()> {
        let effective = effective_topic(topic, message, &self.client_id);
        self.publish_to(&effective, message).await
    }

    /// Publishes `message` on the already fully-namespaced `wire_topic`,
    /// bypassing the caller's-own-identity prefixing [`Self::publish`]
    /// applies. Used for envelopes addressed to another client's namespace,
    /// e.g. an admin request published to `"<owner_id>/admin"`.
    ///
    /// # Errors
    /// Returns an error if `wire_topic` exceeds 255 encoded bytes or the
    /// connection is not open.
    pub async fn publish_to(&self, wire_topic: &str, message: &[u8]) -> Result<()> {
        let payload = build_publish_payload(wire_topic, message)?;
        self.connection.send(Frame::new(PacketType::Pub, 0, payload)).await
    }

    /// Subscribes to `topic`, published under `source_client_id`.
    ///
    /// Fire-and-forget: the broker's `SUBACK` is not awaited.
    ///
    /// # Errors
    /// Returns an error if the connection is not open.
    pub async fn subscribe(&self, topic: &str, source_client_id: &str) -> Result<()> {
        let wire_topic = format!("{source_client_id}/{topic}");
        let payload = serde_json::to_vec(&[wire_topic])?;
        self.connection.send(Frame::new(PacketType::Sub, 0, payload)).await
    }

    /// Unsubscribes from `topic`, published under `source_client_id`.
    ///
    /// Fire-and-forget: the broker's `UNSUBACK` is not awaited.
    ///
    /// # Errors
    /// Returns an error if the connection is not open.
    pub async fn unsubscribe(&self, topic: &str, source_client_id: &str) -> Result<()> {
        let wire_topic = format!("{source_client_id}/{topic}");
        let payload = serde_json::to_vec(&[wire_topic])?;
        self.connection.send(Frame::new(PacketType::Unsub, 0, payload)).await
    }

    /// Registers a handler invoked for every inbound message on `wire_topic`
    /// (the fully-namespaced topic string, e.g. `"alice/weather"`).
    pub fn on_topic(&self, wire_topic: impl Into<String>, handler: InboundHandler) {
        self.handlers
            .lock()
            .expect("pubsub handler mutex poisoned")
            .insert(wire_topic.into(), handler);
    }

    /// Removes a previously registered handler.
    pub fn remove_handler(&self, wire_topic: &str) {
        self.handlers
            .lock()
            .expect("pubsub handler mutex poisoned")
            .remove(wire_topic);
    }
}

/// Computes the namespace prefix used for a published topic: the `"cliente"`
/// field of `message` if it parses as a JSON object carrying one, else
/// `client_id`.
fn effective_topic(topic: &str, message: &[u8], client_id: &str) -> String {
    let prefix = serde_json::from_slice::<Value>(message)
        .ok()
        .and_then(|v| v.get("cliente").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| client_id.to_string());
    format!("{prefix}/{topic}")
}

/// Builds a `PUB` payload: `topic_len:u8 | topic_json | message`.
fn build_publish_payload(wire_topic: &str, message: &[u8]) -> Result<Vec<u8>> {
    let topic_json = serde_json::to_vec(wire_topic)?;
    if topic_json.len() > u8::MAX as usize {
        return Err(TinyMqErrorKind::Encoding(format!(
            "topic '{wire_topic}' encodes to {} bytes, exceeding the 255-byte limit",
            topic_json.len()
        ))
        .into());
    }
    let mut buf = BytesMut::with_capacity(1 + topic_json.len() + message.len());
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u8(topic_json.len() as u8);
    buf.put_slice(&topic_json);
    buf.put_slice(message);
    Ok(buf.to_vec())
}

/// Parses an inbound `PUB` payload into `(wire_topic, message)`.
fn parse_publish_payload(mut payload: Bytes) -> Option<(String, Bytes)> {
    if payload.is_empty() {
        return None;
    }
    let topic_len = payload.get_u8() as usize;
    if payload.len() < topic_len {
        return None;
    }
    let topic_json = payload.split_to(topic_len);
    let topic = normalize_topic(&topic_json)?;
    Some((topic, payload))
}

/// Normalizes a topic JSON value into a bare string. The broker may deliver
/// the topic as a JSON string, or as a single-element JSON array; any other
/// shape is treated as malformed.
fn normalize_topic(topic_json: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(topic_json).ok()?;
    match value {
        Value::String(s) => Some(s),
        Value::Array(mut items) if items.len() == 1 => match items.pop()? {
            Value::String(s) => Some(s),
            _ => None,
        },
        _ => None,
    }
}

fn spawn_dispatch(
    connection: Arc<Connection>,
    handlers: Arc<StdMutex<HashMap<String, InboundHandler>>>,
    store: Arc<dyn LocalStore>,
) {
    tokio::spawn(async move {
        let mut pushes = connection.subscribe_pushes();
        loop {
            match pushes.recv().await {
                Ok(frame) if frame.packet_type == PacketType::Pub => {
                    let Some((topic, message)) = parse_publish_payload(frame.payload) else {
                        warn!("discarding malformed PUB payload");
                        continue;
                    };
                    record_subscription_data(&store, &topic, &message);
                    let handlers = handlers.lock().expect("pubsub handler mutex poisoned");
                    if let Some(handler) = handlers.get(&topic) {
                        handler(message);
                    } else {
                        debug!("no handler registered for topic '{topic}'");
                    }
                }
                Ok(_other) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("pub/sub dispatch lagged, skipped {skipped} frames");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Records a delivered `message` against its matching active subscription,
/// if one exists. `topic` is the fully-namespaced wire topic
/// (`"<source_client_id>/<topic>"`); messages on topics with no active
/// subscription are delivered to handlers (if any) but not persisted.
fn record_subscription_data(store: &Arc<dyn LocalStore>, topic: &str, message: &Bytes) {
    let Some((source_client_id, topic_name)) = topic.split_once('/') else {
        return;
    };
    let timestamp = chrono::Utc::now().timestamp();
    let raw = String::from_utf8_lossy(message);
    if let Err(err) = store.add_subscription_data(topic_name, source_client_id, timestamp, &raw) {
        debug!("not recording delivery on '{topic}': {err}");
    }
}
