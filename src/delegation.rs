// Copyright (c) TinyMQ contributors.
// Licensed under the MIT License.

//! The delegation subsystem: owner/requester admin-rights flows, sensor
//! "activable" toggles, and remote sensor commands relayed through the
//! broker to the owning device (spec §4.G).
//!
//! Only `ADMIN_LIST_REQ`/`RESP`, `MY_TOPICS_REQ`/`RESP`, `MY_ADMIN_REQ`/`RESP`,
//! `MY_ADMIN_TOPICS_REQ`/`RESP`, `TOPIC_SENSORS_REQ`/`RESP`, and
//! `ADMIN_RESIGN`/`ACK` go through the connection's request/response
//! correlation table. Everything else here (respond, revoke, request_admin,
//! send_sensor_command, mark_activable) is either a fire-and-forget framed
//! send or a JSON envelope published on a well-known topic, with any
//! asynchronous result delivered later through a registered callback.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use log::{info, warn};
use serde_json::{json, Value};

use crate::codec::{Frame, PacketType};
use crate::connection::Connection;
use crate::das::Das;
use crate::error::{Result, TinyMqErrorKind};
use crate::model::{AdminRequestSummary, MyAdminRequest, MyAdminTopic, MyTopic, TopicSensor};
use crate::pubsub::PubSub;

/// Default time to wait for a correlated delegation response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Callback invoked when the broker notifies this client of a new incoming
/// admin request (owner side).
pub type RequestCallback = Box<dyn Fn(AdminRequestSummary) + Send + Sync>;

/// Callback invoked when the broker reports the result of a previously
/// submitted admin request (requester side): approval, rejection, or revocation.
pub type ResultCallback = Box<dyn Fn(serde_json::Value) + Send + Sync>;

/// Callback invoked with `(success, message, error_code, topic_name)` when
/// the broker's `ADMIN_REQ_ACK` for a submitted [`Delegation::request_admin`]
/// call arrives. `message`/`error_code` are empty on success.
pub type AdminRequestCallback = Box<dyn Fn(bool, String, String, String) + Send + Sync>;

/// Callback invoked with `(topic_name, sensor_name, active)` when
/// `SENSOR_STATUS_RESP` confirms a remote sensor command took effect.
pub type SensorStatusCallback = Box<dyn Fn(String, String, bool) + Send + Sync>;

/// Owner/requester admin-rights operations over a [`Connection`].
pub struct Delegation {
    connection: Arc<Connection>,
    pubsub: Arc<PubSub>,
    das: Arc<Das>,
    client_id: String,
    /// In-memory "activable" flags, keyed by sensor name. Not persisted: the
    /// broker already validates activability server-side before forwarding a
    /// command here, so this is a best-effort local mirror rather than the
    /// authority. Keyed by sensor name alone because the forwarded command
    /// envelope (spec §4.G) doesn't carry a topic name.
    activable: Arc<StdMutex<HashSet<String>>>,
    /// Serializes `list_my_admin_topics` calls: `MyAdminTopicsReq` shares one
    /// correlation slot, so overlapping callers would otherwise race and
    /// observe [`TinyMqErrorKind::Replaced`].
    my_admin_topics_guard: tokio::sync::Mutex<()>,
    /// The single outstanding `request_admin` call, if any: `ADMIN_REQ_ACK`
    /// is not correlation-tracked (the broker sends at most one at a time),
    /// so it's claimed off the push channel instead.
    pending_admin_request: StdMutex<Option<(String, AdminRequestCallback)>>,
    on_request: StdMutex<Option<RequestCallback>>,
    on_result: StdMutex<Option<ResultCallback>>,
    on_sensor_status: StdMutex<Option<SensorStatusCallback>>,
}

impl Delegation {
    /// Builds a delegation surface over `connection`/`pubsub`, forwarding
    /// broker-relayed sensor commands to `das`.
    #[must_use]
    pub fn new(connection: Arc<Connection>, pubsub: Arc<PubSub>, das: Arc<Das>, client_id: impl Into<String>) -> Self {
        Self {
            connection,
            pubsub,
            das,
            client_id: client_id.into(),
            activable: Arc::new(StdMutex::new(HashSet::new())),
            my_admin_topics_guard: tokio::sync::Mutex::new(()),
            pending_admin_request: StdMutex::new(None),
            on_request: StdMutex::new(None),
            on_result: StdMutex::new(None),
            on_sensor_status: StdMutex::new(None),
        }
    }

    /// Registers the callbacks invoked for broker-pushed delegation events.
    /// Each is optional and replaces whatever was previously registered.
    pub fn set_notification_callbacks(
        &self,
        on_request: Option<RequestCallback>,
        on_result: Option<ResultCallback>,
        on_sensor_status: Option<SensorStatusCallback>,
    ) {
        *self.on_request.lock().expect("delegation callback mutex poisoned") = on_request;
        *self.on_result.lock().expect("delegation callback mutex poisoned") = on_result;
        *self.on_sensor_status.lock().expect("delegation callback mutex poisoned") = on_sensor_status;
    }

    /// Declares `sensor` on `topic` activable (or not) by a remote admin, and
    /// publishes the declaration to the broker so other admins' commands are
    /// accepted or rejected accordingly.
    ///
    /// # Errors
    /// Returns an error if the connection is not open.
    pub async fn mark_activable(&self, topic: &str, sensor: &str, activable: bool) -> Result<()> {
        {
            let mut set = self.activable.lock().expect("activable mutex poisoned");
            if activable {
                set.insert(sensor.to_string());
            } else {
                set.remove(sensor);
            }
        }
        let envelope = json!({
            "__admin_sensor_activable": true,
            "topic_name": topic,
            "sensor_name": sensor,
            "activable": activable,
            "client_id": self.client_id,
        });
        let payload = serde_json::to_vec(&envelope)?;
        self.pubsub.publish("system/admin/sensor_activable", &payload).await
    }

    fn is_activable(&self, sensor: &str) -> bool {
        self.activable.lock().expect("activable mutex poisoned").contains(sensor)
    }

    // ---- Owner operations --------------------------------------------

    /// Lists pending incoming admin requests on topics this client owns.
    ///
    /// # Errors
    /// Returns an error if the connection is not open or the broker does
    /// not respond in time.
    pub async fn list_incoming_requests(&self) -> Result<Vec<AdminRequestSummary>> {
        let (_flags, payload) = self
            .connection
            .request(
                Frame::new(PacketType::AdminListReq, 0, Vec::new()),
                PacketType::AdminListResp,
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Approves or rejects a pending incoming request identified by
    /// `(topic_name, requester_id)`. `request_id` identifies the request to
    /// the caller but is not part of the wire payload; the broker matches the
    /// pending request by topic and requester.
    ///
    /// No synchronous reply is expected.
    ///
    /// # Errors
    /// Returns an error if the connection is not open, or if `topic_name`/
    /// `requester_id` is too long to encode.
    pub async fn respond(&self, request_id: &str, topic_name: &str, requester_id: &str, approved: bool) -> Result<()> {
        info!("responding to admin request {request_id} for '{topic_name}': approved={approved}");
        let topic_bytes = topic_name.as_bytes();
        let requester_bytes = requester_id.as_bytes();
        if topic_bytes.len() > usize::from(u8::MAX) || requester_bytes.len() > usize::from(u8::MAX) {
            return Err(TinyMqErrorKind::Encoding(format!(
                "topic_name ({} bytes) or requester_id ({} bytes) exceeds the 255-byte ADMIN_RESPONSE field limit",
                topic_bytes.len(),
                requester_bytes.len()
            ))
            .into());
        }
        let mut payload = Vec::with_capacity(2 + topic_bytes.len() + requester_bytes.len());
        payload.push(u8::from(approved));
        #[allow(clippy::cast_possible_truncation)]
        payload.push(topic_bytes.len() as u8);
        payload.extend_from_slice(topic_bytes);
        #[allow(clippy::cast_possible_truncation)]
        payload.push(requester_bytes.len() as u8);
        payload.extend_from_slice(requester_bytes);
        self.connection.send(Frame::new(PacketType::AdminResponse, 0, payload)).await
    }

    /// Revokes a previously granted admin right on one of this client's
    /// topics. The broker performs the revocation and notifies the requester
    /// via `ADMIN_RESULT`; there is no synchronous reply here.
    ///
    /// # Errors
    /// Returns an error if the connection is not open.
    pub async fn revoke(&self, topic_name: &str, admin_id: &str) -> Result<()> {
        let envelope = json!({
            "__admin_revoke": true,
            "client_id": self.client_id,
            "topic_name": topic_name,
            "admin_to_revoke": admin_id,
            "timestamp": Utc::now().timestamp(),
        });
        let payload = serde_json::to_vec(&envelope)?;
        self.pubsub.publish("system/admin/revoke", &payload).await
    }

    /// Lists this client's own topics and who (if anyone) administers each.
    ///
    /// # Errors
    /// Returns an error if the connection is not open or the broker does
    /// not respond in time.
    pub async fn list_my_topics(&self) -> Result<Vec<MyTopic>> {
        let (_flags, payload) = self
            .connection
            .request(
                Frame::new(PacketType::MyTopicsReq, 0, Vec::new()),
                PacketType::MyTopicsResp,
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    // ---- Requester operations ------------------------------------------

    /// Requests administration of `topic_name`, owned by `owner_id`.
    /// Rejects locally with [`TinyMqErrorKind::Validation`] (`SELF_REQUEST`)
    /// if `owner_id` is this client's own id, without contacting the broker.
    /// Otherwise publishes the request and registers `callback` to receive
    /// the eventual `ADMIN_REQ_ACK`; this call itself returns once the
    /// envelope has been sent, not once the broker has decided.
    ///
    /// # Errors
    /// Returns [`TinyMqErrorKind::Validation`] for a self-request, or a
    /// connection error if the publish fails.
    pub async fn request_admin(&self, topic_name: &str, owner_id: &str, callback: AdminRequestCallback) -> Result<()> {
        if owner_id == self.client_id {
            return Err(TinyMqErrorKind::Validation {
                code: "SELF_REQUEST".to_string(),
                message: format!("cannot request administration of your own topic '{topic_name}'"),
            }
            .into());
        }
        *self.pending_admin_request.lock().expect("pending admin request mutex poisoned") =
            Some((topic_name.to_string(), callback));

        let envelope = json!({
            "__admin_request": true,
            "client_id": self.client_id,
            "topic_name": topic_name,
            "owner_id": owner_id,
            "timestamp": Utc::now().timestamp(),
        });
        let payload = serde_json::to_vec(&envelope)?;
        self.pubsub.publish_to(&format!("{owner_id}/admin"), &payload).await
    }

    /// Lists this client's own outstanding admin requests.
    ///
    /// # Errors
    /// Returns an error if the connection is not open or the broker does
    /// not respond in time.
    pub async fn list_my_requests(&self) -> Result<Vec<MyAdminRequest>> {
        let (_flags, payload) = self
            .connection
            .request(
                Frame::new(PacketType::MyAdminReq, 0, Vec::new()),
                PacketType::MyAdminResp,
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Lists topics on which this client currently holds admin rights.
    /// Serialized against concurrent callers (see
    /// [`Delegation::my_admin_topics_guard`]).
    ///
    /// # Errors
    /// Returns an error if the connection is not open or the broker does
    /// not respond in time.
    pub async fn list_my_admin_topics(&self) -> Result<Vec<MyAdminTopic>> {
        let _guard = self.my_admin_topics_guard.lock().await;
        let (_flags, payload) = self
            .connection
            .request(
                Frame::new(PacketType::MyAdminTopicsReq, 0, Vec::new()),
                PacketType::MyAdminTopicsResp,
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Fetches the sensor set configured for a remote topic.
    ///
    /// # Errors
    /// Returns an error if the connection is not open or the broker does
    /// not respond in time.
    pub async fn get_topic_sensors(&self, topic_name: &str) -> Result<Vec<TopicSensor>> {
        let (_flags, reply) = self
            .connection
            .request(
                Frame::new(PacketType::TopicSensorsReq, 0, topic_name.as_bytes().to_vec()),
                PacketType::TopicSensorsResp,
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await?;
        #[derive(serde::Deserialize)]
        struct TopicSensorsBody {
            sensors: Vec<TopicSensor>,
        }
        let body: TopicSensorsBody = serde_json::from_slice(&reply)?;
        Ok(body.sensors)
    }

    /// Resigns previously granted administration of `topic_name`.
    ///
    /// # Errors
    /// Returns [`TinyMqErrorKind::Validation`] if the broker rejects the
    /// resignation (flags != 0 on `ADMIN_RESIGN_ACK`), or a connection/timeout
    /// error.
    pub async fn resign_admin(&self, topic_name: &str) -> Result<()> {
        let (flags, reply) = self
            .connection
            .request(
                Frame::new(PacketType::AdminResign, 0, topic_name.as_bytes().to_vec()),
                PacketType::AdminResignAck,
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await?;
        if flags == 0 {
            Ok(())
        } else {
            let body: Value = serde_json::from_slice(&reply).unwrap_or(Value::Null);
            let message = body.get("message").and_then(Value::as_str).unwrap_or_default().to_string();
            Err(TinyMqErrorKind::Validation {
                code: "ADMIN_RESIGN_REJECTED".to_string(),
                message,
            }
            .into())
        }
    }

    /// Sends a remote command toggling `sensor_name` on `topic_name`, relayed
    /// by the broker to the owning device. `owner_id` identifies the current
    /// admin relationship for the caller's own bookkeeping; the broker
    /// derives the admin/owner from `topic_name` itself. The broker's
    /// `SENSOR_STATUS_RESP` confirmation arrives later through whichever
    /// callback was registered with [`Delegation::set_notification_callbacks`],
    /// not as a reply to this call.
    ///
    /// # Errors
    /// Returns an error if the connection is not open.
    pub async fn send_sensor_command(&self, topic_name: &str, owner_id: &str, sensor_name: &str, active: bool) -> Result<()> {
        let _ = owner_id;
        let envelope = json!({
            "command": "set_sensor",
            "topic_name": topic_name,
            "sensor_name": sensor_name,
            "active": active,
            "sender_id": self.client_id,
            "timestamp": Utc::now().timestamp(),
        });
        let payload = serde_json::to_vec(&envelope)?;
        self.pubsub.publish("system/admin/config", &payload).await
    }

    /// Spawns the background task that dispatches broker-pushed
    /// `ADMIN_REQ_ACK` (requester: submitted-request result),
    /// `ADMIN_RESULT` (requester: grant/reject/revoke outcome),
    /// `SENSOR_STATUS_RESP` (requester: command confirmation), and legacy
    /// `ADMIN_NOTIFY` framed notifications.
    pub fn spawn_notification_dispatch(self: &Arc<Self>) {
        let delegation = self.clone();
        let mut pushes = self.connection.subscribe_pushes();
        tokio::spawn(async move {
            loop {
                match pushes.recv().await {
                    Ok(frame) if frame.packet_type == PacketType::AdminReqAck => {
                        delegation.handle_admin_req_ack(frame.flags, &frame.payload);
                    }
                    Ok(frame) if frame.packet_type == PacketType::AdminNotify => {
                        delegation.handle_admin_notify(&frame.payload);
                    }
                    Ok(frame) if frame.packet_type == PacketType::AdminResult => {
                        if let Ok(value) = serde_json::from_slice(&frame.payload) {
                            if let Some(cb) = delegation.on_result.lock().expect("delegation callback mutex poisoned").as_deref() {
                                cb(value);
                            }
                        }
                    }
                    Ok(frame) if frame.packet_type == PacketType::SensorStatusResp => {
                        delegation.handle_sensor_status_resp(&frame.payload);
                    }
                    Ok(_other) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("delegation notification dispatch lagged, skipped {n} frames");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn handle_admin_req_ack(&self, flags: u8, payload: &[u8]) {
        let Some((topic_name, callback)) = self
            .pending_admin_request
            .lock()
            .expect("pending admin request mutex poisoned")
            .take()
        else {
            warn!("received ADMIN_REQ_ACK with no outstanding request_admin call");
            return;
        };
        if flags == 0 {
            callback(true, String::new(), String::new(), topic_name);
            return;
        }
        let body: Value = serde_json::from_slice(payload).unwrap_or(Value::Null);
        let error_code = body.get("error_code").and_then(Value::as_str).unwrap_or_default().to_string();
        let message = body.get("error_message").and_then(Value::as_str).unwrap_or_default().to_string();
        let topic_name = body.get("topic_name").and_then(Value::as_str).map_or(topic_name, str::to_string);
        callback(false, message, error_code, topic_name);
    }

    fn handle_sensor_status_resp(&self, payload: &[u8]) {
        let Ok(value) = serde_json::from_slice::<Value>(payload) else {
            warn!("discarding malformed SENSOR_STATUS_RESP payload");
            return;
        };
        let (Some(topic_name), Some(sensor_name), Some(active)) = (
            value.get("topic_name").and_then(Value::as_str),
            value.get("sensor_name").and_then(Value::as_str),
            value.get("active").and_then(Value::as_bool),
        ) else {
            warn!("SENSOR_STATUS_RESP missing topic_name/sensor_name/active");
            return;
        };
        if let Some(cb) = self.on_sensor_status.lock().expect("delegation callback mutex poisoned").as_deref() {
            cb(topic_name.to_string(), sensor_name.to_string(), active);
        }
    }

    /// Handles a legacy framed `ADMIN_NOTIFY` packet. The live notification
    /// path is the `"<client_id>/admin_notifications"` subscription (see
    /// [`Delegation::handle_admin_notifications_topic`]); this remains as a
    /// fallback in case the broker ever emits the dedicated packet type.
    fn handle_admin_notify(&self, payload: &[u8]) {
        let Ok(value) = serde_json::from_slice::<Value>(payload) else {
            warn!("discarding malformed ADMIN_NOTIFY payload");
            return;
        };
        self.handle_notification_envelope(&value);
    }

    /// Handles one inbound message on `"<client_id>/admin_notifications"`
    /// (spec §4.G): either a new incoming admin request, or a command
    /// envelope forwarded from a remote admin to be relayed to the DAS.
    pub fn handle_admin_notifications_topic(&self, payload: bytes::Bytes) {
        let Ok(value) = serde_json::from_slice::<Value>(&payload) else {
            warn!("discarding malformed admin_notifications message");
            return;
        };
        self.handle_notification_envelope(&value);
    }

    fn handle_notification_envelope(&self, value: &Value) {
        if value.get("command").and_then(Value::as_str) == Some("set_sensor") {
            self.forward_command(value);
            return;
        }
        if value.get("type").and_then(Value::as_str) == Some("request") {
            match serde_json::from_value::<AdminRequestSummary>(value.clone()) {
                Ok(summary) => {
                    if let Some(cb) = self.on_request.lock().expect("delegation callback mutex poisoned").as_deref() {
                        cb(summary);
                    } else {
                        info!("incoming admin request notification received, not subscribed to callback");
                    }
                }
                Err(err) => warn!("malformed admin request notification: {err}"),
            }
            return;
        }
        warn!("admin notification envelope with unrecognised shape: {value}");
    }

    fn forward_command(&self, value: &Value) {
        let Some(sensor) = value.get("sensor_name").and_then(Value::as_str) else {
            warn!("admin notification command envelope missing sensor_name");
            return;
        };
        if !self.is_activable(sensor) {
            warn!("ignoring command for non-activable sensor '{sensor}'");
            return;
        }
        let active = value.get("active").and_then(Value::as_bool).unwrap_or(false);
        let command = json!({
            "command": format!("set_{sensor}"),
            "value": i32::from(active),
        });
        if let Err(err) = self.das.send_command(&command) {
            warn!("failed to forward sensor command for '{sensor}' to DAS: {err}");
        }
    }
}
