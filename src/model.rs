// Copyright (c) TinyMQ contributors.
// Licensed under the MIT License.

//! Data model entities persisted by the local store (§3 of the spec).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A sensor known to the local store. Created lazily on first reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    /// Store-assigned row id.
    pub id: i64,
    /// Unique sensor name as reported by the device.
    pub name: String,
    /// Most recent reading's value, textual (the wire format does not commit
    /// to numeric vs. string readings).
    pub last_value: String,
    /// Unix-seconds timestamp of the most recent reading.
    pub last_updated: i64,
}

/// A single, append-only sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Owning sensor's row id.
    pub sensor_id: i64,
    /// Unix-seconds timestamp supplied by the device (or wall clock if absent).
    pub timestamp: i64,
    /// Reading value, textual.
    pub value: String,
    /// Units string, e.g. `"C"`, `"%"`. Empty string if the device did not supply one.
    pub units: String,
}

/// A named, client-local topic that may be marked for outbound publishing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    /// Store-assigned row id.
    pub id: i64,
    /// Unique (per client) topic name.
    pub name: String,
    /// Whether readings for this topic's sensor set are currently published.
    pub publish: bool,
}

/// A subscription to a topic published by some other client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Store-assigned row id.
    pub id: i64,
    /// Name of the subscribed-to topic.
    pub topic_name: String,
    /// Client id of the publisher.
    pub source_client_id: String,
    /// Whether the subscription is currently active.
    pub active: bool,
}

/// A stored inbound payload delivered against a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDatum {
    /// Owning subscription's row id.
    pub subscription_id: i64,
    /// Unix-seconds timestamp of arrival.
    pub timestamp: i64,
    /// Raw JSON payload as received.
    pub raw_json: String,
}

/// A sensor reading as produced by the DAS, prior to being stamped and stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEvent {
    /// Sensor name.
    pub name: String,
    /// Reading value, textual.
    pub value: String,
    /// Unix-seconds timestamp.
    pub timestamp: i64,
    /// Units string (empty if not supplied).
    pub units: String,
}

/// One entry of an inbound admin request list (owner's view).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminRequestSummary {
    /// Broker-assigned request id.
    pub id: String,
    /// Topic the request pertains to.
    pub topic_name: String,
    /// Id of the client requesting administration.
    pub requester_id: String,
    /// Unix-seconds timestamp the request was made.
    pub request_timestamp: i64,
}

/// One entry of the requester's own outstanding admin requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MyAdminRequest {
    /// Topic the request pertains to.
    pub topic_name: String,
    /// Owner's client id.
    pub owner_id: String,
    /// Unix-seconds timestamp the request was made.
    pub request_timestamp: i64,
    /// Current status: `"pending"`, `"approved"`, or `"rejected"`.
    pub status: String,
}

/// One entry of the client's own topics (owner's view of `MY_TOPICS_RESP`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MyTopic {
    /// Topic name.
    pub name: String,
    /// Whether publishing is currently active.
    pub publish_active: bool,
    /// Client id of the current administrator, if any.
    pub admin_client_id: Option<String>,
    /// Unix-seconds creation timestamp.
    pub created_at: i64,
}

/// One entry of topics on which this client has been granted admin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MyAdminTopic {
    /// Topic name.
    pub name: String,
    /// Owner's client id.
    pub owner_client_id: String,
    /// Whether the owner currently has publishing active.
    pub publish: bool,
    /// Unix-seconds timestamp the grant was made.
    pub granted_at: i64,
}

/// Sensor configuration on a remote topic, as returned by `TOPIC_SENSORS_RESP`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicSensor {
    /// Sensor name.
    pub name: String,
    /// Whether the sensor is currently reporting as active.
    #[serde(deserialize_with = "bool_from_bool_or_str")]
    pub active: bool,
    /// Whether an administrator may toggle this sensor.
    #[serde(deserialize_with = "bool_from_bool_or_str")]
    pub activable: bool,
    /// Unix-seconds timestamp the membership was configured.
    pub configured_at: i64,
}

/// Deserializes a bool that the broker may encode either as a JSON boolean or
/// as the string `"true"`/`"false"`.
fn bool_from_bool_or_str<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(b),
        Value::String(s) if s == "true" => Ok(true),
        Value::String(s) if s == "false" => Ok(false),
        other => Err(Error::custom(format!("expected a bool or \"true\"/\"false\" string, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_sensor_accepts_string_encoded_booleans() {
        let sensor: TopicSensor = serde_json::from_str(
            r#"{"name":"fan","active":"true","activable":"false","configured_at":100}"#,
        )
        .unwrap();
        assert!(sensor.active);
        assert!(!sensor.activable);
    }

    #[test]
    fn topic_sensor_accepts_plain_json_booleans() {
        let sensor: TopicSensor =
            serde_json::from_str(r#"{"name":"fan","active":true,"activable":false,"configured_at":100}"#)
                .unwrap();
        assert!(sensor.active);
        assert!(!sensor.activable);
    }
}
