// Copyright (c) TinyMQ contributors.
// Licensed under the MIT License.

//! End-to-end scenarios against an in-process mock broker: connect,
//! publish, subscribe/unsubscribe, delegation, and correlation-timeout
//! round trips (spec §8 scenarios S3, S4, S6 and the publish/subscribe path).

use std::sync::Arc;
use std::time::Duration;

use tinymq_client::codec::{self, Frame, PacketType};
use tinymq_client::das::Das;
use tinymq_client::delegation::Delegation;
use tinymq_client::pubsub::PubSub;
use tinymq_client::store::SqliteStore;
use tinymq_client::{Connection, ConnectionState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn bind_mock() -> (std::net::SocketAddr, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (addr, listener)
}

async fn read_frame(socket: &mut TcpStream) -> Frame {
    let mut buf = bytes::BytesMut::with_capacity(4096);
    loop {
        let mut chunk = [0u8; 1024];
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "mock broker peer closed before a full frame arrived");
        buf.extend_from_slice(&chunk[..n]);
        if let codec::DecodeOutcome::Frame(frame, consumed) = codec::decode(&buf) {
            buf.advance_consumed(consumed);
            return frame;
        }
    }
}

// `bytes::BytesMut` doesn't expose `advance_consumed`; provide it locally so
// the test harness reads exactly one frame at a time without pulling in the
// full `decode_all` drain loop.
trait AdvanceConsumed {
    fn advance_consumed(&mut self, n: usize);
}

impl AdvanceConsumed for bytes::BytesMut {
    fn advance_consumed(&mut self, n: usize) {
        bytes::Buf::advance(self, n);
    }
}

#[tokio::test]
async fn connect_then_publish_round_trip() {
    let (addr, listener) = bind_mock().await;

    let broker = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        let conn_frame = read_frame(&mut socket).await;
        assert_eq!(conn_frame.packet_type.to_byte(), PacketType::Conn.to_byte());
        assert_eq!(&conn_frame.payload[..], b"alice");
        let connack = codec::encode(PacketType::ConnAck, 0, b"ok").unwrap();
        socket.write_all(&connack).await.unwrap();

        let pub_frame = read_frame(&mut socket).await;
        assert_eq!(pub_frame.packet_type.to_byte(), PacketType::Pub.to_byte());
        // topic_len:u8 | topic_json | message
        let topic_len = pub_frame.payload[0] as usize;
        let topic_json = &pub_frame.payload[1..1 + topic_len];
        let topic: String = serde_json::from_slice(topic_json).unwrap();
        assert_eq!(topic, "alice/weather");
        let message = &pub_frame.payload[1 + topic_len..];
        assert_eq!(message, b"{\"temp\":21}");

        tokio::time::sleep(Duration::from_millis(100)).await;
    });

    let connection = Arc::new(
        Connection::connect(&addr.ip().to_string(), addr.port(), "alice", Duration::from_secs(1))
            .await
            .unwrap(),
    );
    assert_eq!(connection.state(), ConnectionState::Connected);

    let pubsub = PubSub::new(connection.clone(), "alice".to_string(), Arc::new(SqliteStore::open_in_memory().unwrap()));
    // `publish` is fire-and-forget (the broker never acks PUB); this returns
    // as soon as the frame is written, and the mock broker's own read of it
    // is what synchronizes the test.
    pubsub
        .publish("weather", b"{\"temp\":21}")
        .await
        .expect("publish should succeed once the frame is written");

    broker.await.unwrap();
}

#[tokio::test]
async fn subscribe_then_unsubscribe_round_trip() {
    let (addr, listener) = bind_mock().await;

    let broker = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        let _conn = read_frame(&mut socket).await;
        let connack = codec::encode(PacketType::ConnAck, 0, b"ok").unwrap();
        socket.write_all(&connack).await.unwrap();

        let sub_frame = read_frame(&mut socket).await;
        assert_eq!(sub_frame.packet_type.to_byte(), PacketType::Sub.to_byte());
        let topics: Vec<String> = serde_json::from_slice(&sub_frame.payload).unwrap();
        assert_eq!(topics, vec!["bob/weather".to_string()]);

        let unsub_frame = read_frame(&mut socket).await;
        assert_eq!(unsub_frame.packet_type.to_byte(), PacketType::Unsub.to_byte());

        tokio::time::sleep(Duration::from_millis(100)).await;
    });

    let connection = Arc::new(
        Connection::connect(&addr.ip().to_string(), addr.port(), "alice", Duration::from_secs(1))
            .await
            .unwrap(),
    );
    let pubsub = PubSub::new(connection.clone(), "alice".to_string(), Arc::new(SqliteStore::open_in_memory().unwrap()));

    // Neither call waits for an ack; the mock broker's reads provide the
    // test's synchronization instead.
    pubsub.subscribe("weather", "bob").await.unwrap();
    pubsub.unsubscribe("weather", "bob").await.unwrap();

    broker.await.unwrap();
}

#[tokio::test]
async fn inbound_publish_is_dispatched_to_registered_handler() {
    let (addr, listener) = bind_mock().await;

    let broker = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let _conn = read_frame(&mut socket).await;
        let connack = codec::encode(PacketType::ConnAck, 0, b"ok").unwrap();
        socket.write_all(&connack).await.unwrap();

        // Push an unsolicited PUB for "bob/weather" with a single-element
        // JSON-array topic, exercising the normalization path.
        let topic_json = serde_json::to_vec(&["bob/weather"]).unwrap();
        let mut payload = vec![topic_json.len() as u8];
        payload.extend_from_slice(&topic_json);
        payload.extend_from_slice(b"{\"temp\":19}");
        let pub_frame = codec::encode(PacketType::Pub, 0, &payload).unwrap();
        socket.write_all(&pub_frame).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let connection = Arc::new(
        Connection::connect(&addr.ip().to_string(), addr.port(), "alice", Duration::from_secs(1))
            .await
            .unwrap(),
    );
    let pubsub = PubSub::new(connection.clone(), "alice".to_string(), Arc::new(SqliteStore::open_in_memory().unwrap()));

    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    pubsub.on_topic(
        "bob/weather",
        Box::new(move |message: bytes::Bytes| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(message);
            }
        }),
    );

    let message = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("handler should fire before the timeout")
        .unwrap();
    assert_eq!(&message[..], b"{\"temp\":19}");

    broker.await.unwrap();
}

/// S3 — admin request rejected with `ALREADY_HAS_ADMIN`: the broker answers
/// a submitted `request_admin` with `ADMIN_REQ_ACK` flags=1 and a JSON error
/// body; the registered callback must see `(false, message, error_code,
/// topic_name)` pulled out of that body.
#[tokio::test]
async fn admin_request_rejected_with_already_has_admin() {
    let (addr, listener) = bind_mock().await;

    let broker = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let _conn = read_frame(&mut socket).await;
        let connack = codec::encode(PacketType::ConnAck, 0, b"ok").unwrap();
        socket.write_all(&connack).await.unwrap();

        // request_admin publishes straight to "<owner_id>/admin".
        let pub_frame = read_frame(&mut socket).await;
        assert_eq!(pub_frame.packet_type.to_byte(), PacketType::Pub.to_byte());
        let topic_len = pub_frame.payload[0] as usize;
        let topic: String = serde_json::from_slice(&pub_frame.payload[1..1 + topic_len]).unwrap();
        assert_eq!(topic, "alice/admin");

        let body = serde_json::to_vec(&serde_json::json!({
            "error_code": "ALREADY_HAS_ADMIN",
            "error_message": "weather already has an administrator",
            "topic_name": "weather",
        }))
        .unwrap();
        let ack = codec::encode(PacketType::AdminReqAck, 1, &body).unwrap();
        socket.write_all(&ack).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
    });

    let connection = Arc::new(
        Connection::connect(&addr.ip().to_string(), addr.port(), "bob", Duration::from_secs(1))
            .await
            .unwrap(),
    );
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let pubsub = Arc::new(PubSub::new(connection.clone(), "bob".to_string(), store.clone()));
    let das = Arc::new(Das::new("/dev/null", 9600, store));
    let delegation = Arc::new(Delegation::new(connection.clone(), pubsub.clone(), das, "bob"));
    delegation.spawn_notification_dispatch();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    delegation
        .request_admin(
            "weather",
            "alice",
            Box::new(move |success, message, error_code, topic_name| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send((success, message, error_code, topic_name));
                }
            }),
        )
        .await
        .unwrap();

    let (success, message, error_code, topic_name) = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("callback should fire before the timeout")
        .unwrap();
    assert!(!success);
    assert_eq!(error_code, "ALREADY_HAS_ADMIN");
    assert_eq!(topic_name, "weather");
    assert_eq!(message, "weather already has an administrator");

    broker.await.unwrap();
}

/// S4 — remote command path: `send_sensor_command` publishes a `PUB` frame
/// to `"<client_id>/system/admin/config"` carrying the exact JSON shape
/// described in the spec. The owner-side forwarding half (receiving on
/// `"<client_id>/admin_notifications"` and writing to the serial device) is
/// exercised separately below against the activable gate, since there is no
/// in-process mock for a real `serialport` device; `Das::send_command`
/// against an unopened port fails with `SerialNotOpen`, which
/// `Delegation::forward_command` logs and swallows, matching its documented
/// best-effort behavior.
#[tokio::test]
async fn send_sensor_command_publishes_expected_envelope() {
    let (addr, listener) = bind_mock().await;

    let broker = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let _conn = read_frame(&mut socket).await;
        let connack = codec::encode(PacketType::ConnAck, 0, b"ok").unwrap();
        socket.write_all(&connack).await.unwrap();

        let pub_frame = read_frame(&mut socket).await;
        assert_eq!(pub_frame.packet_type.to_byte(), PacketType::Pub.to_byte());
        let topic_len = pub_frame.payload[0] as usize;
        let topic: String = serde_json::from_slice(&pub_frame.payload[1..1 + topic_len]).unwrap();
        assert_eq!(topic, "bob/system/admin/config");

        let message = &pub_frame.payload[1 + topic_len..];
        let body: serde_json::Value = serde_json::from_slice(message).unwrap();
        assert_eq!(body["command"], "set_sensor");
        assert_eq!(body["topic_name"], "fan_room");
        assert_eq!(body["sensor_name"], "fan");
        assert_eq!(body["active"], true);
        assert_eq!(body["sender_id"], "bob");

        tokio::time::sleep(Duration::from_millis(100)).await;
    });

    let connection = Arc::new(
        Connection::connect(&addr.ip().to_string(), addr.port(), "bob", Duration::from_secs(1))
            .await
            .unwrap(),
    );
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let pubsub = Arc::new(PubSub::new(connection.clone(), "bob".to_string(), store.clone()));
    let das = Arc::new(Das::new("/dev/null", 9600, store));
    let delegation = Delegation::new(connection.clone(), pubsub.clone(), das, "bob");

    delegation
        .send_sensor_command("fan_room", "alice", "fan", true)
        .await
        .unwrap();

    broker.await.unwrap();
}

/// S4 (owner side) — the forwarded command envelope carries no `topic_name`
/// (see spec §4.G), so the activable gate is keyed by sensor name alone.
/// The gate's actual drop/forward decision is covered directly against
/// `Delegation`'s private `activable` set in `delegation`'s own unit tests
/// (no in-process mock exists for a real `serialport` device, so the DAS
/// side of the forward can't be observed from here); this test instead
/// checks the half that *is* observable end-to-end: `mark_activable`
/// publishes the declaration envelope the broker needs to accept the
/// command from other admins, and processing an unmarked command's
/// notification does not panic.
#[tokio::test]
async fn mark_activable_publishes_declaration_envelope() {
    let (addr, listener) = bind_mock().await;
    let broker = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let _conn = read_frame(&mut socket).await;
        let connack = codec::encode(PacketType::ConnAck, 0, b"ok").unwrap();
        socket.write_all(&connack).await.unwrap();

        let pub_frame = read_frame(&mut socket).await;
        assert_eq!(pub_frame.packet_type.to_byte(), PacketType::Pub.to_byte());
        let topic_len = pub_frame.payload[0] as usize;
        let topic: String = serde_json::from_slice(&pub_frame.payload[1..1 + topic_len]).unwrap();
        assert_eq!(topic, "alice/system/admin/sensor_activable");
        let message = &pub_frame.payload[1 + topic_len..];
        let body: serde_json::Value = serde_json::from_slice(message).unwrap();
        assert_eq!(body["topic_name"], "fan_room");
        assert_eq!(body["sensor_name"], "fan");
        assert_eq!(body["activable"], true);

        tokio::time::sleep(Duration::from_millis(100)).await;
    });

    let connection = Arc::new(
        Connection::connect(&addr.ip().to_string(), addr.port(), "alice", Duration::from_secs(1))
            .await
            .unwrap(),
    );
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let pubsub = Arc::new(PubSub::new(connection.clone(), "alice".to_string(), store.clone()));
    let das = Arc::new(Das::new("/dev/null", 9600, store));
    let delegation = Delegation::new(connection.clone(), pubsub.clone(), das, "alice");

    delegation.mark_activable("fan_room", "fan", true).await.unwrap();

    let unmarked = bytes::Bytes::from(
        serde_json::to_vec(&serde_json::json!({
            "command": "set_sensor",
            "sensor_name": "heater",
            "active": true,
        }))
        .unwrap(),
    );
    delegation.handle_admin_notifications_topic(unmarked);

    broker.await.unwrap();
}

/// S6 — correlation timeout: a correlated request with no broker response
/// times out after clearing the outstanding waiter, and a subsequent
/// request on the same expected type succeeds once a reply does arrive.
#[tokio::test]
async fn correlation_times_out_then_recovers() {
    let (addr, listener) = bind_mock().await;

    let broker = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let _conn = read_frame(&mut socket).await;
        let connack = codec::encode(PacketType::ConnAck, 0, b"ok").unwrap();
        socket.write_all(&connack).await.unwrap();

        // First MyAdminTopicsReq: never answered.
        let _first = read_frame(&mut socket).await;

        // Second MyAdminTopicsReq: answered immediately.
        let _second = read_frame(&mut socket).await;
        let body = serde_json::to_vec(&Vec::<serde_json::Value>::new()).unwrap();
        let resp = codec::encode(PacketType::MyAdminTopicsResp, 0, &body).unwrap();
        socket.write_all(&resp).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
    });

    let connection = Arc::new(
        Connection::connect(&addr.ip().to_string(), addr.port(), "bob", Duration::from_secs(1))
            .await
            .unwrap(),
    );

    let err = connection
        .request(
            Frame::new(PacketType::MyAdminTopicsReq, 0, Vec::new()),
            PacketType::MyAdminTopicsResp,
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), tinymq_client::TinyMqErrorKind::RequestTimeout(_)));

    let (_flags, payload) = connection
        .request(
            Frame::new(PacketType::MyAdminTopicsReq, 0, Vec::new()),
            PacketType::MyAdminTopicsResp,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    let topics: Vec<serde_json::Value> = serde_json::from_slice(&payload).unwrap();
    assert!(topics.is_empty());

    broker.await.unwrap();
}
