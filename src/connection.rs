// Copyright (c) TinyMQ contributors.
// Licensed under the MIT License.

//! The connection engine: one TCP connection to the broker, a dedicated
//! reader task, a serialized writer, and state observation (spec §4.D).

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};

use crate::codec::{self, Frame, PacketType};
use crate::correlation::{self, CorrelationTable};
use crate::error::{Result, TinyMqErrorKind};

/// Observable lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The TCP handshake and `CONN`/`CONNACK` exchange have not completed.
    Connecting,
    /// The connection is open and usable.
    Connected,
    /// The connection has closed, either explicitly or due to an I/O error.
    Disconnected,
}

/// Default timeout used while awaiting the broker's `CONNACK`.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Size of the broadcast channel used to fan out unsolicited ("pushed")
/// frames to higher-level subsystems (pub/sub dispatch, delegation
/// notifications). Slow subscribers drop the oldest frame rather than
/// blocking the reader task.
const PUSH_CHANNEL_CAPACITY: usize = 256;

/// A single, managed connection to a TinyMQ broker.
///
/// Holds a serialized write half, a shared correlation table, a state
/// channel, and a broadcast channel of frames not claimed by any
/// outstanding correlated request.
pub struct Connection {
    write_half: Arc<AsyncMutex<OwnedWriteHalf>>,
    correlation: Arc<CorrelationTable>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    push_tx: broadcast::Sender<Frame>,
}

impl Connection {
    /// Opens a TCP connection to `host:port`, sends `CONN` with `client_id`,
    /// and waits up to `connect_timeout` for `CONNACK`.
    ///
    /// # Errors
    /// Returns an error if the TCP connection cannot be established, the
    /// handshake fails, or no `CONNACK` arrives within `connect_timeout`.
    pub async fn connect(
        host: &str,
        port: u16,
        client_id: &str,
        connect_timeout: Duration,
    ) -> Result<Self> {
        info!("connecting to broker at {host}:{port} as '{client_id}'");
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();

        let correlation = Arc::new(CorrelationTable::new());
        let (push_tx, _push_rx) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let conn = Self {
            write_half: Arc::new(AsyncMutex::new(write_half)),
            correlation: correlation.clone(),
            state_tx: state_tx.clone(),
            state_rx,
            push_tx: push_tx.clone(),
        };

        let connack_rx = correlation.register(PacketType::ConnAck);
        spawn_reader(read_half, correlation, push_tx, state_tx.clone());

        conn.send(Frame::new(PacketType::Conn, 0, client_id.as_bytes().to_vec()))
            .await?;

        match correlation::await_response(connack_rx, PacketType::ConnAck, connect_timeout).await {
            Ok(_payload) => {
                let _ = conn.state_tx.send(ConnectionState::Connected);
                info!("connected to broker at {host}:{port}");
                Ok(conn)
            }
            Err(err) => {
                let _ = conn.state_tx.send(ConnectionState::Disconnected);
                if matches!(err.kind(), TinyMqErrorKind::RequestTimeout(_)) {
                    Err(TinyMqErrorKind::ConnectTimeout.into())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Sends a frame under the serialized write lock.
    ///
    /// # Errors
    /// Returns an error if the connection is not open or the write fails.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        let bytes = codec::encode(frame.packet_type, frame.flags, &frame.payload)?;
        let mut write_half = self.write_half.lock().await;
        write_half.write_all(&bytes).await?;
        Ok(())
    }

    /// Registers a correlated request, sends its frame, and awaits the
    /// matching response.
    ///
    /// # Errors
    /// Returns an error if the send fails, the waiter is replaced by a newer
    /// request of the same expected type, the connection is lost, or no
    /// response arrives within `request_timeout`.
    pub async fn request(
        &self,
        frame: Frame,
        expected_type: PacketType,
        request_timeout: Duration,
    ) -> Result<(u8, bytes::Bytes)> {
        let rx = self.correlation.register(expected_type);
        self.send(frame).await?;
        correlation::await_response(rx, expected_type, request_timeout).await
    }

    /// Subscribes to frames not claimed by any outstanding correlated
    /// request (e.g. `PUB`, `ADMIN_NOTIFY`, `ADMIN_RESULT`, `SENSOR_STATUS_RESP`).
    #[must_use]
    pub fn subscribe_pushes(&self) -> broadcast::Receiver<Frame> {
        self.push_tx.subscribe()
    }

    /// Returns a watch receiver over the connection's lifecycle state.
    #[must_use]
    pub fn observe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Closes the write half and marks the connection disconnected. Safe to
    /// call from within the reader task's own dispatch path (it does not
    /// join the reader task).
    pub async fn disconnect(&self) {
        let mut write_half = self.write_half.lock().await;
        let _ = write_half.shutdown().await;
        let _ = self.state_tx.send(ConnectionState::Disconnected);
        self.correlation.fail_all_connection_lost();
    }
}

fn spawn_reader(
    mut read_half: OwnedReadHalf,
    correlation: Arc<CorrelationTable>,
    push_tx: broadcast::Sender<Frame>,
    state_tx: watch::Sender<ConnectionState>,
) {
    tokio::spawn(async move {
        use tokio::io::AsyncReadExt;

        let mut buf = BytesMut::with_capacity(4096);
        loop {
            match read_half.read_buf(&mut buf).await {
                Ok(0) => {
                    info!("broker closed the connection");
                    break;
                }
                Ok(_) => {
                    for frame in codec::decode_all(&mut buf) {
                        dispatch(frame, &correlation, &push_tx);
                    }
                }
                Err(err) => {
                    warn!("connection read error: {err}");
                    break;
                }
            }
        }
        let _ = state_tx.send(ConnectionState::Disconnected);
        correlation.fail_all_connection_lost();
    });
}

fn dispatch(frame: Frame, correlation: &CorrelationTable, push_tx: &broadcast::Sender<Frame>) {
    if correlation.resolve(frame.packet_type, frame.flags, frame.payload.clone()) {
        return;
    }
    match frame.packet_type {
        PacketType::Pub
        | PacketType::AdminNotify
        | PacketType::AdminResult
        | PacketType::SensorStatusResp
        | PacketType::AdminReqAck
        | PacketType::ConnAck => {
            // Send errors mean there are currently no subscribers; the frame
            // is simply dropped, matching broadcast channel semantics.
            let _ = push_tx.send(frame);
        }
        other => {
            debug!("discarding unclaimed frame of type {other:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn spawn_mock_broker() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = [0u8; 256];
            let _ = socket.read(&mut buf).await.unwrap();
            let ack = codec::encode(PacketType::ConnAck, 0, b"ok").unwrap();
            socket.write_all(&ack).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn connect_completes_on_connack() {
        let (addr, _handle) = spawn_mock_broker().await;
        let conn = Connection::connect(&addr.ip().to_string(), addr.port(), "alice", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn connect_times_out_when_broker_is_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let err = Connection::connect(&addr.ip().to_string(), addr.port(), "bob", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), TinyMqErrorKind::ConnectTimeout));
    }
}
