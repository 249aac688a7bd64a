// Copyright (c) TinyMQ contributors.
// Licensed under the MIT License.

//! Client configuration and the wired-together runtime context (spec §6, §9).
//!
//! [`ClientContext`] replaces the original client's module-level global
//! state with an explicit, owned value: every collaborator is reached
//! through it rather than through statics.

use std::sync::Arc;
use std::time::Duration;

use derive_builder::Builder;
use log::{info, warn};

use crate::connection::Connection;
use crate::das::Das;
use crate::delegation::Delegation;
use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::pubsub::PubSub;
use crate::store::{LocalStore, SqliteStore};

/// Default baud rate for the serial acquisition device.
pub const DEFAULT_SERIAL_BAUD: u32 = 115_200;

/// Static configuration for a [`ClientContext`].
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct ClientConfig {
    /// This client's identity, used in `CONN` and as the default publish namespace.
    pub client_id: String,
    /// Broker hostname or address.
    pub broker_host: String,
    /// Broker TCP port.
    #[builder(default = "1883")]
    pub broker_port: u16,
    /// Path to the local SQLite store file.
    #[builder(default = "\"tinymq.db\".to_string()")]
    pub store_path: String,
    /// Serial device path for the acquisition service, e.g. `/dev/ttyUSB0`.
    pub serial_port: String,
    /// Serial baud rate.
    #[builder(default = "DEFAULT_SERIAL_BAUD")]
    pub serial_baud: u32,
    /// Timeout applied to every correlated request/response exchange.
    #[builder(default = "Duration::from_secs(5)")]
    pub correlation_timeout: Duration,
    /// Polling interval used by the DAS's USB watcher.
    #[builder(default = "Duration::from_secs(1)")]
    pub usb_poll_interval: Duration,
    /// Whether the DAS should auto-retry via the USB watcher on serial error.
    #[builder(default = "true")]
    pub auto_retry_serial: bool,
}

/// The fully wired-together client runtime: connection, store, DAS,
/// pub/sub surface, delegation subsystem, and publish orchestrator.
pub struct ClientContext {
    config: ClientConfig,
    connection: Arc<Connection>,
    store: Arc<dyn LocalStore>,
    das: Arc<Das>,
    pubsub: Arc<PubSub>,
    delegation: Arc<Delegation>,
    orchestrator: Arc<Orchestrator>,
}

impl ClientContext {
    /// Connects to the broker and wires together every collaborator
    /// described by `config`. Starts the DAS and refreshes the publish
    /// orchestrator once wiring completes.
    ///
    /// # Errors
    /// Returns an error if the local store cannot be opened, the broker
    /// connection cannot be established, or the `CONNACK` handshake fails.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::open(&config.store_path)?);
        let connection = Arc::new(
            Connection::connect(
                &config.broker_host,
                config.broker_port,
                &config.client_id,
                config.correlation_timeout,
            )
            .await?,
        );
        let das = Arc::new(Das::new(config.serial_port.clone(), config.serial_baud, store.clone()));
        if !das.start(config.auto_retry_serial) {
            warn!(
                "DAS failed to open serial port '{}' on first attempt; retrying in background",
                config.serial_port
            );
        }

        let pubsub = Arc::new(PubSub::new(connection.clone(), config.client_id.clone(), store.clone()));
        let delegation = Arc::new(Delegation::new(
            connection.clone(),
            pubsub.clone(),
            das.clone(),
            config.client_id.clone(),
        ));
        delegation.spawn_notification_dispatch();

        let admin_notifications_topic = format!("{}/admin_notifications", config.client_id);
        let delegation_for_topic = delegation.clone();
        pubsub.on_topic(
            admin_notifications_topic,
            Box::new(move |payload: bytes::Bytes| {
                delegation_for_topic.handle_admin_notifications_topic(payload);
            }),
        );
        pubsub.subscribe("admin_notifications", &config.client_id).await?;

        let orchestrator = Arc::new(Orchestrator::new(store.clone(), das.clone(), pubsub.clone()));
        orchestrator.refresh()?;

        info!("client context ready for '{}'", config.client_id);
        Ok(Self {
            config,
            connection,
            store,
            das,
            pubsub,
            delegation,
            orchestrator,
        })
    }

    /// Returns the configuration this context was built from.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the shared connection handle.
    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Returns the shared local store handle.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Returns the shared DAS handle.
    #[must_use]
    pub fn das(&self) -> &Arc<Das> {
        &self.das
    }

    /// Returns the shared pub/sub surface.
    #[must_use]
    pub fn pubsub(&self) -> &Arc<PubSub> {
        &self.pubsub
    }

    /// Returns the shared delegation subsystem.
    #[must_use]
    pub fn delegation(&self) -> &Arc<Delegation> {
        &self.delegation
    }

    /// Returns the shared publish orchestrator. Call
    /// [`Orchestrator::refresh`] on it after mutating a topic's publish flag
    /// or sensor membership.
    #[must_use]
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Disconnects from the broker and stops the DAS.
    pub async fn shutdown(&self) {
        self.das.stop();
        self.connection.disconnect().await;
    }
}
