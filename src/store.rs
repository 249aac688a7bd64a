// Copyright (c) TinyMQ contributors.
// Licensed under the MIT License.

//! The local store: durable tables for identity, sensors, readings, topics,
//! subscriptions, and subscription history (spec §3, §6). Treated as an
//! opaque, synchronously-atomic-per-call collaborator by the rest of the
//! crate; this module provides the one concrete implementation, backed by
//! SQLite via `rusqlite`, matching the original `tinymq.db` schema.

use std::sync::Mutex;

use log::debug;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, TinyMqErrorKind};
use crate::model::{Reading, Sensor, Subscription, SubscriptionDatum, Topic};

/// Synchronous operations the rest of the crate depends on. Implementations
/// must be atomic per call; the default [`SqliteStore`] uses short
/// transactions internally.
pub trait LocalStore: Send + Sync {
    /// Returns the configured client id, if set.
    fn get_client_id(&self) -> Result<Option<String>>;
    /// Sets the client id.
    fn set_client_id(&self, client_id: &str) -> Result<()>;
    /// Returns client metadata as a JSON object string, if set.
    fn get_client_metadata(&self) -> Result<Option<String>>;
    /// Sets client metadata from a JSON object string.
    fn set_client_metadata(&self, metadata_json: &str) -> Result<()>;
    /// Returns the configured broker host, if set.
    fn get_broker_host(&self) -> Result<Option<String>>;
    /// Sets the broker host.
    fn set_broker_host(&self, host: &str) -> Result<()>;
    /// Returns the configured broker port, if set.
    fn get_broker_port(&self) -> Result<Option<u16>>;
    /// Sets the broker port.
    fn set_broker_port(&self, port: u16) -> Result<()>;

    /// Records a reading, creating the sensor row lazily and updating
    /// `last_value`/`last_updated` (spec Invariant 1).
    fn add_reading(&self, name: &str, value: &str, timestamp: i64, units: &str) -> Result<()>;
    /// Lists all known sensors.
    fn get_sensors(&self) -> Result<Vec<Sensor>>;
    /// Looks up a sensor by row id or by name.
    fn get_sensor(&self, id_or_name: &str) -> Result<Option<Sensor>>;
    /// Lists readings for a named sensor, most recent first, optionally
    /// bounded by `[start, end)` unix-second timestamps.
    fn get_readings(
        &self,
        name: &str,
        limit: u32,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<Reading>>;

    /// Creates a topic with the given publish flag.
    fn create_topic(&self, name: &str, publish: bool) -> Result<Topic>;
    /// Lists all topics.
    fn get_topics(&self) -> Result<Vec<Topic>>;
    /// Looks up a topic by row id or by name.
    fn get_topic(&self, id_or_name: &str) -> Result<Option<Topic>>;
    /// Sets a topic's publish flag.
    fn set_topic_publish(&self, name: &str, publish: bool) -> Result<()>;
    /// Adds a sensor to a topic's membership set.
    fn add_sensor_to_topic(&self, topic: &str, sensor: &str) -> Result<()>;
    /// Removes a sensor from a topic's membership set.
    fn remove_sensor_from_topic(&self, topic: &str, sensor: &str) -> Result<()>;
    /// Lists the sensor names belonging to a topic.
    fn get_topic_sensors(&self, topic: &str) -> Result<Vec<String>>;
    /// Lists topics currently marked for publishing.
    fn get_published_topics(&self) -> Result<Vec<Topic>>;

    /// Adds (or no-ops, idempotently) an active subscription to `topic`
    /// published by `source_client_id` (spec Invariant 2).
    fn add_subscription(&self, topic: &str, source_client_id: &str) -> Result<()>;
    /// Removes the active subscription for `(topic, source_client_id)`.
    fn remove_subscription(&self, topic: &str, source_client_id: &str) -> Result<()>;
    /// Lists all active subscriptions.
    fn get_subscriptions(&self) -> Result<Vec<Subscription>>;
    /// Appends a received payload against the matching subscription.
    fn add_subscription_data(
        &self,
        topic: &str,
        source_client_id: &str,
        timestamp: i64,
        json_string: &str,
    ) -> Result<()>;
    /// Lists the most recent subscription data for `(topic, source_client_id)`.
    fn get_subscription_data(
        &self,
        topic: &str,
        source_client_id: &str,
        limit: u32,
    ) -> Result<Vec<SubscriptionDatum>>;
}

/// SQLite-backed implementation of [`LocalStore`], matching the schema of
/// the original Python client's `tinymq.db` module.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if needed) a store at `path`, ensuring all tables exist.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Opens a private in-memory store, primarily for tests.
    ///
    /// # Errors
    /// Returns an error if the in-memory database cannot be migrated.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT
            );
            CREATE TABLE IF NOT EXISTS sensors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL,
                last_value TEXT,
                last_updated INTEGER
            );
            CREATE TABLE IF NOT EXISTS readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sensor_id INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                value TEXT,
                units TEXT,
                FOREIGN KEY(sensor_id) REFERENCES sensors(id)
            );
            CREATE TABLE IF NOT EXISTS topics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL,
                publish BOOLEAN NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS topic_sensors (
                topic_id INTEGER NOT NULL,
                sensor_id INTEGER NOT NULL,
                PRIMARY KEY (topic_id, sensor_id),
                FOREIGN KEY(topic_id) REFERENCES topics(id),
                FOREIGN KEY(sensor_id) REFERENCES sensors(id)
            );
            CREATE TABLE IF NOT EXISTS subscriptions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic TEXT NOT NULL,
                source_client_id TEXT NOT NULL,
                active BOOLEAN NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS subscription_data (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subscription_id INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                data TEXT,
                FOREIGN KEY(subscription_id) REFERENCES subscriptions(id)
            );
            ",
        )?;
        Ok(())
    }

    fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row("SELECT value FROM config WHERE key = ?1", params![key], |r| {
            r.get(0)
        })
        .optional()
        .map_err(Into::into)
    }

    fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

impl LocalStore for SqliteStore {
    fn get_client_id(&self) -> Result<Option<String>> {
        self.get_config("client_id")
    }

    fn set_client_id(&self, client_id: &str) -> Result<()> {
        self.set_config("client_id", client_id)
    }

    fn get_client_metadata(&self) -> Result<Option<String>> {
        self.get_config("client_metadata")
    }

    fn set_client_metadata(&self, metadata_json: &str) -> Result<()> {
        self.set_config("client_metadata", metadata_json)
    }

    fn get_broker_host(&self) -> Result<Option<String>> {
        self.get_config("broker_host")
    }

    fn set_broker_host(&self, host: &str) -> Result<()> {
        self.set_config("broker_host", host)
    }

    fn get_broker_port(&self) -> Result<Option<u16>> {
        Ok(self
            .get_config("broker_port")?
            .and_then(|v| v.parse().ok()))
    }

    fn set_broker_port(&self, port: u16) -> Result<()> {
        self.set_config("broker_port", &port.to_string())
    }

    fn add_reading(&self, name: &str, value: &str, timestamp: i64, units: &str) -> Result<()> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO sensors (name, last_value, last_updated) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET last_value = excluded.last_value, last_updated = excluded.last_updated
             WHERE excluded.last_updated >= sensors.last_updated",
            params![name, value, timestamp],
        )?;
        let sensor_id: i64 = tx.query_row(
            "SELECT id FROM sensors WHERE name = ?1",
            params![name],
            |r| r.get(0),
        )?;
        tx.execute(
            "INSERT INTO readings (sensor_id, timestamp, value, units) VALUES (?1, ?2, ?3, ?4)",
            params![sensor_id, timestamp, value, units],
        )?;
        tx.commit()?;
        debug!("stored reading {name}={value}{units} @ {timestamp}");
        Ok(())
    }

    fn get_sensors(&self) -> Result<Vec<Sensor>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare("SELECT id, name, last_value, last_updated FROM sensors")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(Sensor {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    last_value: r.get(2)?,
                    last_updated: r.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn get_sensor(&self, id_or_name: &str) -> Result<Option<Sensor>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let by_name = conn
            .query_row(
                "SELECT id, name, last_value, last_updated FROM sensors WHERE name = ?1",
                params![id_or_name],
                |r| {
                    Ok(Sensor {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        last_value: r.get(2)?,
                        last_updated: r.get(3)?,
                    })
                },
            )
            .optional()?;
        if by_name.is_some() {
            return Ok(by_name);
        }
        if let Ok(id) = id_or_name.parse::<i64>() {
            return conn
                .query_row(
                    "SELECT id, name, last_value, last_updated FROM sensors WHERE id = ?1",
                    params![id],
                    |r| {
                        Ok(Sensor {
                            id: r.get(0)?,
                            name: r.get(1)?,
                            last_value: r.get(2)?,
                            last_updated: r.get(3)?,
                        })
                    },
                )
                .optional()
                .map_err(Into::into);
        }
        Ok(None)
    }

    fn get_readings(
        &self,
        name: &str,
        limit: u32,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<Reading>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let sensor_id: Option<i64> = conn
            .query_row("SELECT id FROM sensors WHERE name = ?1", params![name], |r| {
                r.get(0)
            })
            .optional()?;
        let Some(sensor_id) = sensor_id else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare(
            "SELECT sensor_id, timestamp, value, units FROM readings
             WHERE sensor_id = ?1
               AND (?2 IS NULL OR timestamp >= ?2)
               AND (?3 IS NULL OR timestamp < ?3)
             ORDER BY timestamp DESC
             LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(params![sensor_id, start, end, limit], |r| {
                Ok(Reading {
                    sensor_id: r.get(0)?,
                    timestamp: r.get(1)?,
                    value: r.get(2)?,
                    units: r.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn create_topic(&self, name: &str, publish: bool) -> Result<Topic> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO topics (name, publish) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET publish = excluded.publish",
            params![name, publish],
        )?;
        conn.query_row(
            "SELECT id, name, publish FROM topics WHERE name = ?1",
            params![name],
            |r| {
                Ok(Topic {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    publish: r.get(2)?,
                })
            },
        )
        .map_err(Into::into)
    }

    fn get_topics(&self) -> Result<Vec<Topic>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare("SELECT id, name, publish FROM topics")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(Topic {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    publish: r.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn get_topic(&self, id_or_name: &str) -> Result<Option<Topic>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let by_name = conn
            .query_row(
                "SELECT id, name, publish FROM topics WHERE name = ?1",
                params![id_or_name],
                |r| {
                    Ok(Topic {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        publish: r.get(2)?,
                    })
                },
            )
            .optional()?;
        if by_name.is_some() {
            return Ok(by_name);
        }
        if let Ok(id) = id_or_name.parse::<i64>() {
            return conn
                .query_row(
                    "SELECT id, name, publish FROM topics WHERE id = ?1",
                    params![id],
                    |r| {
                        Ok(Topic {
                            id: r.get(0)?,
                            name: r.get(1)?,
                            publish: r.get(2)?,
                        })
                    },
                )
                .optional()
                .map_err(Into::into);
        }
        Ok(None)
    }

    fn set_topic_publish(&self, name: &str, publish: bool) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE topics SET publish = ?2 WHERE name = ?1",
            params![name, publish],
        )?;
        Ok(())
    }

    fn add_sensor_to_topic(&self, topic: &str, sensor: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let topic_id: i64 = conn.query_row(
            "SELECT id FROM topics WHERE name = ?1",
            params![topic],
            |r| r.get(0),
        )?;
        let sensor_id: i64 = conn.query_row(
            "SELECT id FROM sensors WHERE name = ?1",
            params![sensor],
            |r| r.get(0),
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO topic_sensors (topic_id, sensor_id) VALUES (?1, ?2)",
            params![topic_id, sensor_id],
        )?;
        Ok(())
    }

    fn remove_sensor_from_topic(&self, topic: &str, sensor: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "DELETE FROM topic_sensors
             WHERE topic_id = (SELECT id FROM topics WHERE name = ?1)
               AND sensor_id = (SELECT id FROM sensors WHERE name = ?2)",
            params![topic, sensor],
        )?;
        Ok(())
    }

    fn get_topic_sensors(&self, topic: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT s.name FROM topic_sensors ts
             JOIN sensors s ON s.id = ts.sensor_id
             JOIN topics t ON t.id = ts.topic_id
             WHERE t.name = ?1",
        )?;
        let rows = stmt
            .query_map(params![topic], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn get_published_topics(&self) -> Result<Vec<Topic>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare("SELECT id, name, publish FROM topics WHERE publish = 1")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(Topic {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    publish: r.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn add_subscription(&self, topic: &str, source_client_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM subscriptions WHERE topic = ?1 AND source_client_id = ?2 AND active = 1",
                params![topic, source_client_id],
                |r| r.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(());
        }
        conn.execute(
            "INSERT INTO subscriptions (topic, source_client_id, active) VALUES (?1, ?2, 1)",
            params![topic, source_client_id],
        )?;
        Ok(())
    }

    fn remove_subscription(&self, topic: &str, source_client_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE subscriptions SET active = 0 WHERE topic = ?1 AND source_client_id = ?2 AND active = 1",
            params![topic, source_client_id],
        )?;
        Ok(())
    }

    fn get_subscriptions(&self) -> Result<Vec<Subscription>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, topic, source_client_id, active FROM subscriptions WHERE active = 1",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(Subscription {
                    id: r.get(0)?,
                    topic_name: r.get(1)?,
                    source_client_id: r.get(2)?,
                    active: r.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn add_subscription_data(
        &self,
        topic: &str,
        source_client_id: &str,
        timestamp: i64,
        json_string: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let subscription_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM subscriptions WHERE topic = ?1 AND source_client_id = ?2 AND active = 1",
                params![topic, source_client_id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(subscription_id) = subscription_id else {
            return Err(TinyMqErrorKind::Encoding(format!(
                "no active subscription for topic '{topic}' from '{source_client_id}'"
            ))
            .into());
        };
        conn.execute(
            "INSERT INTO subscription_data (subscription_id, timestamp, data) VALUES (?1, ?2, ?3)",
            params![subscription_id, timestamp, json_string],
        )?;
        Ok(())
    }

    fn get_subscription_data(
        &self,
        topic: &str,
        source_client_id: &str,
        limit: u32,
    ) -> Result<Vec<SubscriptionDatum>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT sd.subscription_id, sd.timestamp, sd.data
             FROM subscription_data sd
             JOIN subscriptions s ON s.id = sd.subscription_id
             WHERE s.topic = ?1 AND s.source_client_id = ?2
             ORDER BY sd.timestamp DESC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![topic, source_client_id, limit], |r| {
                Ok(SubscriptionDatum {
                    subscription_id: r.get(0)?,
                    timestamp: r.get(1)?,
                    raw_json: r.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
