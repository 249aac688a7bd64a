// Copyright (c) TinyMQ contributors.
// Licensed under the MIT License.

//! The serial acquisition service ("DAS"): reads newline-delimited JSON
//! sensor readings from a serial device, persists them, and fans them out
//! to registered callbacks (spec §4.C).

use std::io::{BufRead, BufReader, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::Value;

use crate::error::{Result, TinyMqErrorKind};
use crate::model::SensorEvent;
use crate::store::LocalStore;

/// Time to wait between reopen attempts when a serial error occurs and
/// auto-retry is disabled, matching the original blind retry interval.
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Polling interval for the USB watcher when auto-retry is enabled.
const USB_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A callback invoked with every reading as it is received.
pub type DataCallback = Box<dyn Fn(&SensorEvent) + Send + Sync>;

/// Snapshot of the DAS's running counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DasStats {
    /// Total readings received since `start`.
    pub readings_received: u64,
    /// Whether the acquisition loop is currently running.
    pub running: bool,
}

/// The serial acquisition service.
pub struct Das {
    port_name: String,
    baud_rate: u32,
    store: Arc<dyn LocalStore>,
    callbacks: Arc<StdMutex<Vec<DataCallback>>>,
    running: Arc<AtomicBool>,
    readings_received: Arc<AtomicU64>,
    writer: Arc<StdMutex<Option<Box<dyn serialport::SerialPort>>>>,
}

impl Das {
    /// Builds a DAS bound to `port_name` at `baud_rate`, persisting readings
    /// through `store`.
    #[must_use]
    pub fn new(port_name: impl Into<String>, baud_rate: u32, store: Arc<dyn LocalStore>) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            store,
            callbacks: Arc::new(StdMutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            readings_received: Arc::new(AtomicU64::new(0)),
            writer: Arc::new(StdMutex::new(None)),
        }
    }

    /// Attempts one open of the configured port, then starts the acquisition
    /// loop on a dedicated thread. If that first attempt fails and
    /// `auto_retry` is set, a USB watcher thread is also started, polling the
    /// system's enumerated serial ports every ~1s and attempting to open the
    /// port as soon as it is observed newly present. Without `auto_retry`,
    /// the reader thread blindly retries opening the port every 5s instead.
    ///
    /// Returns `true` if the initial open succeeded.
    pub fn start(&self, auto_retry: bool) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("DAS already running, ignoring start()");
            return true;
        }
        let initial = serialport::new(&self.port_name, self.baud_rate)
            .timeout(Duration::from_secs(1))
            .open();
        let opened = match &initial {
            Ok(_) => true,
            Err(err) => {
                warn!("DAS failed to open serial port {}: {err}", self.port_name);
                false
            }
        };
        spawn_reader_thread(
            self.port_name.clone(),
            self.baud_rate,
            self.store.clone(),
            self.callbacks.clone(),
            self.running.clone(),
            self.readings_received.clone(),
            self.writer.clone(),
            initial.ok(),
            auto_retry,
        );
        if auto_retry {
            spawn_usb_watcher(
                self.port_name.clone(),
                self.baud_rate,
                self.store.clone(),
                self.callbacks.clone(),
                self.running.clone(),
                self.readings_received.clone(),
                self.writer.clone(),
                opened,
            );
        }
        opened
    }

    /// Signals the acquisition loop (and USB watcher, if any) to stop. Does
    /// not block; the reader thread observes the flag on its next poll.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(port) = self.writer.lock().expect("das writer mutex poisoned").take() {
            drop(port);
        }
    }

    /// Sends a JSON command object to the device as a single newline-terminated line.
    ///
    /// # Errors
    /// Returns [`TinyMqErrorKind::SerialNotOpen`] if the device is not
    /// currently open, or a serial I/O error on write failure.
    pub fn send_command(&self, command: &Value) -> Result<()> {
        let mut guard = self.writer.lock().expect("das writer mutex poisoned");
        let Some(port) = guard.as_mut() else {
            return Err(TinyMqErrorKind::SerialNotOpen.into());
        };
        let mut line = serde_json::to_vec(command)?;
        line.push(b'\n');
        port.write_all(&line)?;
        Ok(())
    }

    /// Registers a callback invoked for every reading received.
    pub fn add_data_callback(&self, callback: DataCallback) {
        self.callbacks
            .lock()
            .expect("das callback mutex poisoned")
            .push(callback);
    }

    /// Removes every registered callback. Used by the publish orchestrator's
    /// "clear and reinstall" refresh (spec §4.H).
    pub fn clear_callbacks(&self) {
        self.callbacks
            .lock()
            .expect("das callback mutex poisoned")
            .clear();
    }

    /// Returns current running stats.
    #[must_use]
    pub fn stats(&self) -> DasStats {
        DasStats {
            readings_received: self.readings_received.load(Ordering::SeqCst),
            running: self.running.load(Ordering::SeqCst),
        }
    }
}

/// Runs the acquisition loop. `initial_port`, if given, is already open and
/// used for the first iteration without reopening. Without `auto_retry`, the
/// loop blindly retries opening the port itself every [`RETRY_INTERVAL`]. With
/// `auto_retry`, reopening after the initial port closes is left entirely to
/// the USB watcher (spawned alongside this thread), which only attempts to
/// open the port when it observes it newly present.
#[allow(clippy::too_many_arguments)]
fn spawn_reader_thread(
    port_name: String,
    baud_rate: u32,
    store: Arc<dyn LocalStore>,
    callbacks: Arc<StdMutex<Vec<DataCallback>>>,
    running: Arc<AtomicBool>,
    readings_received: Arc<AtomicU64>,
    writer: Arc<StdMutex<Option<Box<dyn serialport::SerialPort>>>>,
    initial_port: Option<Box<dyn serialport::SerialPort>>,
    auto_retry: bool,
) {
    thread::spawn(move || {
        let mut initial_port = initial_port;
        while running.load(Ordering::SeqCst) {
            let port = if let Some(port) = initial_port.take() {
                Ok(port)
            } else if auto_retry {
                debug!("DAS reader thread for {port_name} deferring reopen to the USB watcher");
                break;
            } else {
                serialport::new(&port_name, baud_rate).timeout(Duration::from_secs(1)).open()
            };
            match port {
                Ok(port) => {
                    info!("DAS opened serial port {port_name} at {baud_rate} baud");
                    if let Ok(clone) = port.try_clone() {
                        *writer.lock().expect("das writer mutex poisoned") = Some(clone);
                    }
                    run_lines(port, &store, &callbacks, &running, &readings_received);
                    *writer.lock().expect("das writer mutex poisoned") = None;
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(err) => {
                    warn!("DAS failed to open serial port {port_name}: {err}");
                }
            }
            if !auto_retry {
                thread::sleep(RETRY_INTERVAL);
            }
        }
        info!("DAS reader thread for {port_name} stopped");
    });
}

fn run_lines(
    port: Box<dyn serialport::SerialPort>,
    store: &Arc<dyn LocalStore>,
    callbacks: &Arc<StdMutex<Vec<DataCallback>>>,
    running: &Arc<AtomicBool>,
    readings_received: &Arc<AtomicU64>,
) {
    let mut reader = BufReader::new(port);
    let mut line = String::new();
    while running.load(Ordering::SeqCst) {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => continue,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                for event in parse_events(trimmed) {
                    if let Err(err) = store.add_reading(&event.name, &event.value, event.timestamp, &event.units) {
                        error!("DAS failed to persist reading for '{}': {err}", event.name);
                        continue;
                    }
                    readings_received.fetch_add(1, Ordering::SeqCst);
                    let callbacks = callbacks.lock().expect("das callback mutex poisoned");
                    for callback in callbacks.iter() {
                        callback(&event);
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(err) => {
                warn!("DAS serial read error: {err}");
                break;
            }
        }
    }
}

/// Parses one line of serial output into zero or more readings. The device
/// may report a single JSON object or a JSON array of objects; any shape
/// that doesn't parse is logged and discarded.
fn parse_events(line: &str) -> Vec<SensorEvent> {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(err) => {
            warn!("DAS discarding unparsable line: {err}");
            return Vec::new();
        }
    };
    let objects = match value {
        Value::Array(items) => items,
        single @ Value::Object(_) => vec![single],
        _ => {
            warn!("DAS discarding line with unexpected shape: {line}");
            return Vec::new();
        }
    };
    objects
        .into_iter()
        .filter_map(|obj| event_from_value(&obj))
        .collect()
}

fn event_from_value(value: &Value) -> Option<SensorEvent> {
    let name = value.get("name")?.as_str()?.to_string();
    let reading_value = match value.get("value")? {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let units = value
        .get("units")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let timestamp = value
        .get("timestamp")
        .and_then(Value::as_i64)
        .unwrap_or_else(|| Utc::now().timestamp());
    Some(SensorEvent {
        name,
        value: reading_value,
        timestamp,
        units,
    })
}

/// Polls the system's enumerated serial ports every [`USB_POLL_INTERVAL`].
/// On observing `port_name` newly present since the previous poll, attempts
/// to open it and, on success, runs the acquisition loop directly on this
/// thread until the port closes or `running` is cleared. `initially_present`
/// seeds the presence tracking so an already-open port isn't immediately
/// reopened on the watcher's first poll.
#[allow(clippy::too_many_arguments)]
fn spawn_usb_watcher(
    port_name: String,
    baud_rate: u32,
    store: Arc<dyn LocalStore>,
    callbacks: Arc<StdMutex<Vec<DataCallback>>>,
    running: Arc<AtomicBool>,
    readings_received: Arc<AtomicU64>,
    writer: Arc<StdMutex<Option<Box<dyn serialport::SerialPort>>>>,
    initially_present: bool,
) {
    thread::spawn(move || {
        let mut previously_present = initially_present;
        while running.load(Ordering::SeqCst) {
            match serialport::available_ports() {
                Ok(ports) => {
                    let present = ports.iter().any(|p| p.port_name == port_name);
                    if present && !previously_present {
                        info!("USB watcher: {port_name} newly present, attempting open");
                        match serialport::new(&port_name, baud_rate).timeout(Duration::from_secs(1)).open() {
                            Ok(port) => {
                                if let Ok(clone) = port.try_clone() {
                                    *writer.lock().expect("das writer mutex poisoned") = Some(clone);
                                }
                                run_lines(port, &store, &callbacks, &running, &readings_received);
                                *writer.lock().expect("das writer mutex poisoned") = None;
                            }
                            Err(err) => warn!("USB watcher failed to open {port_name}: {err}"),
                        }
                    } else if !present && previously_present {
                        debug!("USB watcher: {port_name} no longer enumerated");
                    }
                    previously_present = present;
                }
                Err(err) => warn!("USB watcher failed to enumerate ports: {err}"),
            }
            thread::sleep(USB_POLL_INTERVAL);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_events_accepts_single_object() {
        let events = parse_events(r#"{"name":"temp","value":21.5,"units":"C","timestamp":100}"#);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "temp");
        assert_eq!(events[0].value, "21.5");
        assert_eq!(events[0].timestamp, 100);
    }

    #[test]
    fn parse_events_accepts_array() {
        let events = parse_events(r#"[{"name":"a","value":1},{"name":"b","value":2}]"#);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn parse_events_discards_garbage() {
        assert!(parse_events("not json").is_empty());
    }

    #[test]
    fn parse_events_defaults_units_and_timestamp() {
        let events = parse_events(r#"{"name":"temp","value":"21"}"#);
        assert_eq!(events[0].units, "");
        assert!(events[0].timestamp > 0);
    }
}
