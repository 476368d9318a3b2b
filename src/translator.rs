//! Command translator.
//!
//! Turns semantic `DeviceCommand`s into wire traffic via the mapping
//! table, and turns wire traffic back into resolved outcomes. Cloud-path
//! commands go out as one MQTT envelope and are verified by reading the
//! target register back over the local line until it shows the commanded
//! value; a telemetry echo naming the correlation id resolves the record
//! early. Local-path commands are direct Modbus writes. Either way the
//! issuing test observes exactly one outcome per command.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::command::{CommandPath, CommandTable, CommandValue, DeviceCommand};
use crate::config::HarnessConfig;
use crate::correlation::{CorrelationHandle, CorrelationTracker, Outcome};
use crate::error::{HilError, Result};
use crate::link::modbus::ModbusLink;
use crate::link::mqtt::{CommandPublisher, LinkEvent, MqttEnvelope, ReceivedMessage};

/// JSON body of a cloud-path command publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    pub correlation: Uuid,
    pub command: String,
    pub value: CommandValue,
    pub issued_at: DateTime<Utc>,
}

/// JSON body of a telemetry message from the embedded board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    /// Echoed when the message acknowledges a specific command.
    #[serde(default)]
    pub correlation: Option<Uuid>,
    #[serde(default)]
    pub registers: Vec<RegisterValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterValue {
    pub address: u16,
    pub value: u16,
}

/// The translation layer between test intent and the two links.
pub struct Translator {
    namespace: String,
    table: CommandTable,
    default_timeout: Duration,
    verify_interval: Duration,
    publisher: Arc<dyn CommandPublisher>,
    modbus: Arc<ModbusLink>,
    tracker: Arc<CorrelationTracker>,
    received: Arc<Mutex<Vec<ReceivedMessage>>>,
}

impl Translator {
    pub fn new(
        config: &HarnessConfig,
        publisher: Arc<dyn CommandPublisher>,
        modbus: Arc<ModbusLink>,
    ) -> Result<Self> {
        Ok(Self {
            namespace: config.namespace.clone(),
            table: config.command_table()?,
            default_timeout: config.default_timeout(),
            verify_interval: Duration::from_millis(config.modbus.poll_interval_ms),
            publisher,
            modbus,
            tracker: Arc::new(CorrelationTracker::new()),
            received: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn tracker(&self) -> Arc<CorrelationTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Inbound telemetry log, in arrival order. The orchestrator scans it
    /// for `expect_message` assertions.
    pub fn received_messages(&self) -> Vec<ReceivedMessage> {
        self.received.lock().clone()
    }

    pub fn clear_received_messages(&self) {
        self.received.lock().clear();
    }

    fn command_topic(&self, suffix: &str) -> String {
        format!("{}/cmd/{}", self.namespace, suffix)
    }

    /// Issue a command. Mapping and range errors fail here, before any
    /// wire traffic; everything after dispatch resolves through the
    /// returned handle.
    pub async fn dispatch(&self, command: DeviceCommand) -> Result<CorrelationHandle> {
        let spec = self.table.get(command.kind)?;
        let registers = spec.encode(command.value)?;
        let (correlation, handle) = self.tracker.register(command.clone());

        match spec.path {
            CommandPath::Cloud => {
                let payload = CommandPayload {
                    correlation,
                    command: command.kind.as_str().to_string(),
                    value: command.value,
                    issued_at: command.issued_at,
                };
                let envelope = MqttEnvelope::new(
                    self.command_topic(&spec.topic),
                    serde_json::to_vec(&payload)?,
                );
                info!(
                    correlation = %correlation,
                    kind = command.kind.as_str(),
                    topic = %envelope.topic,
                    "dispatching cloud command"
                );
                if let Err(err) = self.publisher.publish(envelope).await {
                    self.tracker.resolve(correlation, Outcome::Failure(err));
                    return Ok(handle);
                }
                self.spawn_verification(
                    correlation,
                    spec.register,
                    spec.width.register_count(),
                    registers,
                );
            },
            CommandPath::Local => {
                let txn = self.modbus.next_txn();
                self.tracker.bind_txn(txn, correlation);
                info!(
                    correlation = %correlation,
                    kind = command.kind.as_str(),
                    txn,
                    register = format_args!("0x{:04X}", spec.register),
                    "dispatching local command"
                );
                let modbus = Arc::clone(&self.modbus);
                let tracker = Arc::clone(&self.tracker);
                let address = spec.register;
                tokio::spawn(async move {
                    let result = modbus.write_registers(txn, address, &registers).await;
                    tracker.resolve_txn(txn, outcome_of(result));
                });
            },
        }
        Ok(handle)
    }

    /// Poll the target register until it reads back the commanded value.
    /// A read that exhausts the link's retry budget fails the command; a
    /// verification window that simply runs out leaves the record pending
    /// for the awaiting side's timeout.
    fn spawn_verification(&self, correlation: Uuid, address: u16, count: u16, expected: Vec<u16>) {
        let modbus = Arc::clone(&self.modbus);
        let tracker = Arc::clone(&self.tracker);
        let interval = self.verify_interval;
        let window = self.default_timeout;
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + window;
            while tokio::time::Instant::now() < deadline {
                if !tracker.is_pending(correlation) {
                    return;
                }
                match modbus.read_registers(address, count).await {
                    Ok(values) if values == expected => {
                        debug!(correlation = %correlation, "register state verified");
                        tracker.resolve(correlation, Outcome::Success);
                        return;
                    },
                    Ok(_) => {},
                    Err(err) => {
                        warn!(correlation = %correlation, %err, "verification read failed");
                        tracker.resolve(correlation, Outcome::Failure(err));
                        return;
                    },
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    /// Handle one inbound telemetry message: log it, fold any register
    /// values into the snapshot, and resolve an echoed correlation.
    pub fn on_mqtt_message(&self, message: ReceivedMessage) {
        let payload: Option<StatusPayload> = serde_json::from_slice(&message.payload).ok();
        self.received.lock().push(message);

        let Some(status) = payload else { return };
        let snapshot = self.modbus.snapshot();
        for reg in &status.registers {
            snapshot.record(reg.address, reg.value);
        }
        if let Some(correlation) = status.correlation {
            if self.tracker.is_pending(correlation) {
                debug!(correlation = %correlation, "telemetry echo received");
                self.tracker.resolve(correlation, Outcome::Success);
            }
        }
    }

    /// Drive link events into the translator until the link closes.
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<LinkEvent>,
    ) -> JoinHandle<()> {
        let translator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    LinkEvent::Message(message) => translator.on_mqtt_message(message),
                    LinkEvent::Connected => info!("command path online"),
                    LinkEvent::Disconnected => warn!("command path offline"),
                    LinkEvent::PublishFailed { envelope } => {
                        translator.fail_envelope(&envelope, |reason| {
                            HilError::PublishFailed(reason)
                        });
                    },
                    LinkEvent::BackpressureDrop { envelope } => {
                        translator.fail_envelope(&envelope, |reason| {
                            HilError::BackpressureDrop(reason)
                        });
                    },
                }
            }
        })
    }

    /// Resolve the command carried by a failed envelope, if it parses.
    fn fail_envelope(&self, envelope: &MqttEnvelope, to_error: impl Fn(String) -> HilError) {
        match serde_json::from_slice::<CommandPayload>(&envelope.payload) {
            Ok(payload) => {
                let err = to_error(format!("{} ({})", envelope.topic, payload.command));
                self.tracker
                    .resolve(payload.correlation, Outcome::Failure(err));
            },
            Err(_) => warn!(topic = %envelope.topic, "undeliverable envelope had no command payload"),
        }
    }
}

fn outcome_of(result: Result<()>) -> Outcome {
    match result {
        Ok(()) => Outcome::Success,
        Err(err) => Outcome::Failure(err),
    }
}
