//! Test orchestration.
//!
//! A `Session` owns both links for the duration of one test run: a
//! relative clock starting at setup, the background poller and event
//! pump, and the assertion helpers test cases are written against.
//! Assertions return a `TestVerdict` rather than panicking, so a failing
//! expectation carries the device snapshot that explains it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::command::{CommandKind, CommandValue, DeviceCommand};
use crate::config::HarnessConfig;
use crate::correlation::{CorrelationHandle, Outcome};
use crate::error::Result;
use crate::link::modbus::transport::RtuTransport;
use crate::link::modbus::ModbusLink;
use crate::link::mqtt::{CommandPublisher, LinkEvent, MqttLink, ReceivedMessage};
use crate::snapshot::{DeviceSnapshot, SnapshotDump};
use crate::translator::Translator;

/// Cadence for register expectation polling.
const REGISTER_POLL: Duration = Duration::from_millis(500);
/// Cadence for message-log scans.
const MESSAGE_POLL: Duration = Duration::from_millis(100);

/// Outcome of one assertion.
#[derive(Debug, Clone)]
pub enum TestVerdict {
    Pass,
    Fail {
        reason: String,
        snapshot: SnapshotDump,
    },
}

impl TestVerdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, TestVerdict::Pass)
    }
}

impl fmt::Display for TestVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestVerdict::Pass => write!(f, "PASS"),
            TestVerdict::Fail { reason, snapshot } => {
                write!(f, "FAIL: {} [{}]", reason, snapshot)
            },
        }
    }
}

/// One test run against the device under test.
pub struct Session {
    test_id: Uuid,
    translator: Arc<Translator>,
    modbus: Arc<ModbusLink>,
    snapshot: Arc<DeviceSnapshot>,
    mqtt: Option<Arc<MqttLink>>,
    started_at: Instant,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Bring up both links against real hardware and a real broker.
    pub async fn setup(config: HarnessConfig) -> Result<Self> {
        config.validate()?;
        let snapshot = Arc::new(DeviceSnapshot::new(config.staleness()));
        let modbus = Arc::new(ModbusLink::open_serial(
            config.modbus.clone(),
            &config.serial,
            Arc::clone(&snapshot),
        )?);
        let (mqtt, events) = MqttLink::connect(&config).await?;
        let mqtt = Arc::new(mqtt);
        let translator = Arc::new(Translator::new(
            &config,
            Arc::clone(&mqtt) as Arc<dyn CommandPublisher>,
            Arc::clone(&modbus),
        )?);

        let mut session = Self {
            test_id: Uuid::new_v4(),
            translator,
            modbus,
            snapshot,
            mqtt: Some(mqtt),
            started_at: Instant::now(),
            tasks: Vec::new(),
        };
        session.start_background(events);
        info!(test = %session.test_id, "session started");
        Ok(session)
    }

    /// Bring up a session on injected transports. This is the normal path
    /// for tests: a `SimulatedInverter` on the Modbus side and any
    /// `CommandPublisher` on the cloud side.
    pub fn with_transports(
        config: &HarnessConfig,
        transport: Box<dyn RtuTransport>,
        publisher: Arc<dyn CommandPublisher>,
    ) -> Result<Self> {
        let snapshot = Arc::new(DeviceSnapshot::new(config.staleness()));
        let modbus = Arc::new(ModbusLink::new(
            config.modbus.clone(),
            transport,
            Arc::clone(&snapshot),
        ));
        let translator = Arc::new(Translator::new(config, publisher, Arc::clone(&modbus))?);

        let mut session = Self {
            test_id: Uuid::new_v4(),
            translator,
            modbus,
            snapshot,
            mqtt: None,
            started_at: Instant::now(),
            tasks: Vec::new(),
        };
        session.tasks.push(session.modbus.spawn_poller());
        info!(test = %session.test_id, "session started on injected transports");
        Ok(session)
    }

    fn start_background(&mut self, events: mpsc::Receiver<LinkEvent>) {
        self.tasks.push(self.translator.spawn_event_pump(events));
        self.tasks.push(self.modbus.spawn_poller());
    }

    /// Attach a link-event stream to the translator. Used with
    /// `with_transports` when the injected publisher produces events.
    pub fn pump_events(&mut self, events: mpsc::Receiver<LinkEvent>) {
        self.tasks.push(self.translator.spawn_event_pump(events));
    }

    pub fn translator(&self) -> Arc<Translator> {
        Arc::clone(&self.translator)
    }

    pub fn modbus(&self) -> Arc<ModbusLink> {
        Arc::clone(&self.modbus)
    }

    /// Seconds on the session's relative clock.
    pub fn elapsed_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// Log a timeline marker for the test transcript.
    pub fn mark(&self, label: &str) {
        info!(t = format_args!("+{:.2}s", self.elapsed_secs()), "{}", label);
    }

    /// Issue a command on behalf of this test.
    pub async fn issue(
        &self,
        kind: CommandKind,
        value: impl Into<CommandValue>,
    ) -> Result<CorrelationHandle> {
        let command = DeviceCommand::new(kind, value.into(), self.test_id);
        self.translator.dispatch(command).await
    }

    /// Wait for a command's outcome under the default end-to-end bound and
    /// turn it into a verdict.
    pub async fn expect_success(&self, handle: &mut CorrelationHandle) -> TestVerdict {
        self.expect_success_within(handle, self.translator.default_timeout())
            .await
    }

    pub async fn expect_success_within(
        &self,
        handle: &mut CorrelationHandle,
        timeout: Duration,
    ) -> TestVerdict {
        match handle.wait(timeout).await {
            Outcome::Success => TestVerdict::Pass,
            Outcome::Failure(err) => self.fail(format!("command failed: {}", err)),
            Outcome::TimedOut => self.fail(format!("no outcome within {:?}", timeout)),
            Outcome::Pending => self.fail("outcome still pending".to_string()),
        }
    }

    /// Poll a holding register until it reads the expected value. Read
    /// errors are treated as not-yet and retried until the deadline; the
    /// failure text carries the last value actually seen.
    pub async fn expect_register(
        &self,
        address: u16,
        expected: u16,
        timeout: Duration,
    ) -> TestVerdict {
        let deadline = Instant::now() + timeout;
        let mut last_seen: Option<u16> = None;
        loop {
            match self.modbus.read_registers(address, 1).await {
                Ok(values) => {
                    let value = values[0];
                    if value == expected {
                        return TestVerdict::Pass;
                    }
                    last_seen = Some(value);
                },
                Err(_) => {
                    last_seen = self.snapshot.fresh(address).or(last_seen);
                },
            }
            if Instant::now() >= deadline {
                let seen = match last_seen {
                    Some(v) => v.to_string(),
                    None => "unknown".to_string(),
                };
                return self.fail(format!(
                    "register 0x{:04X} expected {}, last saw {} after {:?}",
                    address, expected, seen, timeout
                ));
            }
            tokio::time::sleep(REGISTER_POLL).await;
        }
    }

    /// Scan the telemetry log, newest first, for a message on `topic`
    /// received after `newer_than`. Polls until the deadline.
    pub async fn wait_for_message(
        &self,
        topic: &str,
        newer_than: Instant,
        timeout: Duration,
    ) -> Option<ReceivedMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            let found = self
                .translator
                .received_messages()
                .into_iter()
                .rev()
                .find(|m| m.topic == topic && m.received_at > newer_than);
            if found.is_some() {
                return found;
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(MESSAGE_POLL).await;
        }
    }

    /// Drop all telemetry received so far, so the next `wait_for_message`
    /// cannot match a stale arrival.
    pub fn clear_messages(&self) {
        self.translator.clear_received_messages();
    }

    fn fail(&self, reason: String) -> TestVerdict {
        let snapshot = self.snapshot.dump();
        info!(test = %self.test_id, %reason, "expectation failed");
        TestVerdict::Fail { reason, snapshot }
    }

    /// Stop background tasks and close the links. Also runs on drop.
    pub fn teardown(mut self) {
        self.stop();
        info!(test = %self.test_id, t = format_args!("+{:.2}s", self.elapsed_secs()), "session closed");
    }

    fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(mqtt) = &self.mqtt {
            mqtt.shutdown();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}
