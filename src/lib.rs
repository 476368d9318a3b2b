//! Hardware-in-the-loop bridge harness for a cloud-connected pump drive.
//!
//! The device under test is an inverter-driven pump with two faces: an
//! MQTT session to a cloud broker (the command path an operator actually
//! uses) and a Modbus RTU line the harness taps for ground truth. This
//! crate bridges the two so a test case can issue a semantic command,
//! have it travel whichever path the real product uses, and assert on
//! the register state that results.
//!
//! The pieces:
//!
//! - [`link::modbus`]: the RTU line — framing, half-duplex bus
//!   discipline, retry policy, a background snapshot poller and a
//!   simulated inverter for tests.
//! - [`link::mqtt`]: the broker session — reconnect with bounded
//!   backoff, a bounded offline publish queue, telemetry intake.
//! - [`translator`]: the mapping table from command kinds to topics and
//!   registers, dispatch, and outcome correlation.
//! - [`orchestrator`]: test sessions, expectation helpers and verdicts.

pub mod command;
pub mod config;
pub mod correlation;
pub mod error;
pub mod link;
pub mod logging;
pub mod orchestrator;
pub mod snapshot;
pub mod translator;

pub use command::{CommandKind, CommandTable, CommandValue, DeviceCommand};
pub use config::HarnessConfig;
pub use correlation::{CorrelationHandle, Outcome};
pub use error::{HilError, Result};
pub use link::{ModbusLink, MqttLink};
pub use orchestrator::{Session, TestVerdict};
pub use snapshot::DeviceSnapshot;
pub use translator::Translator;
