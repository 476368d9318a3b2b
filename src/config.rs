//! Harness configuration.
//!
//! Configuration is a structured object supplied at `Session::setup`, never
//! pulled from scattered environment variables. It can be built directly in
//! code (the normal path for tests) or loaded from a YAML file with an
//! optional `HIL_`-prefixed environment overlay.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::command::{CommandSpec, CommandTable};
use crate::error::{HilError, Result};

/// MQTT broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    #[serde(default = "defaults::broker_port")]
    pub port: u16,
    #[serde(default = "defaults::client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Keep-alive interval in seconds.
    #[serde(default = "defaults::keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Per-attempt connect timeout in milliseconds.
    #[serde(default = "defaults::connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Connect attempts before `BrokerUnreachable`.
    #[serde(default = "defaults::connect_retries")]
    pub connect_retries: u32,
    /// QoS for command publishes (0, 1 or 2).
    #[serde(default = "defaults::qos")]
    pub qos: u8,
    /// Bound on messages queued while disconnected; overflow drops with
    /// `BackpressureDrop`.
    #[serde(default = "defaults::offline_queue_limit")]
    pub offline_queue_limit: usize,
}

/// Serial line settings for the RTU channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0`.
    pub port: String,
    #[serde(default = "defaults::baud_rate")]
    pub baud_rate: u32,
    /// `none`, `even` or `odd`.
    #[serde(default = "defaults::parity")]
    pub parity: String,
    #[serde(default = "defaults::stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "defaults::data_bits")]
    pub data_bits: u8,
}

/// A contiguous block of holding registers refreshed by the poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterGroup {
    pub name: String,
    pub start: u16,
    pub count: u16,
}

/// Modbus link behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    #[serde(default = "defaults::unit_id")]
    pub unit_id: u8,
    /// Response window per attempt, in milliseconds.
    #[serde(default = "defaults::response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Additional attempts after a timeout (protocol errors never retry).
    #[serde(default = "defaults::retries")]
    pub retries: u32,
    /// Snapshot refresh cadence for the background poller.
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Register groups the poller keeps fresh.
    #[serde(default)]
    pub poll_groups: Vec<RegisterGroup>,
}

/// Reconnect backoff bounds for the MQTT link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "defaults::backoff_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "defaults::backoff_max_ms")]
    pub max_ms: u64,
    #[serde(default = "defaults::backoff_multiplier")]
    pub multiplier: f64,
    #[serde(default = "defaults::backoff_jitter")]
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: defaults::backoff_initial_ms(),
            max_ms: defaults::backoff_max_ms(),
            multiplier: defaults::backoff_multiplier(),
            jitter: defaults::backoff_jitter(),
        }
    }
}

/// Top-level harness configuration, the recognized option set of
/// `Session::setup`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Topic namespace: commands go to `<namespace>/cmd/<kind>`, telemetry
    /// arrives on `<namespace>/status/#`.
    #[serde(default = "defaults::namespace")]
    pub namespace: String,
    pub broker: BrokerConfig,
    pub serial: SerialConfig,
    #[serde(default)]
    pub modbus: ModbusConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Age beyond which a cached register reading is reported as unknown.
    #[serde(default = "defaults::staleness_ms")]
    pub staleness_ms: u64,
    /// Default end-to-end bound for `await_outcome` / `expect`.
    #[serde(default = "defaults::default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Replacement command mapping rows for a drive with a different
    /// register layout; empty keeps the stock table.
    #[serde(default)]
    pub command_map: Vec<CommandSpec>,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            unit_id: defaults::unit_id(),
            response_timeout_ms: defaults::response_timeout_ms(),
            retries: defaults::retries(),
            poll_interval_ms: defaults::poll_interval_ms(),
            poll_groups: Vec::new(),
        }
    }
}

impl HarnessConfig {
    /// Load from a YAML file, overlaying `HIL_`-prefixed environment
    /// variables (`HIL_BROKER__HOST` etc.).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: HarnessConfig = Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("HIL_").split("__"))
            .extract()
            .map_err(|e| HilError::config(format!("failed to load config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check option consistency before any link is opened.
    pub fn validate(&self) -> Result<()> {
        if self.broker.host.is_empty() {
            return Err(HilError::config("broker.host must not be empty"));
        }
        if self.broker.qos > 2 {
            return Err(HilError::config(format!(
                "broker.qos must be 0, 1 or 2, got {}",
                self.broker.qos
            )));
        }
        if self.serial.port.is_empty() {
            return Err(HilError::config("serial.port must not be empty"));
        }
        if !matches!(self.serial.parity.as_str(), "none" | "even" | "odd") {
            return Err(HilError::config(format!(
                "serial.parity must be none/even/odd, got '{}'",
                self.serial.parity
            )));
        }
        if self.staleness_ms == 0 {
            return Err(HilError::config("staleness_ms must be positive"));
        }
        if self.default_timeout_ms == 0 {
            return Err(HilError::config("default_timeout_ms must be positive"));
        }
        self.command_table()?;
        Ok(())
    }

    /// The command mapping in effect: the configured rows, or the stock
    /// drive layout when none are given.
    pub fn command_table(&self) -> Result<CommandTable> {
        if self.command_map.is_empty() {
            Ok(CommandTable::default())
        } else {
            CommandTable::from_specs(self.command_map.clone())
        }
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.staleness_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// A config suitable for tests: loopback names, short timeouts.
    pub fn for_testing() -> Self {
        Self {
            namespace: "hil".into(),
            broker: BrokerConfig {
                host: "localhost".into(),
                port: 1883,
                client_id: "hilbridge-test".into(),
                username: None,
                password: None,
                keep_alive_secs: 30,
                connect_timeout_ms: 500,
                connect_retries: 1,
                qos: 1,
                offline_queue_limit: 8,
            },
            serial: SerialConfig {
                port: "sim".into(),
                baud_rate: 9600,
                parity: "none".into(),
                stop_bits: 1,
                data_bits: 8,
            },
            modbus: ModbusConfig {
                unit_id: 1,
                response_timeout_ms: 50,
                retries: 2,
                poll_interval_ms: 20,
                poll_groups: vec![RegisterGroup {
                    name: "drive".into(),
                    start: 0x1000,
                    count: 8,
                }],
            },
            backoff: BackoffConfig {
                initial_ms: 10,
                max_ms: 100,
                multiplier: 2.0,
                jitter: false,
            },
            staleness_ms: 2_000,
            default_timeout_ms: 2_000,
            command_map: Vec::new(),
        }
    }
}

mod defaults {
    pub fn namespace() -> String {
        "hil".into()
    }
    pub fn broker_port() -> u16 {
        1883
    }
    pub fn client_id() -> String {
        "hilbridge".into()
    }
    pub fn keep_alive_secs() -> u64 {
        30
    }
    pub fn connect_timeout_ms() -> u64 {
        5_000
    }
    pub fn connect_retries() -> u32 {
        3
    }
    pub fn qos() -> u8 {
        1
    }
    pub fn offline_queue_limit() -> usize {
        64
    }
    pub fn baud_rate() -> u32 {
        9_600
    }
    pub fn parity() -> String {
        "none".into()
    }
    pub fn stop_bits() -> u8 {
        1
    }
    pub fn data_bits() -> u8 {
        8
    }
    pub fn unit_id() -> u8 {
        1
    }
    pub fn response_timeout_ms() -> u64 {
        500
    }
    pub fn retries() -> u32 {
        2
    }
    pub fn poll_interval_ms() -> u64 {
        500
    }
    pub fn backoff_initial_ms() -> u64 {
        500
    }
    pub fn backoff_max_ms() -> u64 {
        30_000
    }
    pub fn backoff_multiplier() -> f64 {
        2.0
    }
    pub fn backoff_jitter() -> bool {
        true
    }
    pub fn staleness_ms() -> u64 {
        2_000
    }
    pub fn default_timeout_ms() -> u64 {
        5_000
    }
}
