//! Error handling for the HIL bridge harness.
//!
//! The taxonomy follows the propagation policy of the harness: link-level
//! faults (`ModbusTimeout`, `ModbusProtocolError`, `ModbusBusy`,
//! `BrokerUnreachable`, `PublishFailed`, `BackpressureDrop`) are retried
//! locally per link policy and then surface as a resolved `Failure` outcome
//! on the correlation record. Translator-level faults (`UnsupportedCommand`,
//! `ValueOutOfRange`) are configuration/programming errors and propagate
//! immediately from `dispatch`.

use thiserror::Error;

/// Harness error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HilError {
    /// No response within the configured window, after the retry budget.
    #[error("Modbus timeout: {0}")]
    ModbusTimeout(String),

    /// CRC failure, exception frame, or malformed response. Never retried.
    #[error("Modbus protocol error: {0}")]
    ModbusProtocolError(String),

    /// A command write was issued while another write was still in flight.
    #[error("Modbus busy: {0}")]
    ModbusBusy(String),

    /// Connect timeout/retry budget exhausted against the broker.
    #[error("Broker unreachable: {0}")]
    BrokerUnreachable(String),

    /// Asynchronous delivery failure after the client's own retries.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Offline publish buffer overflowed; the message was dropped.
    #[error("Backpressure drop: {0}")]
    BackpressureDrop(String),

    /// Command kind not present in the mapping table.
    #[error("Unsupported command: {0}")]
    UnsupportedCommand(String),

    /// Payload outside the declared engineering range. Checked before any
    /// wire transaction is attempted.
    #[error("Value out of range: {0}")]
    ValueOutOfRange(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),
}

/// Result type alias for the harness.
pub type Result<T> = std::result::Result<T, HilError>;

impl HilError {
    pub fn config(msg: impl Into<String>) -> Self {
        HilError::ConfigError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        HilError::IoError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        HilError::ModbusTimeout(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        HilError::ModbusProtocolError(msg.into())
    }

    pub fn out_of_range(msg: impl Into<String>) -> Self {
        HilError::ValueOutOfRange(msg.into())
    }

    /// Whether the link-level retry policy applies to this error.
    ///
    /// Only transport silence is retried; protocol faults indicate a
    /// device-logic problem and surface immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HilError::ModbusTimeout(_))
    }
}

impl From<std::io::Error> for HilError {
    fn from(err: std::io::Error) -> Self {
        HilError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for HilError {
    fn from(err: serde_json::Error) -> Self {
        HilError::ConfigError(format!("JSON: {}", err))
    }
}
