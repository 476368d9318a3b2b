//! Link layer: the two channels between harness and device.
//!
//! `modbus` is the local RTU line, `mqtt` the cloud path through the
//! broker. Both expose trait seams (`RtuTransport`, `CommandPublisher`) so
//! tests run against in-process stand-ins.

pub mod modbus;
pub mod mqtt;

pub use modbus::transport::RtuTransport;
pub use modbus::ModbusLink;
pub use mqtt::{CommandPublisher, LinkEvent, MqttEnvelope, MqttLink, ReceivedMessage};
