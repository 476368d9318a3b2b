//! Device commands and the command mapping table.
//!
//! Each supported command kind is one row of pure data: dispatch path, topic
//! suffix, target holding register, scale/offset/width encoding rule and the
//! valid engineering range. The translator never special-cases a kind; it
//! looks the row up and applies it. The table ships with the stock drive
//! layout and can be replaced from configuration (`command_map`) when the
//! harness points at a drive with a different register map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HilError, Result};

/// Semantic instructions the harness can issue to the pump drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Run command, delivered through the cloud path.
    StartPump,
    /// Stop command, delivered through the cloud path.
    StopPump,
    /// Target output frequency in Hz, cloud path.
    SetFrequency,
    /// Flow setpoint in percent of rated flow, cloud path.
    SetFlowSetpoint,
    /// Fault reset, written directly over the local Modbus line.
    ResetFault,
    /// Acceleration ramp in seconds, written directly over the local line.
    SetAccelRamp,
}

impl CommandKind {
    /// Wire name used in topics and payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::StartPump => "start_pump",
            CommandKind::StopPump => "stop_pump",
            CommandKind::SetFrequency => "set_frequency",
            CommandKind::SetFlowSetpoint => "set_flow_setpoint",
            CommandKind::ResetFault => "reset_fault",
            CommandKind::SetAccelRamp => "set_accel_ramp",
        }
    }

    /// Parse a wire name. Unknown kinds fail with `UnsupportedCommand` at
    /// dispatch time rather than being silently ignored.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "start_pump" => Ok(CommandKind::StartPump),
            "stop_pump" => Ok(CommandKind::StopPump),
            "set_frequency" => Ok(CommandKind::SetFrequency),
            "set_flow_setpoint" => Ok(CommandKind::SetFlowSetpoint),
            "reset_fault" => Ok(CommandKind::ResetFault),
            "set_accel_ramp" => Ok(CommandKind::SetAccelRamp),
            other => Err(HilError::UnsupportedCommand(other.to_string())),
        }
    }
}

/// Command payload value in engineering units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandValue {
    Bool(bool),
    Float(f64),
}

impl CommandValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            CommandValue::Bool(true) => 1.0,
            CommandValue::Bool(false) => 0.0,
            CommandValue::Float(v) => *v,
        }
    }
}

impl From<bool> for CommandValue {
    fn from(v: bool) -> Self {
        CommandValue::Bool(v)
    }
}

impl From<f64> for CommandValue {
    fn from(v: f64) -> Self {
        CommandValue::Float(v)
    }
}

/// Whether a command travels through the broker or straight down the serial
/// line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandPath {
    /// Published as one MQTT envelope; the embedded board performs the
    /// register write and the harness verifies the result over Modbus.
    Cloud,
    /// One or more Modbus transactions issued directly by the harness.
    Local,
}

/// Register width of the encoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterWidth {
    U16,
    I16,
    /// Two registers, high word first.
    U32,
}

impl RegisterWidth {
    pub fn register_count(&self) -> u16 {
        match self {
            RegisterWidth::U16 | RegisterWidth::I16 => 1,
            RegisterWidth::U32 => 2,
        }
    }
}

/// One row of the command mapping table. Deserializable so a config file
/// can supply a whole alternative register layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub kind: CommandKind,
    pub path: CommandPath,
    /// Suffix under `<namespace>/cmd/`.
    pub topic: String,
    /// Target holding register.
    pub register: u16,
    /// raw = engineering * scale + offset
    #[serde(default = "defaults::scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default = "defaults::width")]
    pub width: RegisterWidth,
    /// Valid engineering range, inclusive.
    pub min: f64,
    pub max: f64,
}

mod defaults {
    use super::RegisterWidth;

    pub fn scale() -> f64 {
        1.0
    }
    pub fn width() -> RegisterWidth {
        RegisterWidth::U16
    }
}

/// The central lookup: command kind -> {topic, register map, encoding rule}.
#[derive(Debug, Clone)]
pub struct CommandTable {
    specs: Vec<CommandSpec>,
}

impl Default for CommandTable {
    /// Stock register layout of the pump drive.
    fn default() -> Self {
        use CommandKind::*;
        use CommandPath::*;

        let row = |kind, path, topic: &str, register, scale, offset, min, max| CommandSpec {
            kind,
            path,
            topic: topic.to_string(),
            register,
            scale,
            offset,
            width: RegisterWidth::U16,
            min,
            max,
        };
        Self {
            specs: vec![
                row(StartPump, Cloud, "start_pump", 0x2000, 1.0, 0.0, 0.0, 1.0),
                // Stop clears the run bit: raw = 1 - value.
                row(StopPump, Cloud, "stop_pump", 0x2000, -1.0, 1.0, 0.0, 1.0),
                row(SetFrequency, Cloud, "set_frequency", 0x1000, 100.0, 0.0, 0.0, 60.0),
                row(SetFlowSetpoint, Cloud, "set_flow_setpoint", 0x1002, 10.0, 0.0, 0.0, 100.0),
                row(ResetFault, Local, "reset_fault", 0x2002, 1.0, 0.0, 0.0, 1.0),
                row(SetAccelRamp, Local, "set_accel_ramp", 0x1004, 10.0, 0.0, 0.5, 600.0),
            ],
        }
    }
}

impl CommandTable {
    /// Build a table from configured rows, rejecting inconsistent ones
    /// before any link comes up.
    pub fn from_specs(specs: Vec<CommandSpec>) -> Result<Self> {
        for (i, spec) in specs.iter().enumerate() {
            if spec.min > spec.max {
                return Err(HilError::config(format!(
                    "command_map row {}: min {} exceeds max {}",
                    spec.kind.as_str(),
                    spec.min,
                    spec.max
                )));
            }
            if spec.scale == 0.0 {
                return Err(HilError::config(format!(
                    "command_map row {}: scale must be non-zero",
                    spec.kind.as_str()
                )));
            }
            if specs[..i].iter().any(|s| s.kind == spec.kind) {
                return Err(HilError::config(format!(
                    "command_map has duplicate rows for {}",
                    spec.kind.as_str()
                )));
            }
        }
        Ok(Self { specs })
    }

    /// Mapping row for a kind; a kind without a row is unsupported on this
    /// drive.
    pub fn get(&self, kind: CommandKind) -> Result<&CommandSpec> {
        self.specs
            .iter()
            .find(|spec| spec.kind == kind)
            .ok_or_else(|| {
                HilError::UnsupportedCommand(format!("{} has no mapping row", kind.as_str()))
            })
    }

    pub fn specs(&self) -> &[CommandSpec] {
        &self.specs
    }
}

impl CommandSpec {
    /// Encode an engineering value into raw register words, range-checked
    /// before any wire transaction is attempted.
    pub fn encode(&self, value: CommandValue) -> Result<Vec<u16>> {
        let eng = value.as_f64();
        if !eng.is_finite() || eng < self.min || eng > self.max {
            return Err(HilError::out_of_range(format!(
                "{} value {} outside {}..={}",
                self.kind.as_str(),
                eng,
                self.min,
                self.max
            )));
        }

        let raw = eng * self.scale + self.offset;
        match self.width {
            RegisterWidth::U16 => {
                let raw = raw.round();
                if !(0.0..=f64::from(u16::MAX)).contains(&raw) {
                    return Err(HilError::out_of_range(format!(
                        "{} raw value {} does not fit u16",
                        self.kind.as_str(),
                        raw
                    )));
                }
                Ok(vec![raw as u16])
            },
            RegisterWidth::I16 => {
                let raw = raw.round();
                if !(f64::from(i16::MIN)..=f64::from(i16::MAX)).contains(&raw) {
                    return Err(HilError::out_of_range(format!(
                        "{} raw value {} does not fit i16",
                        self.kind.as_str(),
                        raw
                    )));
                }
                Ok(vec![raw as i16 as u16])
            },
            RegisterWidth::U32 => {
                let raw = raw.round();
                if !(0.0..=f64::from(u32::MAX)).contains(&raw) {
                    return Err(HilError::out_of_range(format!(
                        "{} raw value {} does not fit u32",
                        self.kind.as_str(),
                        raw
                    )));
                }
                let raw = raw as u32;
                Ok(vec![(raw >> 16) as u16, (raw & 0xFFFF) as u16])
            },
        }
    }

    /// Decode raw register words back to an engineering value.
    pub fn decode(&self, registers: &[u16]) -> Result<f64> {
        let raw = match self.width {
            RegisterWidth::U16 => f64::from(*registers.first().ok_or_else(|| {
                HilError::protocol("empty register block for decode")
            })?),
            RegisterWidth::I16 => {
                let word = *registers.first().ok_or_else(|| {
                    HilError::protocol("empty register block for decode")
                })?;
                f64::from(word as i16)
            },
            RegisterWidth::U32 => {
                if registers.len() < 2 {
                    return Err(HilError::protocol("u32 decode needs two registers"));
                }
                f64::from((u32::from(registers[0]) << 16) | u32::from(registers[1]))
            },
        };
        Ok((raw - self.offset) / self.scale)
    }
}

/// A semantic instruction as issued by a test case. Immutable once issued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub kind: CommandKind,
    pub value: CommandValue,
    /// The issuing test session.
    pub test_id: Uuid,
    pub issued_at: DateTime<Utc>,
}

impl DeviceCommand {
    pub fn new(kind: CommandKind, value: CommandValue, test_id: Uuid) -> Self {
        Self {
            kind,
            value,
            test_id,
            issued_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stock(kind: CommandKind) -> CommandSpec {
        CommandTable::default().get(kind).unwrap().clone()
    }

    #[test]
    fn frequency_scale_100() {
        let spec = stock(CommandKind::SetFrequency);
        assert_eq!(spec.register, 0x1000);
        assert_eq!(spec.encode(50.0.into()).unwrap(), vec![5000]);
        assert_eq!(spec.encode(0.0.into()).unwrap(), vec![0]);
        assert_eq!(spec.encode(60.0.into()).unwrap(), vec![6000]);
    }

    #[test]
    fn out_of_range_rejected_for_every_kind() {
        for spec in CommandTable::default().specs() {
            let above = CommandValue::Float(spec.max + 1.0);
            assert!(
                matches!(spec.encode(above), Err(HilError::ValueOutOfRange(_))),
                "{} accepted an out-of-range value",
                spec.kind.as_str()
            );
            let below = CommandValue::Float(spec.min - 1.0);
            assert!(matches!(
                spec.encode(below),
                Err(HilError::ValueOutOfRange(_))
            ));
        }
    }

    #[test]
    fn nan_rejected() {
        let spec = stock(CommandKind::SetFrequency);
        assert!(spec.encode(f64::NAN.into()).is_err());
    }

    #[test]
    fn start_sets_and_stop_clears_the_run_bit() {
        let start = stock(CommandKind::StartPump);
        assert_eq!(start.encode(true.into()).unwrap(), vec![1]);
        assert_eq!(start.encode(false.into()).unwrap(), vec![0]);

        // Both kinds share the run register; a confirmed stop must read
        // back as the bit cleared, not set.
        let stop = stock(CommandKind::StopPump);
        assert_eq!(stop.register, start.register);
        assert_eq!(stop.encode(true.into()).unwrap(), vec![0]);
        assert_eq!(stop.encode(false.into()).unwrap(), vec![1]);
    }

    #[test]
    fn decode_inverts_encode() {
        let spec = stock(CommandKind::SetFlowSetpoint);
        let regs = spec.encode(42.5.into()).unwrap();
        assert_eq!(regs, vec![425]);
        let eng = spec.decode(&regs).unwrap();
        assert!((eng - 42.5).abs() < 1e-9);

        // Holds for rows with a non-trivial offset too.
        let stop = stock(CommandKind::StopPump);
        let regs = stop.encode(true.into()).unwrap();
        assert!((stop.decode(&regs).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_kind_name_is_unsupported() {
        let err = CommandKind::parse("open_valve").unwrap_err();
        assert!(matches!(err, HilError::UnsupportedCommand(_)));
        assert!(err.to_string().contains("open_valve"));
    }

    #[test]
    fn every_kind_round_trips_its_wire_name() {
        for spec in CommandTable::default().specs() {
            let parsed = CommandKind::parse(spec.kind.as_str()).unwrap();
            assert_eq!(parsed, spec.kind);
        }
    }

    #[test]
    fn duplicate_rows_rejected() {
        let mut specs = CommandTable::default().specs().to_vec();
        specs.push(specs[0].clone());
        let err = CommandTable::from_specs(specs).unwrap_err();
        assert!(matches!(err, HilError::ConfigError(_)));
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn inverted_range_rejected() {
        let mut specs = CommandTable::default().specs().to_vec();
        specs[0].min = 2.0;
        specs[0].max = 1.0;
        assert!(CommandTable::from_specs(specs).is_err());
    }

    #[test]
    fn kind_missing_from_table_is_unsupported() {
        let one_row = vec![stock(CommandKind::SetFrequency)];
        let table = CommandTable::from_specs(one_row).unwrap();
        assert!(table.get(CommandKind::SetFrequency).is_ok());
        let err = table.get(CommandKind::StartPump).unwrap_err();
        assert!(matches!(err, HilError::UnsupportedCommand(_)));
    }
}
