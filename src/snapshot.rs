//! Device state snapshot.
//!
//! Last-known values of tracked holding registers, each stamped with the
//! instant it was observed. Two producers write here (the Modbus link on
//! completed transactions, the translator on inbound telemetry) and the
//! orchestrator reads it for assertions, so all access goes through one
//! lock. A reading older than the staleness bound is reported as unknown,
//! never as its cached value.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;

/// One register observation.
#[derive(Debug, Clone, Copy)]
pub struct RegisterReading {
    pub value: u16,
    pub observed_at: Instant,
}

/// Shared snapshot store. `BTreeMap` keeps diagnostics dumps in address
/// order.
#[derive(Debug)]
pub struct DeviceSnapshot {
    readings: RwLock<BTreeMap<u16, RegisterReading>>,
    staleness: Duration,
    started_at: Instant,
}

impl DeviceSnapshot {
    pub fn new(staleness: Duration) -> Self {
        Self {
            readings: RwLock::new(BTreeMap::new()),
            staleness,
            started_at: Instant::now(),
        }
    }

    /// Record a single register observation.
    pub fn record(&self, address: u16, value: u16) {
        let mut readings = self.readings.write();
        readings.insert(
            address,
            RegisterReading {
                value,
                observed_at: Instant::now(),
            },
        );
    }

    /// Record a contiguous block, e.g. one FC03 response. Held under one
    /// write-lock acquisition so multi-register values are never torn.
    pub fn record_block(&self, start: u16, values: &[u16]) {
        let now = Instant::now();
        let mut readings = self.readings.write();
        for (i, &value) in values.iter().enumerate() {
            readings.insert(
                start.wrapping_add(i as u16),
                RegisterReading {
                    value,
                    observed_at: now,
                },
            );
        }
    }

    /// Authoritative value of a register: `None` if never seen or older
    /// than the staleness bound.
    pub fn fresh(&self, address: u16) -> Option<u16> {
        let readings = self.readings.read();
        let reading = readings.get(&address)?;
        if reading.observed_at.elapsed() > self.staleness {
            None
        } else {
            Some(reading.value)
        }
    }

    /// Raw value and age, staleness bound ignored. Diagnostics only.
    pub fn raw(&self, address: u16) -> Option<(u16, Duration)> {
        let readings = self.readings.read();
        let reading = readings.get(&address)?;
        Some((reading.value, reading.observed_at.elapsed()))
    }

    /// Seconds since the snapshot (and the owning session) started.
    pub fn elapsed_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// Point-in-time dump attached to failed test verdicts.
    pub fn dump(&self) -> SnapshotDump {
        let readings = self.readings.read();
        let registers = readings
            .iter()
            .map(|(&address, reading)| {
                let age = reading.observed_at.elapsed();
                RegisterDump {
                    address,
                    value: reading.value,
                    age_secs: age.as_secs_f64(),
                    stale: age > self.staleness,
                }
            })
            .collect();
        SnapshotDump {
            taken_at_secs: self.elapsed_secs(),
            registers,
        }
    }
}

/// Serializable snapshot state for failure diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotDump {
    /// Seconds since test start when the dump was taken.
    pub taken_at_secs: f64,
    pub registers: Vec<RegisterDump>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterDump {
    pub address: u16,
    pub value: u16,
    pub age_secs: f64,
    pub stale: bool,
}

impl fmt::Display for SnapshotDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.registers.is_empty() {
            return write!(f, "snapshot@{:.2}s: no registers observed", self.taken_at_secs);
        }
        write!(f, "snapshot@{:.2}s:", self.taken_at_secs)?;
        for reg in &self.registers {
            write!(
                f,
                " 0x{:04X}={} ({:.2}s{})",
                reg.address,
                reg.value,
                reg.age_secs,
                if reg.stale { ", stale" } else { "" }
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fresh_reading_is_authoritative() {
        let snapshot = DeviceSnapshot::new(Duration::from_secs(2));
        snapshot.record(0x1000, 5000);
        assert_eq!(snapshot.fresh(0x1000), Some(5000));
        assert_eq!(snapshot.fresh(0x1001), None);
    }

    #[tokio::test(start_paused = true)]
    async fn reading_twice_staleness_bound_old_is_unknown() {
        let snapshot = DeviceSnapshot::new(Duration::from_secs(2));
        snapshot.record(0x1000, 5000);

        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(snapshot.fresh(0x1000), None);
        // The raw value survives for diagnostics.
        let (value, age) = snapshot.raw(0x1000).unwrap();
        assert_eq!(value, 5000);
        assert!(age >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn block_write_shares_one_timestamp() {
        let snapshot = DeviceSnapshot::new(Duration::from_secs(2));
        snapshot.record_block(0x1000, &[1, 2, 3]);
        let (_, age_a) = snapshot.raw(0x1000).unwrap();
        let (_, age_c) = snapshot.raw(0x1002).unwrap();
        assert_eq!(age_a, age_c);
        assert_eq!(snapshot.fresh(0x1002), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn dump_marks_stale_entries() {
        let snapshot = DeviceSnapshot::new(Duration::from_secs(2));
        snapshot.record(0x1000, 10);
        tokio::time::advance(Duration::from_secs(3)).await;
        snapshot.record(0x2000, 1);

        let dump = snapshot.dump();
        assert_eq!(dump.registers.len(), 2);
        assert!(dump.registers[0].stale);
        assert!(!dump.registers[1].stale);

        let text = dump.to_string();
        assert!(text.contains("0x1000=10"));
        assert!(text.contains("stale"));
    }
}
