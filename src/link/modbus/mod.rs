//! Modbus RTU link.
//!
//! Owns the serial transport and enforces bus discipline: the RTU line is
//! half-duplex, so every exchange goes through one async mutex and the
//! next request waits for the previous response (or its timeout). Reads
//! queue on the lock. Writes additionally hold a write gate and fail
//! fast with `ModbusBusy` when another write is still in flight, because
//! a test that fires overlapping writes has a bug worth surfacing, not
//! hiding; contention with the background poller's reads just queues.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{ModbusConfig, SerialConfig};
use crate::error::{HilError, Result};
use crate::snapshot::DeviceSnapshot;

pub mod frame;
pub mod pdu;
pub mod simulator;
pub mod transport;

use frame::RtuFrame;
use transport::RtuTransport;

/// The harness side of the RTU line.
pub struct ModbusLink {
    transport: Mutex<Box<dyn RtuTransport>>,
    /// Held for the duration of one command write.
    write_gate: Mutex<()>,
    config: ModbusConfig,
    snapshot: Arc<DeviceSnapshot>,
    txn_counter: AtomicU64,
}

impl ModbusLink {
    pub fn new(
        config: ModbusConfig,
        transport: Box<dyn RtuTransport>,
        snapshot: Arc<DeviceSnapshot>,
    ) -> Self {
        Self {
            transport: Mutex::new(transport),
            write_gate: Mutex::new(()),
            config,
            snapshot,
            txn_counter: AtomicU64::new(1),
        }
    }

    /// Open the link over a real serial port.
    pub fn open_serial(
        config: ModbusConfig,
        serial: &SerialConfig,
        snapshot: Arc<DeviceSnapshot>,
    ) -> Result<Self> {
        let transport = transport::SerialRtuTransport::open(serial)?;
        Ok(Self::new(config, Box::new(transport), snapshot))
    }

    /// Allocate a transaction id. Ids are per-link, monotonically
    /// increasing, and appear in logs and correlation bindings.
    pub fn next_txn(&self) -> u64 {
        self.txn_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Arc<DeviceSnapshot> {
        Arc::clone(&self.snapshot)
    }

    fn response_window(&self) -> Duration {
        Duration::from_millis(self.config.response_timeout_ms)
    }

    /// One framed request/response with the retry policy applied: timeouts
    /// are retried up to the configured budget, everything else surfaces
    /// immediately.
    async fn transact(
        &self,
        transport: &mut Box<dyn RtuTransport>,
        txn: u64,
        request_pdu: &[u8],
    ) -> Result<Vec<u8>> {
        let request = RtuFrame::new(self.config.unit_id, request_pdu.to_vec()).to_bytes();
        let expected_len = pdu::expected_response_len(request_pdu);
        let window = self.response_window();

        let mut attempt = 0;
        loop {
            match transport.exchange(&request, expected_len, window).await {
                Ok(raw) => {
                    let response = RtuFrame::from_bytes(&raw)?;
                    if response.unit_id != self.config.unit_id {
                        return Err(HilError::protocol(format!(
                            "response from unit {} while talking to unit {}",
                            response.unit_id, self.config.unit_id
                        )));
                    }
                    debug!(txn, fc = request_pdu[0], attempt, "modbus exchange complete");
                    return Ok(response.pdu);
                },
                Err(err) if err.is_retryable() && attempt < self.config.retries => {
                    attempt += 1;
                    warn!(txn, attempt, %err, "modbus exchange timed out, retrying");
                },
                Err(err) => return Err(err),
            }
        }
    }

    /// Read a block of holding registers. Queues behind any transaction in
    /// flight; a completed read refreshes the device snapshot.
    pub async fn read_registers(&self, start: u16, count: u16) -> Result<Vec<u16>> {
        let txn = self.next_txn();
        let request = pdu::build_read_request(start, count)?;
        let mut transport = self.transport.lock().await;
        let response = self.transact(&mut transport, txn, &request).await?;
        drop(transport);

        let values = pdu::parse_read_response(&response, count)?;
        self.snapshot.record_block(start, &values);
        Ok(values)
    }

    /// Write one or more holding registers (FC06 for one, FC10 for more).
    ///
    /// Fails fast with `ModbusBusy` if another write is still in flight.
    pub async fn write_registers(&self, txn: u64, address: u16, values: &[u16]) -> Result<()> {
        let request = match values {
            [] => return Err(HilError::protocol("write with no values")),
            [value] => pdu::build_write_single(address, *value),
            many => pdu::build_write_multiple(address, many)?,
        };
        let expected_fc = request[0];

        let _gate = self.write_gate.try_lock().map_err(|_| {
            HilError::ModbusBusy(format!(
                "write to 0x{:04X} refused: another write is in flight",
                address
            ))
        })?;
        let mut transport = self.transport.lock().await;
        let response = self.transact(&mut transport, txn, &request).await?;
        drop(transport);

        pdu::parse_write_response(&response, expected_fc, address)?;
        self.snapshot.record_block(address, values);
        Ok(())
    }

    /// Background task refreshing the configured register groups on a fixed
    /// cadence. Poll failures are logged and the cadence continues; the
    /// snapshot's staleness bound is what turns persistent failure into
    /// visible unknowns.
    pub fn spawn_poller(self: &Arc<Self>) -> JoinHandle<()> {
        let link = Arc::clone(self);
        let interval = Duration::from_millis(link.config.poll_interval_ms);
        let groups = link.config.poll_groups.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for group in &groups {
                    if let Err(err) = link.read_registers(group.start, group.count).await {
                        warn!(group = %group.name, %err, "snapshot poll failed");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::simulator::{FaultMode, SimulatedInverter};
    use super::*;
    use crate::config::HarnessConfig;
    use tokio::time::Instant;

    fn link_with_sim() -> (Arc<ModbusLink>, SimulatedInverter) {
        let config = HarnessConfig::for_testing();
        let sim = SimulatedInverter::new(config.modbus.unit_id);
        let snapshot = Arc::new(DeviceSnapshot::new(config.staleness()));
        let link = Arc::new(ModbusLink::new(
            config.modbus,
            Box::new(sim.clone()),
            snapshot,
        ));
        (link, sim)
    }

    #[tokio::test(start_paused = true)]
    async fn read_refreshes_snapshot() {
        let (link, sim) = link_with_sim();
        sim.set_register(0x1000, 5000);
        sim.set_register(0x1001, 42);

        let values = link.read_registers(0x1000, 2).await.unwrap();
        assert_eq!(values, vec![5000, 42]);
        assert_eq!(link.snapshot().fresh(0x1000), Some(5000));
        assert_eq!(link.snapshot().fresh(0x1001), Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn write_lands_on_device_and_snapshot() {
        let (link, sim) = link_with_sim();
        let txn = link.next_txn();
        link.write_registers(txn, 0x1000, &[5000]).await.unwrap();
        assert_eq!(sim.register(0x1000), Some(5000));
        assert_eq!(link.snapshot().fresh(0x1000), Some(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_consumes_retry_budget_then_fails() {
        let (link, sim) = link_with_sim();
        sim.set_fault(FaultMode::Mute);

        let started = Instant::now();
        let err = link.read_registers(0x1000, 1).await.unwrap_err();
        assert!(matches!(err, HilError::ModbusTimeout(_)));
        // for_testing: 50ms window, 2 retries -> three windows of silence.
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn protocol_error_is_not_retried() {
        let (link, sim) = link_with_sim();
        sim.set_fault(FaultMode::CorruptCrc);

        let err = link.read_registers(0x1000, 1).await.unwrap_err();
        assert!(matches!(err, HilError::ModbusProtocolError(_)));
        assert_eq!(sim.exchange_spans().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exception_frame_surfaces_as_protocol_error() {
        let (link, sim) = link_with_sim();
        sim.set_fault(FaultMode::Exception(0x02));

        let txn = link.next_txn();
        let err = link.write_registers(txn, 0x9999, &[1]).await.unwrap_err();
        assert!(matches!(err, HilError::ModbusProtocolError(_)));
        assert!(err.to_string().contains("illegal data address"));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_writes_fail_busy_while_reads_queue() {
        let (link, sim) = link_with_sim();
        sim.set_latency(Duration::from_millis(20));
        sim.set_register(0x1000, 7);

        let writer = Arc::clone(&link);
        let txn = link.next_txn();
        let in_flight =
            tokio::spawn(async move { writer.write_registers(txn, 0x1001, &[5]).await });
        // Let the first write take the gate.
        tokio::time::sleep(Duration::from_millis(1)).await;

        let txn = link.next_txn();
        let err = link.write_registers(txn, 0x1000, &[9]).await.unwrap_err();
        assert!(matches!(err, HilError::ModbusBusy(_)));

        // Reads queue behind the write instead of failing.
        assert_eq!(link.read_registers(0x1000, 1).await.unwrap(), vec![7]);
        in_flight.await.unwrap().unwrap();
        assert_eq!(sim.register(0x1001), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn exchanges_never_overlap_on_the_wire() {
        let (link, sim) = link_with_sim();
        sim.set_latency(Duration::from_millis(5));

        let mut tasks = Vec::new();
        for i in 0..4u16 {
            let link = Arc::clone(&link);
            tasks.push(tokio::spawn(async move {
                link.read_registers(0x1000 + i, 1).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let spans = sim.exchange_spans();
        assert_eq!(spans.len(), 4);
        for pair in spans.windows(2) {
            assert!(pair[0].finished_at <= pair[1].started_at);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poller_keeps_groups_fresh() {
        let (link, sim) = link_with_sim();
        sim.set_register(0x1003, 123);

        let poller = link.spawn_poller();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(link.snapshot().fresh(0x1003), Some(123));

        sim.set_register(0x1003, 456);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(link.snapshot().fresh(0x1003), Some(456));
        poller.abort();
    }
}
