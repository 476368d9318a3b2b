//! In-process inverter simulation.
//!
//! `SimulatedInverter` implements `RtuTransport` against a register map in
//! memory, with injectable fault modes for exercising the link's timeout,
//! CRC and exception handling. Clones share state, so a test can hold one
//! clone for assertions while the link owns another as its transport.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{HilError, Result};
use crate::link::modbus::frame::RtuFrame;
use crate::link::modbus::pdu;
use crate::link::modbus::transport::RtuTransport;

/// How the simulated device misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// Normal operation.
    None,
    /// Device never answers; every exchange times out.
    Mute,
    /// Responses carry a corrupted CRC.
    CorruptCrc,
    /// Every request is answered with this exception code.
    Exception(u8),
}

/// One serviced exchange, for bus-discipline assertions.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeSpan {
    pub started_at: Instant,
    pub finished_at: Instant,
}

struct SimState {
    registers: BTreeMap<u16, u16>,
    fault: FaultMode,
    latency: Duration,
    spans: Vec<ExchangeSpan>,
}

/// A scriptable pump drive on the other end of the RTU line.
#[derive(Clone)]
pub struct SimulatedInverter {
    unit_id: u8,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedInverter {
    pub fn new(unit_id: u8) -> Self {
        Self {
            unit_id,
            state: Arc::new(Mutex::new(SimState {
                registers: BTreeMap::new(),
                fault: FaultMode::None,
                latency: Duration::from_millis(2),
                spans: Vec::new(),
            })),
        }
    }

    pub fn set_fault(&self, fault: FaultMode) {
        self.state.lock().fault = fault;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Directly set a register, bypassing the wire. Models the drive
    /// changing state on its own (or an embedded board acting on a cloud
    /// command).
    pub fn set_register(&self, address: u16, value: u16) {
        self.state.lock().registers.insert(address, value);
    }

    pub fn register(&self, address: u16) -> Option<u16> {
        self.state.lock().registers.get(&address).copied()
    }

    /// Spans of every exchange serviced so far, in completion order.
    pub fn exchange_spans(&self) -> Vec<ExchangeSpan> {
        self.state.lock().spans.clone()
    }

    fn handle_pdu(&self, request: &[u8]) -> std::result::Result<Vec<u8>, u8> {
        let state = self.state.lock();
        if let FaultMode::Exception(code) = state.fault {
            return Err(code);
        }
        drop(state);

        match request.first() {
            Some(&pdu::FC_READ_HOLDING) if request.len() >= 5 => {
                let address = u16::from_be_bytes([request[1], request[2]]);
                let count = u16::from_be_bytes([request[3], request[4]]);
                if count == 0 || count > pdu::MAX_READ_REGISTERS {
                    return Err(0x03);
                }
                let state = self.state.lock();
                let mut response = Vec::with_capacity(2 + count as usize * 2);
                response.push(pdu::FC_READ_HOLDING);
                response.push((count * 2) as u8);
                for i in 0..count {
                    let value = state
                        .registers
                        .get(&address.wrapping_add(i))
                        .copied()
                        .unwrap_or(0);
                    response.extend_from_slice(&value.to_be_bytes());
                }
                Ok(response)
            },
            Some(&pdu::FC_WRITE_SINGLE) if request.len() >= 5 => {
                let address = u16::from_be_bytes([request[1], request[2]]);
                let value = u16::from_be_bytes([request[3], request[4]]);
                self.state.lock().registers.insert(address, value);
                // FC06 echoes the request.
                Ok(request[..5].to_vec())
            },
            Some(&pdu::FC_WRITE_MULTIPLE) if request.len() >= 6 => {
                let address = u16::from_be_bytes([request[1], request[2]]);
                let count = u16::from_be_bytes([request[3], request[4]]) as usize;
                let byte_count = request[5] as usize;
                if byte_count != count * 2 || request.len() < 6 + byte_count {
                    return Err(0x03);
                }
                let mut state = self.state.lock();
                for (i, chunk) in request[6..6 + byte_count].chunks_exact(2).enumerate() {
                    state.registers.insert(
                        address.wrapping_add(i as u16),
                        u16::from_be_bytes([chunk[0], chunk[1]]),
                    );
                }
                Ok(request[..5].to_vec())
            },
            _ => Err(0x01),
        }
    }
}

#[async_trait]
impl RtuTransport for SimulatedInverter {
    async fn exchange(
        &mut self,
        request: &[u8],
        _expected_len: usize,
        deadline: Duration,
    ) -> Result<Vec<u8>> {
        let started_at = Instant::now();
        let (fault, latency) = {
            let state = self.state.lock();
            (state.fault, state.latency)
        };

        if fault == FaultMode::Mute {
            tokio::time::sleep(deadline).await;
            return Err(HilError::timeout(format!(
                "no response from simulated unit {} within {:?}",
                self.unit_id, deadline
            )));
        }

        let parsed = RtuFrame::from_bytes(request)?;
        if parsed.unit_id != self.unit_id {
            // A real device stays silent for someone else's address.
            tokio::time::sleep(deadline).await;
            return Err(HilError::timeout(format!(
                "unit {} ignored frame addressed to {}",
                self.unit_id, parsed.unit_id
            )));
        }

        tokio::time::sleep(latency).await;

        let response_pdu = match self.handle_pdu(&parsed.pdu) {
            Ok(pdu) => pdu,
            Err(code) => vec![parsed.pdu[0] | 0x80, code],
        };
        let mut bytes = RtuFrame::new(self.unit_id, response_pdu).to_bytes();
        if fault == FaultMode::CorruptCrc {
            let last = bytes.len() - 1;
            bytes[last] ^= 0xFF;
        }

        self.state.lock().spans.push(ExchangeSpan {
            started_at,
            finished_at: Instant::now(),
        });
        Ok(bytes)
    }
}
