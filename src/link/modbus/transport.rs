//! RTU transport seam.
//!
//! `RtuTransport` is the single point where bytes hit a wire: one request
//! frame out, one response frame back, bounded by a deadline. The serial
//! implementation drives a real `/dev/tty*` line through `tokio-serial`;
//! tests substitute `SimulatedInverter`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::trace;

use crate::config::SerialConfig;
use crate::error::{HilError, Result};
use crate::link::modbus::frame;

/// A half-duplex request/response exchange on the RTU line.
///
/// Implementations do not retry and do not interpret the PDU beyond frame
/// completeness; retry policy and parsing live in `ModbusLink`.
#[async_trait]
pub trait RtuTransport: Send {
    /// Write `request` and read back one response frame.
    ///
    /// `expected_len` is the length of a normal response; an exception
    /// frame may arrive instead and also completes the exchange. Silence
    /// past `deadline` is `ModbusTimeout`.
    async fn exchange(
        &mut self,
        request: &[u8],
        expected_len: usize,
        deadline: Duration,
    ) -> Result<Vec<u8>>;
}

/// Transport over a physical (or pty-backed) serial line.
pub struct SerialRtuTransport {
    stream: SerialStream,
    port_name: String,
}

impl SerialRtuTransport {
    /// Open the configured serial port. The config is validated upstream,
    /// so unknown parity strings cannot reach here, but the mapping stays
    /// total anyway.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let parity = match config.parity.as_str() {
            "even" => Parity::Even,
            "odd" => Parity::Odd,
            _ => Parity::None,
        };
        let stop_bits = match config.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };
        let data_bits = match config.data_bits {
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };

        let stream = tokio_serial::new(&config.port, config.baud_rate)
            .parity(parity)
            .stop_bits(stop_bits)
            .data_bits(data_bits)
            .open_native_async()
            .map_err(|e| {
                HilError::io(format!("failed to open serial port {}: {}", config.port, e))
            })?;

        Ok(Self {
            stream,
            port_name: config.port.clone(),
        })
    }
}

#[async_trait]
impl RtuTransport for SerialRtuTransport {
    async fn exchange(
        &mut self,
        request: &[u8],
        expected_len: usize,
        deadline: Duration,
    ) -> Result<Vec<u8>> {
        trace!(port = %self.port_name, len = request.len(), "tx frame");
        self.stream.write_all(request).await?;
        self.stream.flush().await?;

        let mut response = Vec::with_capacity(expected_len);
        let mut chunk = [0u8; 256];
        let window = tokio::time::sleep(deadline);
        tokio::pin!(window);

        loop {
            tokio::select! {
                read = self.stream.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        return Err(HilError::io(format!(
                            "serial port {} closed mid-response",
                            self.port_name
                        )));
                    }
                    response.extend_from_slice(&chunk[..n]);
                    if frame::response_complete(&response, expected_len) {
                        trace!(port = %self.port_name, len = response.len(), "rx frame");
                        return Ok(response);
                    }
                },
                _ = &mut window => {
                    return Err(HilError::timeout(format!(
                        "no response on {} within {:?} ({} of {} bytes)",
                        self.port_name,
                        deadline,
                        response.len(),
                        expected_len
                    )));
                },
            }
        }
    }
}
