//! Modbus RTU framing.
//!
//! RTU frames are `[unit id][PDU][CRC16 lo][CRC16 hi]`. The CRC is the
//! standard Modbus CRC-16 (poly 0xA001 reflected), transmitted
//! little-endian.

use crate::error::{HilError, Result};

/// A complete RTU frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuFrame {
    pub unit_id: u8,
    pub pdu: Vec<u8>,
}

impl RtuFrame {
    pub fn new(unit_id: u8, pdu: Vec<u8>) -> Self {
        Self { unit_id, pdu }
    }

    /// Serialize with trailing CRC.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.pdu.len() + 3);
        bytes.push(self.unit_id);
        bytes.extend_from_slice(&self.pdu);
        let crc = crc16(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Parse and CRC-check a received frame.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(HilError::protocol(format!(
                "RTU frame too short: {} bytes",
                data.len()
            )));
        }
        let crc_pos = data.len() - 2;
        let received = u16::from_le_bytes([data[crc_pos], data[crc_pos + 1]]);
        let computed = crc16(&data[..crc_pos]);
        if received != computed {
            return Err(HilError::protocol(format!(
                "CRC mismatch: computed 0x{:04X}, received 0x{:04X}",
                computed, received
            )));
        }
        Ok(Self {
            unit_id: data[0],
            pdu: data[1..crc_pos].to_vec(),
        })
    }
}

/// Modbus CRC-16 over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Whether `buf` holds a complete response frame.
///
/// `expected_len` is the length of a normal response to the request that
/// was sent; exception responses are always 5 bytes (unit, fc|0x80, code,
/// CRC) and may arrive instead.
pub fn response_complete(buf: &[u8], expected_len: usize) -> bool {
    if buf.len() >= expected_len {
        return true;
    }
    buf.len() >= 5 && buf[1] & 0x80 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_check_value() {
        // CRC-16/MODBUS check value for "123456789".
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn frame_round_trip() {
        let frame = RtuFrame::new(0x01, vec![0x03, 0x10, 0x00, 0x00, 0x02]);
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), 8);
        let parsed = RtuFrame::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn corrupt_crc_is_protocol_error() {
        let mut bytes = RtuFrame::new(0x01, vec![0x03, 0x00, 0x00, 0x00, 0x01]).to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = RtuFrame::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, HilError::ModbusProtocolError(_)));
        assert!(err.to_string().contains("CRC"));
    }

    #[test]
    fn runt_frame_rejected() {
        assert!(RtuFrame::from_bytes(&[0x01, 0x03]).is_err());
    }

    #[test]
    fn exception_frame_counts_as_complete() {
        // 5-byte exception: unit, fc|0x80, code, crc.
        let mut frame = vec![0x01, 0x83, 0x02];
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        assert!(response_complete(&frame, 25));
        assert!(!response_complete(&frame[..4], 25));
    }
}
