//! Modbus PDU construction and parsing.
//!
//! Only the function codes the harness needs: FC03 (read holding
//! registers), FC06 (write single register) and FC10 (write multiple
//! registers). Exception responses are decoded into `ModbusProtocolError`
//! with the standard exception name attached.

use crate::error::{HilError, Result};

pub const FC_READ_HOLDING: u8 = 0x03;
pub const FC_WRITE_SINGLE: u8 = 0x06;
pub const FC_WRITE_MULTIPLE: u8 = 0x10;

/// Modbus limit for FC03.
pub const MAX_READ_REGISTERS: u16 = 125;
/// Modbus limit for FC10.
pub const MAX_WRITE_REGISTERS: usize = 123;

/// Build an FC03 request PDU.
pub fn build_read_request(address: u16, count: u16) -> Result<Vec<u8>> {
    if count == 0 || count > MAX_READ_REGISTERS {
        return Err(HilError::protocol(format!(
            "invalid register count for FC03: {}",
            count
        )));
    }
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FC_READ_HOLDING);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    Ok(pdu)
}

/// Build an FC06 request PDU.
pub fn build_write_single(address: u16, value: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FC_WRITE_SINGLE);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    pdu
}

/// Build an FC10 request PDU.
pub fn build_write_multiple(address: u16, values: &[u16]) -> Result<Vec<u8>> {
    if values.is_empty() || values.len() > MAX_WRITE_REGISTERS {
        return Err(HilError::protocol(format!(
            "invalid register count for FC10: {}",
            values.len()
        )));
    }
    let mut pdu = Vec::with_capacity(6 + values.len() * 2);
    pdu.push(FC_WRITE_MULTIPLE);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push((values.len() * 2) as u8);
    for &value in values {
        pdu.extend_from_slice(&value.to_be_bytes());
    }
    Ok(pdu)
}

/// Expected length of the full response frame (unit id + PDU + CRC) for a
/// given request PDU. Exception responses are shorter and handled
/// separately by `frame::response_complete`.
pub fn expected_response_len(request_pdu: &[u8]) -> usize {
    match request_pdu.first() {
        Some(&FC_READ_HOLDING) if request_pdu.len() >= 5 => {
            let count = u16::from_be_bytes([request_pdu[3], request_pdu[4]]) as usize;
            // unit + fc + byte count + data + crc
            1 + 2 + count * 2 + 2
        },
        // FC06 and FC10 responses echo address + value/quantity.
        Some(&FC_WRITE_SINGLE) | Some(&FC_WRITE_MULTIPLE) => 1 + 5 + 2,
        _ => 5,
    }
}

/// Check a response PDU for exception / function-code mismatch.
fn check_function(pdu: &[u8], expected_fc: u8) -> Result<()> {
    let fc = *pdu
        .first()
        .ok_or_else(|| HilError::protocol("empty response PDU"))?;
    if fc == expected_fc | 0x80 {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(HilError::protocol(format!(
            "device exception 0x{:02X} ({}) for FC{:02X}",
            code,
            exception_name(code),
            expected_fc
        )));
    }
    if fc != expected_fc {
        return Err(HilError::protocol(format!(
            "function code mismatch: expected 0x{:02X}, got 0x{:02X}",
            expected_fc, fc
        )));
    }
    Ok(())
}

/// Parse an FC03 response PDU into register values.
pub fn parse_read_response(pdu: &[u8], count: u16) -> Result<Vec<u16>> {
    check_function(pdu, FC_READ_HOLDING)?;
    let byte_count = *pdu
        .get(1)
        .ok_or_else(|| HilError::protocol("truncated FC03 response"))? as usize;
    if byte_count != count as usize * 2 || pdu.len() < 2 + byte_count {
        return Err(HilError::protocol(format!(
            "FC03 byte count mismatch: expected {}, got {} ({} data bytes present)",
            count as usize * 2,
            byte_count,
            pdu.len().saturating_sub(2)
        )));
    }
    let mut values = Vec::with_capacity(count as usize);
    for chunk in pdu[2..2 + byte_count].chunks_exact(2) {
        values.push(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    Ok(values)
}

/// Parse an FC06/FC10 response PDU; a matching echo means success.
pub fn parse_write_response(pdu: &[u8], expected_fc: u8, address: u16) -> Result<()> {
    check_function(pdu, expected_fc)?;
    if pdu.len() < 5 {
        return Err(HilError::protocol("truncated write response"));
    }
    let echoed = u16::from_be_bytes([pdu[1], pdu[2]]);
    if echoed != address {
        return Err(HilError::protocol(format!(
            "write response address mismatch: expected 0x{:04X}, got 0x{:04X}",
            address, echoed
        )));
    }
    Ok(())
}

/// Standard exception code names, for diagnostics.
fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request_layout() {
        let pdu = build_read_request(0x1000, 2).unwrap();
        assert_eq!(pdu, vec![0x03, 0x10, 0x00, 0x00, 0x02]);
        assert_eq!(expected_response_len(&pdu), 1 + 2 + 4 + 2);
    }

    #[test]
    fn read_request_count_bounds() {
        assert!(build_read_request(0, 0).is_err());
        assert!(build_read_request(0, 126).is_err());
        assert!(build_read_request(0, 125).is_ok());
    }

    #[test]
    fn write_single_layout() {
        let pdu = build_write_single(0x1000, 5000);
        assert_eq!(pdu, vec![0x06, 0x10, 0x00, 0x13, 0x88]);
        assert_eq!(expected_response_len(&pdu), 8);
    }

    #[test]
    fn write_multiple_layout() {
        let pdu = build_write_multiple(0x0200, &[0xABCD, 0x1234]).unwrap();
        assert_eq!(
            pdu,
            vec![0x10, 0x02, 0x00, 0x00, 0x02, 0x04, 0xAB, 0xCD, 0x12, 0x34]
        );
    }

    #[test]
    fn write_multiple_count_bounds() {
        assert!(build_write_multiple(0, &[]).is_err());
        assert!(build_write_multiple(0, &vec![0; 124]).is_err());
    }

    #[test]
    fn read_response_parsed() {
        let pdu = vec![0x03, 0x04, 0x13, 0x88, 0x00, 0x2A];
        assert_eq!(parse_read_response(&pdu, 2).unwrap(), vec![5000, 42]);
    }

    #[test]
    fn read_response_byte_count_checked() {
        let pdu = vec![0x03, 0x02, 0x13, 0x88];
        assert!(parse_read_response(&pdu, 2).is_err());
    }

    #[test]
    fn exception_response_decoded() {
        let pdu = vec![0x86, 0x02];
        let err = parse_write_response(&pdu, FC_WRITE_SINGLE, 0x1000).unwrap_err();
        assert!(matches!(err, HilError::ModbusProtocolError(_)));
        assert!(err.to_string().contains("illegal data address"));
    }

    #[test]
    fn mismatched_function_code_rejected() {
        let pdu = vec![0x10, 0x10, 0x00, 0x00, 0x01];
        assert!(parse_write_response(&pdu, FC_WRITE_SINGLE, 0x1000).is_err());
    }

    #[test]
    fn write_echo_address_verified() {
        let pdu = vec![0x06, 0x20, 0x00, 0x00, 0x01];
        assert!(parse_write_response(&pdu, FC_WRITE_SINGLE, 0x2000).is_ok());
        assert!(parse_write_response(&pdu, FC_WRITE_SINGLE, 0x1000).is_err());
    }
}
