//! Modbus TCP frame handling
//!
//! MBAP header construction and parsing plus the Read Holding Registers
//! request/response pair, the only function this service issues.

use bytes::{BufMut, Bytes, BytesMut};

use super::constants::{
    EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, MAX_PDU_SIZE, MBAP_HEADER_LEN,
    MODBUS_MAX_READ_REGISTERS, MODBUS_PROTOCOL_ID,
};
use crate::core::transport::TransportError;

/// MBAP (Modbus Application Protocol) header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count of unit id plus PDU
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn new(transaction_id: u16, unit_id: u8, pdu_length: u16) -> Self {
        Self {
            transaction_id,
            protocol_id: MODBUS_PROTOCOL_ID,
            length: pdu_length + 1,
            unit_id,
        }
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.transaction_id);
        buf.put_u16(self.protocol_id);
        buf.put_u16(self.length);
        buf.put_u8(self.unit_id);
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        if data.len() < MBAP_HEADER_LEN {
            return Err(TransportError::ProtocolError(format!(
                "MBAP header too short: {} bytes",
                data.len()
            )));
        }

        let header = Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            unit_id: data[6],
        };

        if header.protocol_id != MODBUS_PROTOCOL_ID {
            return Err(TransportError::ProtocolError(format!(
                "Invalid protocol ID: {}",
                header.protocol_id
            )));
        }

        if header.length == 0 || header.pdu_length() > MAX_PDU_SIZE {
            return Err(TransportError::ProtocolError(format!(
                "Invalid MBAP length: {}",
                header.length
            )));
        }

        Ok(header)
    }

    /// PDU length announced by the header
    pub fn pdu_length(&self) -> usize {
        self.length.saturating_sub(1) as usize
    }
}

/// FC03 request for a contiguous register range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadHoldingRequest {
    pub transaction_id: u16,
    pub unit_id: u8,
    /// Zero-based wire address
    pub address: u16,
    pub count: u16,
}

impl ReadHoldingRequest {
    pub fn new(
        transaction_id: u16,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Self, TransportError> {
        if count == 0 || count > MODBUS_MAX_READ_REGISTERS {
            return Err(TransportError::ProtocolError(format!(
                "Register count {} outside 1..={}",
                count, MODBUS_MAX_READ_REGISTERS
            )));
        }
        Ok(Self {
            transaction_id,
            unit_id,
            address,
            count,
        })
    }

    /// Serialize to a complete ADU (MBAP header + PDU)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + 5);
        MbapHeader::new(self.transaction_id, self.unit_id, 5).write_to(&mut buf);
        buf.put_u8(FC_READ_HOLDING_REGISTERS);
        buf.put_u16(self.address);
        buf.put_u16(self.count);
        buf.freeze()
    }
}

/// Validate a response ADU against its request and extract the registers
pub fn decode_read_response(
    request: &ReadHoldingRequest,
    header: &MbapHeader,
    pdu: &[u8],
) -> Result<Vec<u16>, TransportError> {
    if header.transaction_id != request.transaction_id {
        return Err(TransportError::ProtocolError(format!(
            "Transaction ID mismatch: sent {}, received {}",
            request.transaction_id, header.transaction_id
        )));
    }

    if header.unit_id != request.unit_id {
        return Err(TransportError::ProtocolError(format!(
            "Unit ID mismatch: sent {}, received {}",
            request.unit_id, header.unit_id
        )));
    }

    let Some(&function) = pdu.first() else {
        return Err(TransportError::ProtocolError("Empty response PDU".to_string()));
    };

    if function == FC_READ_HOLDING_REGISTERS | EXCEPTION_FLAG {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(TransportError::Exception {
            function: FC_READ_HOLDING_REGISTERS,
            code,
        });
    }

    if function != FC_READ_HOLDING_REGISTERS {
        return Err(TransportError::ProtocolError(format!(
            "Unexpected function code 0x{:02X}",
            function
        )));
    }

    let byte_count = pdu.get(1).copied().unwrap_or(0) as usize;
    let data = &pdu[2.min(pdu.len())..];
    if byte_count != request.count as usize * 2 || data.len() < byte_count {
        return Err(TransportError::ProtocolError(format!(
            "Short read: expected {} registers, got {} bytes",
            request.count,
            data.len().min(byte_count)
        )));
    }

    Ok(data[..byte_count]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}
