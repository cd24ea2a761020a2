//! Modbus TCP constants

/// MBAP header length: transaction(2) + protocol(2) + length(2) + unit(1)
pub const MBAP_HEADER_LEN: usize = 7;

/// Protocol identifier, always zero for Modbus
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// Maximum PDU size in bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Read Holding Registers
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Maximum registers per FC03 request
pub const MODBUS_MAX_READ_REGISTERS: u16 = 125;

/// Human readable name for a Modbus exception code
pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown exception",
    }
}
