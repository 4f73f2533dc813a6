//! Modbus TCP protocol limits
//!
//! The PDU limit of 253 bytes is inherited from the serial ADU (256 bytes minus
//! slave address and CRC). Every per-function quantity limit follows from it.

/// MBAP header including the unit identifier:
/// transaction id (2) + protocol id (2) + length (2) + unit id (1)
pub const MBAP_HEADER_LEN: usize = 7;

pub const MAX_PDU_SIZE: usize = 253;

/// Largest MBAP length field (unit id + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// FC03/FC04: 1 + 1 + 2N <= 253
pub const MAX_READ_REGISTERS: u16 = 125;

/// FC16: 1 + 2 + 2 + 1 + 2N <= 253
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// FC01/FC02
pub const MAX_READ_COILS: u16 = 2000;

/// FC15
pub const MAX_WRITE_COILS: u16 = 1968;

/// FC05 payload values
pub const COIL_ON: u16 = 0xFF00;
pub const COIL_OFF: u16 = 0x0000;

/// Addressable unit ids on a TCP gateway
pub const MIN_UNIT_ID: u8 = 1;
pub const MAX_UNIT_ID: u8 = 247;

pub const DEFAULT_PORT: u16 = 502;
