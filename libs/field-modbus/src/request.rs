//! Request and response model
//!
//! A [`Request`] is a plain data value; the pool queues it and a per-connection
//! worker executes it. Validation runs before anything touches the network.

use std::fmt;
use std::time::Duration;

use errors::{protocol_error, validation_error, FieldError, FieldResult};
use field_model::FunctionCode;

use crate::constants::{
    MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils { address: u16, quantity: u16 },
    ReadDiscreteInputs { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
}

impl Request {
    /// Read request for a read function code
    pub fn read(function_code: FunctionCode, address: u16, quantity: u16) -> FieldResult<Self> {
        match function_code {
            FunctionCode::ReadCoils => Ok(Self::ReadCoils { address, quantity }),
            FunctionCode::ReadDiscreteInputs => Ok(Self::ReadDiscreteInputs { address, quantity }),
            FunctionCode::ReadHoldingRegisters => {
                Ok(Self::ReadHoldingRegisters { address, quantity })
            },
            FunctionCode::ReadInputRegisters => Ok(Self::ReadInputRegisters { address, quantity }),
            other => Err(validation_error!("{} is not a read function", other)),
        }
    }

    pub fn function_code(&self) -> FunctionCode {
        match self {
            Self::ReadCoils { .. } => FunctionCode::ReadCoils,
            Self::ReadDiscreteInputs { .. } => FunctionCode::ReadDiscreteInputs,
            Self::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Self::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Self::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Self::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Self::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Self::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    pub fn address(&self) -> u16 {
        match self {
            Self::ReadCoils { address, .. }
            | Self::ReadDiscreteInputs { address, .. }
            | Self::ReadHoldingRegisters { address, .. }
            | Self::ReadInputRegisters { address, .. }
            | Self::WriteSingleCoil { address, .. }
            | Self::WriteSingleRegister { address, .. }
            | Self::WriteMultipleCoils { address, .. }
            | Self::WriteMultipleRegisters { address, .. } => *address,
        }
    }

    /// Number of coils or registers addressed
    pub fn quantity(&self) -> u16 {
        match self {
            Self::ReadCoils { quantity, .. }
            | Self::ReadDiscreteInputs { quantity, .. }
            | Self::ReadHoldingRegisters { quantity, .. }
            | Self::ReadInputRegisters { quantity, .. } => *quantity,
            Self::WriteSingleCoil { .. } | Self::WriteSingleRegister { .. } => 1,
            Self::WriteMultipleCoils { values, .. } => values.len().min(usize::from(u16::MAX)) as u16,
            Self::WriteMultipleRegisters { values, .. } => {
                values.len().min(usize::from(u16::MAX)) as u16
            },
        }
    }

    pub fn is_write(&self) -> bool {
        !self.function_code().is_read()
    }

    /// Reject out-of-range quantities and address spans
    pub fn validate(&self) -> FieldResult<()> {
        let max = match self {
            Self::ReadCoils { .. } | Self::ReadDiscreteInputs { .. } => MAX_READ_COILS,
            Self::ReadHoldingRegisters { .. } | Self::ReadInputRegisters { .. } => {
                MAX_READ_REGISTERS
            },
            Self::WriteSingleCoil { .. } | Self::WriteSingleRegister { .. } => 1,
            Self::WriteMultipleCoils { .. } => MAX_WRITE_COILS,
            Self::WriteMultipleRegisters { .. } => MAX_WRITE_REGISTERS,
        };

        let quantity = match self {
            Self::WriteMultipleCoils { values, .. } => values.len(),
            Self::WriteMultipleRegisters { values, .. } => values.len(),
            other => usize::from(other.quantity()),
        };
        if quantity == 0 || quantity > usize::from(max) {
            return Err(FieldError::out_of_range(
                format!("{} quantity", self.function_code()),
                quantity,
                1,
                max,
            ));
        }

        if usize::from(self.address()) + quantity > 65_536 {
            return Err(validation_error!(
                "{} spans past address 65535 (start {}, quantity {})",
                self.function_code(),
                self.address(),
                quantity
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}x{}",
            self.function_code(),
            self.address(),
            self.quantity()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Coil or discrete input states, truncated to the requested quantity
    Bits(Vec<bool>),
    /// Register words
    Words(Vec<u16>),
    /// Write acknowledged
    Ack,
}

impl Response {
    pub fn into_words(self) -> FieldResult<Vec<u16>> {
        match self {
            Self::Words(words) => Ok(words),
            other => Err(protocol_error!("expected register words, got {:?}", other)),
        }
    }

    pub fn into_bits(self) -> FieldResult<Vec<bool>> {
        match self {
            Self::Bits(bits) => Ok(bits),
            other => Err(protocol_error!("expected bits, got {:?}", other)),
        }
    }
}

/// Per-request execution options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    /// Bound on a single attempt
    pub timeout: Duration,
    /// Additional attempts after the first one fails
    pub retries: u32,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3000),
            retries: 3,
        }
    }
}
