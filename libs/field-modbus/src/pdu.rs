//! PDU encoding and response parsing

use bytes::{BufMut, Bytes, BytesMut};
use errors::{protocol_error, FieldError, FieldResult};
use tracing::trace;

use crate::constants::{COIL_OFF, COIL_ON, MAX_PDU_SIZE};
use crate::request::{Request, Response};

/// Fluent PDU builder
#[derive(Debug, Default)]
pub struct PduBuilder {
    buf: BytesMut,
}

impl PduBuilder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MAX_PDU_SIZE),
        }
    }

    pub fn function_code(mut self, fc: u8) -> Self {
        self.buf.put_u8(fc);
        self
    }

    pub fn address(mut self, address: u16) -> Self {
        self.buf.put_u16(address);
        self
    }

    pub fn quantity(mut self, quantity: u16) -> Self {
        self.buf.put_u16(quantity);
        self
    }

    pub fn word(self, value: u16) -> Self {
        self.quantity(value)
    }

    pub fn byte(mut self, byte: u8) -> Self {
        self.buf.put_u8(byte);
        self
    }

    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.buf.put_slice(data);
        self
    }

    pub fn build(self) -> FieldResult<Bytes> {
        if self.buf.len() > MAX_PDU_SIZE {
            return Err(protocol_error!(
                "PDU too large: {} bytes (max {})",
                self.buf.len(),
                MAX_PDU_SIZE
            ));
        }
        Ok(self.buf.freeze())
    }
}

/// Pack coil states LSB-first, 8 per byte
pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; values.len().div_ceil(8)];
    for (i, &on) in values.iter().enumerate() {
        if on {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    packed
}

pub fn unpack_bits(data: &[u8], quantity: usize) -> Vec<bool> {
    (0..quantity)
        .map(|i| data.get(i / 8).is_some_and(|byte| byte & (1 << (i % 8)) != 0))
        .collect()
}

/// Encode a validated request into its PDU
pub fn encode_request(request: &Request) -> FieldResult<Bytes> {
    request.validate()?;
    let fc = request.function_code().code();

    let builder = match request {
        Request::ReadCoils { address, quantity }
        | Request::ReadDiscreteInputs { address, quantity }
        | Request::ReadHoldingRegisters { address, quantity }
        | Request::ReadInputRegisters { address, quantity } => PduBuilder::new()
            .function_code(fc)
            .address(*address)
            .quantity(*quantity),
        Request::WriteSingleCoil { address, value } => PduBuilder::new()
            .function_code(fc)
            .address(*address)
            .word(if *value { COIL_ON } else { COIL_OFF }),
        Request::WriteSingleRegister { address, value } => PduBuilder::new()
            .function_code(fc)
            .address(*address)
            .word(*value),
        Request::WriteMultipleCoils { address, values } => {
            let packed = pack_bits(values);
            PduBuilder::new()
                .function_code(fc)
                .address(*address)
                .quantity(values.len() as u16)
                .byte(packed.len() as u8)
                .bytes(&packed)
        },
        Request::WriteMultipleRegisters { address, values } => {
            let mut builder = PduBuilder::new()
                .function_code(fc)
                .address(*address)
                .quantity(values.len() as u16)
                .byte((values.len() * 2) as u8);
            for value in values {
                builder = builder.word(*value);
            }
            builder
        },
    };

    builder.build()
}

/// Parse a response PDU against the request that produced it.
///
/// Exception responses become [`FieldError::ModbusException`]; any shape
/// mismatch is a protocol error.
pub fn decode_response(request: &Request, pdu: &[u8]) -> FieldResult<Response> {
    let expected_fc = request.function_code().code();
    let Some(&fc) = pdu.first() else {
        return Err(protocol_error!("empty response PDU"));
    };

    if fc & 0x80 != 0 {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(FieldError::ModbusException { function: fc, code });
    }
    if fc != expected_fc {
        return Err(protocol_error!(
            "function code mismatch: expected {:02X}, got {:02X}",
            expected_fc,
            fc
        ));
    }

    match request {
        Request::ReadCoils { quantity, .. } | Request::ReadDiscreteInputs { quantity, .. } => {
            let data = read_payload(pdu)?;
            let expected = usize::from(*quantity).div_ceil(8);
            if data.len() != expected {
                return Err(protocol_error!(
                    "bit response carries {} bytes, expected {}",
                    data.len(),
                    expected
                ));
            }
            Ok(Response::Bits(unpack_bits(data, usize::from(*quantity))))
        },
        Request::ReadHoldingRegisters { quantity, .. }
        | Request::ReadInputRegisters { quantity, .. } => {
            let data = read_payload(pdu)?;
            if data.len() != usize::from(*quantity) * 2 {
                return Err(protocol_error!(
                    "register response carries {} bytes, expected {}",
                    data.len(),
                    usize::from(*quantity) * 2
                ));
            }
            let words = data
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            Ok(Response::Words(words))
        },
        _ => {
            // Write responses echo address and value/quantity
            if pdu.len() != 5 {
                return Err(protocol_error!("write response has {} bytes, expected 5", pdu.len()));
            }
            let address = u16::from_be_bytes([pdu[1], pdu[2]]);
            if address != request.address() {
                return Err(protocol_error!(
                    "write response address {} does not match request {}",
                    address,
                    request.address()
                ));
            }
            trace!("Write acknowledged: {}", request);
            Ok(Response::Ack)
        },
    }
}

fn read_payload(pdu: &[u8]) -> FieldResult<&[u8]> {
    let byte_count = usize::from(
        *pdu.get(1)
            .ok_or_else(|| protocol_error!("read response missing byte count"))?,
    );
    let data = &pdu[2..];
    if data.len() != byte_count {
        return Err(protocol_error!(
            "byte count {} does not match payload length {}",
            byte_count,
            data.len()
        ));
    }
    Ok(data)
}
