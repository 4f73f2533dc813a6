//! Register codec
//!
//! Pure conversions between raw register words and typed values. Multi-word
//! types are big-endian, high word first. Calibration is linear and applied
//! at mapping level and device level.

use errors::{protocol_error, FieldResult};
use field_model::{DataType, Device, ReadingValue, RegisterMapping};

/// Decode raw words as the given data type (no calibration)
pub fn decode(words: &[u16], data_type: DataType) -> FieldResult<ReadingValue> {
    let needed = usize::from(data_type.word_count());
    if words.len() < needed {
        return Err(protocol_error!(
            "{} needs {} registers, got {}",
            data_type.as_str(),
            needed,
            words.len()
        ));
    }

    let value = match data_type {
        DataType::Uint16 => ReadingValue::Number(f64::from(words[0])),
        DataType::Int16 => ReadingValue::Number(f64::from(words[0] as i16)),
        DataType::Uint32 => ReadingValue::Number(f64::from(join_words(words[0], words[1]))),
        DataType::Int32 => ReadingValue::Number(f64::from(join_words(words[0], words[1]) as i32)),
        DataType::Float32 => {
            ReadingValue::Number(f64::from(f32::from_bits(join_words(words[0], words[1]))))
        },
        DataType::Boolean => ReadingValue::Bool(words[0] != 0),
    };
    Ok(value)
}

/// Coil and discrete input reads decode from their first bit
pub fn decode_bits(bits: &[bool]) -> FieldResult<ReadingValue> {
    bits.first()
        .map(|&b| ReadingValue::Bool(b))
        .ok_or_else(|| protocol_error!("empty bit response"))
}

/// Encode a value into register words, inverse of [`decode`]
pub fn encode(value: f64, data_type: DataType) -> Vec<u16> {
    match data_type {
        DataType::Uint16 => vec![value.round() as u16],
        DataType::Int16 => vec![value.round() as i16 as u16],
        DataType::Uint32 => split_words(value.round() as u32).to_vec(),
        DataType::Int32 => split_words(value.round() as i32 as u32).to_vec(),
        DataType::Float32 => split_words((value as f32).to_bits()).to_vec(),
        DataType::Boolean => vec![u16::from(value != 0.0)],
    }
}

/// `raw × mapping_scale × device_scale + mapping_offset + device_offset`,
/// rounded to 3 decimals
pub fn calibrate(
    raw: f64,
    mapping_scale: Option<f64>,
    mapping_offset: Option<f64>,
    device_scale: f64,
    device_offset: f64,
) -> f64 {
    let value = raw * mapping_scale.unwrap_or(1.0) * device_scale
        + mapping_offset.unwrap_or(0.0)
        + device_offset;
    (value * 1000.0).round() / 1000.0
}

/// Decode a mapping's register words and apply calibration.
/// Booleans are never calibrated.
pub fn decode_mapping(
    words: &[u16],
    mapping: &RegisterMapping,
    device: &Device,
) -> FieldResult<ReadingValue> {
    Ok(calibrated(decode(words, mapping.data_type)?, mapping, device))
}

/// Same as [`decode_mapping`] for bit reads
pub fn decode_mapping_bits(
    bits: &[bool],
    mapping: &RegisterMapping,
    device: &Device,
) -> FieldResult<ReadingValue> {
    Ok(calibrated(decode_bits(bits)?, mapping, device))
}

fn calibrated(value: ReadingValue, mapping: &RegisterMapping, device: &Device) -> ReadingValue {
    match value {
        ReadingValue::Number(raw) => ReadingValue::Number(calibrate(
            raw,
            mapping.scale,
            mapping.offset,
            device.scale,
            device.offset,
        )),
        b @ ReadingValue::Bool(_) => b,
    }
}

fn join_words(high: u16, low: u16) -> u32 {
    (u32::from(high) << 16) | u32::from(low)
}

fn split_words(value: u32) -> [u16; 2] {
    [(value >> 16) as u16, value as u16]
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use field_model::FunctionCode;

    fn number(words: &[u16], dt: DataType) -> f64 {
        decode(words, dt).unwrap().as_f64()
    }

    #[test]
    fn test_int16_full_range() {
        for v in i16::MIN..=i16::MAX {
            let words = encode(f64::from(v), DataType::Int16);
            assert_eq!(number(&words, DataType::Int16), f64::from(v));
        }
        assert_eq!(number(&[0xFFFF], DataType::Int16), -1.0);
        assert_eq!(number(&[0x8000], DataType::Int16), -32768.0);
        assert_eq!(number(&[0x7FFF], DataType::Int16), 32767.0);
    }

    #[test]
    fn test_32bit_word_order() {
        assert_eq!(number(&[0x0001, 0x0002], DataType::Uint32), 65538.0);
        assert_eq!(number(&[0xFFFF, 0xFFFE], DataType::Int32), -2.0);
        for v in [i32::MIN, -100_000, -1, 0, 1, 123_456_789, i32::MAX] {
            let words = encode(f64::from(v), DataType::Int32);
            assert_eq!(number(&words, DataType::Int32), f64::from(v));
        }
        assert_eq!(
            number(&encode(f64::from(u32::MAX), DataType::Uint32), DataType::Uint32),
            f64::from(u32::MAX)
        );
    }

    #[test]
    fn test_float32() {
        // 0x41C8_0000 == 25.0
        assert_eq!(number(&[0x41C8, 0x0000], DataType::Float32), 25.0);
        for v in [0.0f32, -1.5, 3.25, 1.0e-3, f32::MAX, f32::MIN_POSITIVE] {
            let words = encode(f64::from(v), DataType::Float32);
            assert_eq!(number(&words, DataType::Float32), f64::from(v));
        }
    }

    #[test]
    fn test_boolean_and_short_input() {
        assert_eq!(decode(&[0], DataType::Boolean).unwrap(), ReadingValue::Bool(false));
        assert_eq!(decode(&[7], DataType::Boolean).unwrap(), ReadingValue::Bool(true));
        assert!(decode(&[1], DataType::Float32).unwrap_err().is_protocol());
        assert!(decode_bits(&[]).is_err());
    }

    #[test]
    fn test_calibration() {
        assert_eq!(calibrate(100.0, None, None, 1.0, 0.0), 100.0);
        assert_eq!(calibrate(100.0, Some(0.1), Some(2.0), 2.0, -1.0), 21.0);
        assert_eq!(calibrate(1.0, Some(1.0 / 3.0), None, 1.0, 0.0), 0.333);
    }

    #[test]
    fn test_decode_mapping_applies_both_levels() {
        let mut device = Device::new(1, "meter", "10.0.0.5", 502, 1);
        device.scale = 0.5;
        device.offset = 1.0;
        let mut mapping =
            RegisterMapping::new("Temp", 0, FunctionCode::ReadInputRegisters, DataType::Int16);
        mapping.scale = Some(0.1);

        let value = decode_mapping(&[0xFF9C], &mapping, &device).unwrap();
        // -100 * 0.1 * 0.5 + 1.0
        assert_eq!(value, ReadingValue::Number(-4.0));

        let coil = RegisterMapping::new("Pump", 0, FunctionCode::ReadCoils, DataType::Boolean);
        assert_eq!(
            decode_mapping_bits(&[true], &coil, &device).unwrap(),
            ReadingValue::Bool(true)
        );
    }
}
