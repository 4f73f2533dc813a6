//! Devices and their register mappings

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use errors::{validation_error, FieldError, FieldResult};
use serde::{Deserialize, Serialize};

/// Register reads accept at most 125 words
pub const MAX_REGISTER_READ: u16 = 125;
/// Coil mappings accept at most 1968 bits
pub const MAX_COIL_MAPPING: u16 = 1968;

pub const MIN_POLL_INTERVAL_MS: u64 = 100;
pub const MAX_POLL_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

// ============================================================================
// Function codes
// ============================================================================

/// Supported Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleCoils,
    WriteMultipleRegisters,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            Self::ReadCoils => 0x01,
            Self::ReadDiscreteInputs => 0x02,
            Self::ReadHoldingRegisters => 0x03,
            Self::ReadInputRegisters => 0x04,
            Self::WriteSingleCoil => 0x05,
            Self::WriteSingleRegister => 0x06,
            Self::WriteMultipleCoils => 0x0F,
            Self::WriteMultipleRegisters => 0x10,
        }
    }

    pub fn is_read(self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::ReadHoldingRegisters
                | Self::ReadInputRegisters
        )
    }

    /// Bit-addressed table (coils or discrete inputs)
    pub fn is_bit(self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::WriteSingleCoil
                | Self::WriteMultipleCoils
        )
    }

    /// Coil table (FC 1, 5, 15)
    pub fn is_coil(self) -> bool {
        matches!(
            self,
            Self::ReadCoils | Self::WriteSingleCoil | Self::WriteMultipleCoils
        )
    }

    /// Read used to poll a mapping declared with this function code.
    /// Write codes read back the table they write to.
    pub fn read_counterpart(self) -> Self {
        match self {
            Self::WriteSingleCoil | Self::WriteMultipleCoils => Self::ReadCoils,
            Self::WriteSingleRegister | Self::WriteMultipleRegisters => {
                Self::ReadHoldingRegisters
            },
            read => read,
        }
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = FieldError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x01 => Ok(Self::ReadCoils),
            0x02 => Ok(Self::ReadDiscreteInputs),
            0x03 => Ok(Self::ReadHoldingRegisters),
            0x04 => Ok(Self::ReadInputRegisters),
            0x05 => Ok(Self::WriteSingleCoil),
            0x06 => Ok(Self::WriteSingleRegister),
            0x0F => Ok(Self::WriteMultipleCoils),
            0x10 => Ok(Self::WriteMultipleRegisters),
            other => Err(validation_error!("unsupported function code {}", other)),
        }
    }
}

impl From<FunctionCode> for u8 {
    fn from(fc: FunctionCode) -> Self {
        fc.code()
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FC{:02}", self.code())
    }
}

// ============================================================================
// Data types
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float32,
    #[serde(alias = "bool")]
    Boolean,
}

impl DataType {
    /// Registers consumed by one value
    pub fn word_count(self) -> u16 {
        match self {
            Self::Uint32 | Self::Int32 | Self::Float32 => 2,
            Self::Uint16 | Self::Int16 | Self::Boolean => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uint16 => "uint16",
            Self::Int16 => "int16",
            Self::Uint32 => "uint32",
            Self::Int32 => "int32",
            Self::Float32 => "float32",
            Self::Boolean => "boolean",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    Read,
    Write,
    #[default]
    #[serde(alias = "rw")]
    ReadWrite,
}

// ============================================================================
// Register mapping
// ============================================================================

/// Named binding of a register range to a decoded value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterMapping {
    pub name: String,
    pub address: u16,
    /// Defaults to the word count of `data_type` (1 for bit tables)
    #[serde(default)]
    pub quantity: Option<u16>,
    pub function_code: FunctionCode,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default)]
    pub offset: Option<f64>,
    #[serde(default)]
    pub access: Access,
}

impl RegisterMapping {
    pub fn new(
        name: impl Into<String>,
        address: u16,
        function_code: FunctionCode,
        data_type: DataType,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            quantity: None,
            function_code,
            data_type,
            unit: None,
            scale: None,
            offset: None,
            access: Access::ReadWrite,
        }
    }

    pub fn effective_quantity(&self) -> u16 {
        self.quantity.unwrap_or_else(|| {
            if self.function_code.is_bit() {
                1
            } else {
                self.data_type.word_count()
            }
        })
    }

    /// Coil mapping usable as a relay channel
    pub fn is_relay_channel(&self) -> bool {
        self.function_code.is_coil() && self.access == Access::ReadWrite
    }

    pub fn is_polled(&self) -> bool {
        self.access != Access::Write
    }

    pub fn validate(&self) -> FieldResult<()> {
        let quantity = self.effective_quantity();
        let max = if self.function_code.is_bit() {
            MAX_COIL_MAPPING
        } else {
            MAX_REGISTER_READ
        };
        if quantity == 0 || quantity > max {
            return Err(FieldError::out_of_range(
                format!("{}.quantity", self.name),
                quantity,
                1,
                max,
            ));
        }
        if u32::from(self.address) + u32::from(quantity) > 65_536 {
            return Err(validation_error!(
                "mapping {} spans past register 65535 (address {}, quantity {})",
                self.name,
                self.address,
                quantity
            ));
        }
        if !self.function_code.is_bit() && quantity < self.data_type.word_count() {
            return Err(validation_error!(
                "mapping {} needs {} registers for {}",
                self.name,
                self.data_type.word_count(),
                self.data_type.as_str()
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Readings
// ============================================================================

/// Decoded register value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadingValue {
    Bool(bool),
    Number(f64),
}

impl ReadingValue {
    /// Numeric view; booleans map to 1.0 / 0.0
    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            },
            Self::Number(n) => n,
        }
    }
}

impl fmt::Display for ReadingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Number(n) => write!(f, "{}", n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub name: String,
    pub value: ReadingValue,
    #[serde(default)]
    pub unit: Option<String>,
}

/// Last known decoded state of a device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LastReading {
    /// Mapping name to decoded value
    #[serde(default)]
    pub values: BTreeMap<String, ReadingValue>,
    /// Relay channel (1-based) to on/off
    #[serde(default)]
    pub relays: BTreeMap<u16, bool>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl LastReading {
    pub fn from_readings(readings: &[Reading], relays: BTreeMap<u16, bool>) -> Self {
        Self {
            values: readings
                .iter()
                .map(|r| (r.name.clone(), r.value))
                .collect(),
            relays,
            updated_at: Some(Utc::now()),
        }
    }

    /// Exact-name lookup as a number
    pub fn value_of(&self, name: &str) -> Option<f64> {
        self.values.get(name).map(ReadingValue::as_f64)
    }
}

// ============================================================================
// Device
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    #[default]
    Offline,
    Warning,
    Error,
    Disabled,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Disabled => "disabled",
        }
    }

    /// Status after `consecutive_errors` failed polls in a row
    pub fn for_error_count(consecutive_errors: u32) -> Self {
        if consecutive_errors >= 3 {
            Self::Error
        } else {
            Self::Warning
        }
    }
}

impl std::str::FromStr for DeviceStatus {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "disabled" => Ok(Self::Disabled),
            other => Err(validation_error!("unknown device status '{}'", other)),
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

fn default_scale() -> f64 {
    1.0
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

/// Field device reachable over Modbus TCP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub unit_id: u8,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Writes are sent without waiting for an acknowledgement
    #[serde(default)]
    pub write_only: bool,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub mappings: Vec<RegisterMapping>,
    #[serde(default)]
    pub last_reading: LastReading,
    #[serde(default)]
    pub status: DeviceStatus,
}

fn default_port() -> u16 {
    502
}

impl Device {
    pub fn new(id: i64, name: impl Into<String>, host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self {
            id,
            name: name.into(),
            host: host.into(),
            port,
            unit_id,
            enabled: true,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            write_only: false,
            scale: 1.0,
            offset: 0.0,
            mappings: Vec::new(),
            last_reading: LastReading::default(),
            status: DeviceStatus::Offline,
        }
    }

    pub fn with_mappings(mut self, mappings: Vec<RegisterMapping>) -> Self {
        self.mappings = mappings;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Poll interval clamped to the supported range
    pub fn clamped_interval_ms(&self) -> u64 {
        self.poll_interval_ms
            .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS)
    }

    /// Relay channel mappings in declaration order
    pub fn relay_mappings(&self) -> impl Iterator<Item = &RegisterMapping> {
        self.mappings.iter().filter(|m| m.is_relay_channel())
    }

    /// Coil address for a 1-based relay channel.
    ///
    /// Channel `n` is the `n`-th relay mapping; beyond those it falls back to
    /// coil `n - 1`.
    pub fn coil_for_channel(&self, channel: u16) -> FieldResult<u16> {
        if channel == 0 {
            return Err(validation_error!("relay channels start at 1"));
        }
        Ok(self
            .relay_mappings()
            .nth(usize::from(channel - 1))
            .map(|m| m.address)
            .unwrap_or(channel - 1))
    }

    /// Fields that require the poller to be rebuilt when they change
    pub fn same_polling_config(&self, other: &Device) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.unit_id == other.unit_id
            && self.poll_interval_ms == other.poll_interval_ms
            && self.write_only == other.write_only
            && self.scale == other.scale
            && self.offset == other.offset
            && self.mappings == other.mappings
    }

    pub fn validate(&self) -> FieldResult<()> {
        for mapping in &self.mappings {
            mapping.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn coil(name: &str, address: u16) -> RegisterMapping {
        RegisterMapping::new(name, address, FunctionCode::ReadCoils, DataType::Boolean)
    }

    #[test]
    fn test_function_code_serde() {
        let mapping: RegisterMapping = serde_json::from_str(
            r#"{"name":"Temp","address":0,"function_code":4,"data_type":"int16"}"#,
        )
        .unwrap();
        assert_eq!(mapping.function_code, FunctionCode::ReadInputRegisters);
        assert_eq!(mapping.effective_quantity(), 1);
        assert_eq!(mapping.access, Access::ReadWrite);

        let bad = serde_json::from_str::<RegisterMapping>(
            r#"{"name":"x","address":0,"function_code":7}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_mapping_quantity_bounds() {
        let mut m = RegisterMapping::new("Power", 10, FunctionCode::ReadHoldingRegisters, DataType::Float32);
        assert_eq!(m.effective_quantity(), 2);
        assert!(m.validate().is_ok());

        m.quantity = Some(126);
        assert!(m.validate().unwrap_err().is_validation());

        let mut c = coil("relays", 0);
        c.quantity = Some(1968);
        assert!(c.validate().is_ok());
        c.quantity = Some(1969);
        assert!(c.validate().is_err());

        let mut tail = RegisterMapping::new("tail", 65535, FunctionCode::ReadHoldingRegisters, DataType::Uint32);
        tail.quantity = Some(2);
        assert!(tail.validate().is_err());
    }

    #[test]
    fn test_coil_for_channel() {
        let mut read_only = coil("status", 40);
        read_only.access = Access::Read;
        let device = Device::new(1, "relay board", "10.0.0.9", 502, 1).with_mappings(vec![
            coil("ch1", 16),
            read_only,
            RegisterMapping::new("temp", 0, FunctionCode::ReadInputRegisters, DataType::Int16),
            coil("ch2", 17),
        ]);

        assert_eq!(device.coil_for_channel(1).unwrap(), 16);
        assert_eq!(device.coil_for_channel(2).unwrap(), 17);
        assert_eq!(device.coil_for_channel(5).unwrap(), 4);
        assert!(device.coil_for_channel(0).is_err());
    }

    #[test]
    fn test_status_escalation() {
        assert_eq!(DeviceStatus::for_error_count(1), DeviceStatus::Warning);
        assert_eq!(DeviceStatus::for_error_count(2), DeviceStatus::Warning);
        assert_eq!(DeviceStatus::for_error_count(3), DeviceStatus::Error);
        assert_eq!("error".parse::<DeviceStatus>().unwrap(), DeviceStatus::Error);
    }

    #[test]
    fn test_last_reading_lookup() {
        let readings = vec![
            Reading {
                name: "temperature".to_string(),
                value: ReadingValue::Number(31.0),
                unit: Some("C".to_string()),
            },
            Reading {
                name: "door".to_string(),
                value: ReadingValue::Bool(true),
                unit: None,
            },
        ];
        let last = LastReading::from_readings(&readings, BTreeMap::new());
        assert_eq!(last.value_of("temperature"), Some(31.0));
        assert_eq!(last.value_of("door"), Some(1.0));
        assert_eq!(last.value_of("temp"), None);
    }

    #[test]
    fn test_device_from_yaml() {
        let yaml = r#"
id: 7
name: boiler
host: 10.0.0.5
unit_id: 1
mappings:
  - name: Temp
    address: 0
    function_code: 4
    data_type: int16
    scale: 0.1
"#;
        let device: Device = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(device.port, 502);
        assert_eq!(device.poll_interval_ms, 1000);
        assert_eq!(device.scale, 1.0);
        assert_eq!(device.mappings[0].scale, Some(0.1));
        assert_eq!(device.endpoint(), "10.0.0.5:502");
    }
}
