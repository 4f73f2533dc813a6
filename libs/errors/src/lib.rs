//! Unified error handling for the field controller crates
//!
//! Every library in the workspace returns [`FieldError`]. The variants are grouped
//! by the failure taxonomy the engines act on: transport faults reconnect and back
//! off, protocol faults surface immediately, validation faults never reach the
//! wire, device and automation faults stay local to the device or automation
//! that produced them.

use std::io::ErrorKind;
use thiserror::Error;

// ============================================================================
// FieldError - Main error type
// ============================================================================

/// Main error type for all field controller components
#[derive(Debug, Error)]
pub enum FieldError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // ======================================
    // Transport Errors
    // ======================================
    #[error("Connection failed: {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Timeout waiting for response from {0}")]
    Timeout(String),

    // ======================================
    // Protocol Errors
    // ======================================
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Modbus exception: function 0x{function:02X}, code 0x{code:02X}")]
    ModbusException { function: u8, code: u8 },

    // ======================================
    // Validation Errors
    // ======================================
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Out of range: {field}={value} not in [{min}, {max}]")]
    OutOfRange {
        field: String,
        value: String,
        min: String,
        max: String,
    },

    // ======================================
    // Device & Automation Errors
    // ======================================
    #[error("Device {device_id} error: {message}")]
    Device { device_id: i64, message: String },

    #[error("Automation error: {0}")]
    Automation(String),

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    // ======================================
    // Resource & Lifecycle Errors
    // ======================================
    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("Shutting down: {0}")]
    Shutdown(String),

    // ======================================
    // Storage Errors
    // ======================================
    #[error("Database error: {0}")]
    Database(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    // ======================================
    // I/O & Serialization Errors
    // ======================================
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ======================================
    // Catch-all
    // ======================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using FieldError
pub type FieldResult<T> = Result<T, FieldError>;

/// Coarse failure class used by retry and escalation policies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transport,
    Protocol,
    Validation,
    Device,
    Automation,
    Storage,
    Configuration,
    Internal,
}

impl FieldError {
    /// Classify the error
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ConnectionFailed { .. }
            | Self::ConnectionReset(_)
            | Self::NotConnected(_)
            | Self::Timeout(_) => ErrorClass::Transport,

            Self::Protocol(_) | Self::ModbusException { .. } => ErrorClass::Protocol,

            Self::Validation(_) | Self::OutOfRange { .. } => ErrorClass::Validation,

            Self::Device { .. } => ErrorClass::Device,

            Self::Automation(_) | Self::NotFound { .. } => ErrorClass::Automation,

            Self::Database(_) | Self::Sqlite(_) => ErrorClass::Storage,

            Self::Configuration(_) | Self::InvalidConfig { .. } => ErrorClass::Configuration,

            Self::ResourceBusy(_)
            | Self::Shutdown(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Internal(_)
            | Self::Other(_) => ErrorClass::Internal,
        }
    }

    /// Connection-level fault: reset, refused (port not open) or timeout.
    /// These trigger a reconnect with backoff.
    pub fn is_connection_fault(&self) -> bool {
        self.class() == ErrorClass::Transport
    }

    /// Malformed or exception response from the device
    pub fn is_protocol(&self) -> bool {
        self.class() == ErrorClass::Protocol
    }

    /// Rejected before any I/O took place
    pub fn is_validation(&self) -> bool {
        self.class() == ErrorClass::Validation
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.class(),
            ErrorClass::Protocol | ErrorClass::Validation | ErrorClass::Configuration
        ) && !matches!(self, Self::Shutdown(_))
    }

    /// Stable machine-readable code, used in device error logs and run logs
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::ConnectionReset(_) => "CONNECTION_RESET",
            Self::NotConnected(_) => "NOT_CONNECTED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::ModbusException { .. } => "MODBUS_EXCEPTION",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::OutOfRange { .. } => "OUT_OF_RANGE",
            Self::Device { .. } => "DEVICE_ERROR",
            Self::Automation(_) => "AUTOMATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::ResourceBusy(_) => "RESOURCE_BUSY",
            Self::Shutdown(_) => "SHUTDOWN",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Sqlite(_) => "SQLITE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Other(_) => "OTHER_ERROR",
        }
    }

    pub fn out_of_range(
        field: impl Into<String>,
        value: impl ToString,
        min: impl ToString,
        max: impl ToString,
    ) -> Self {
        Self::OutOfRange {
            field: field.into(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }
}

// Socket errors are split into transport faults (reconnect) and plain I/O faults
impl From<std::io::Error> for FieldError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::ConnectionRefused => Self::ConnectionFailed {
                endpoint: "peer".to_string(),
                reason: err.to_string(),
            },
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => Self::ConnectionReset(err.to_string()),
            ErrorKind::NotConnected => Self::NotConnected(err.to_string()),
            ErrorKind::TimedOut => Self::Timeout(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for FieldError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<figment::Error> for FieldError {
    fn from(err: figment::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

// Helper macros for creating errors
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::FieldError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::FieldError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! validation_error {
    ($msg:expr) => {
        $crate::FieldError::Validation($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::FieldError::Validation(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! protocol_error {
    ($msg:expr) => {
        $crate::FieldError::Protocol($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::FieldError::Protocol(format!($fmt, $($arg)*))
    };
}
