//! Field controller data model
//!
//! Plain serde types shared by the Modbus client, the polling engine, the
//! automation engine and the persistence boundary.
//!
//! - `device`: devices, register mappings, decoded readings, status
//! - `automation`: triggers, actions, run records, alerts
//! - `event`: push-notification events

pub mod automation;
pub mod device;
pub mod event;

pub use automation::{
    ActionConfig, ActionOutcome, ActionStatus, Alert, AlertSeverity, Automation,
    AutomationRunLog, ChannelOutcome, CompareOp, ControlAction, RelayCommand, RunSource,
    RunStatus, ScheduleTrigger, ThresholdTrigger, TriggerConfig,
};
pub use device::{
    Access, DataType, Device, DeviceStatus, FunctionCode, LastReading, Reading, ReadingValue,
    RegisterMapping, DEFAULT_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS, MIN_POLL_INTERVAL_MS,
};
pub use event::{EventPayload, FieldEvent, RelayChangeCause};
