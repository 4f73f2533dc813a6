//! Push-notification events
//!
//! Every event carries its type tag and a timestamp. Delivery is best effort.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::automation::{RunSource, RunStatus};
use crate::device::{DeviceStatus, Reading};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl FieldEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self.payload {
            EventPayload::DeviceReading { .. } => "device_reading",
            EventPayload::DeviceStatus { .. } => "device_status",
            EventPayload::DeviceError { .. } => "device_error",
            EventPayload::RelayState { .. } => "relay_state",
            EventPayload::AutomationExecuted { .. } => "automation_executed",
        }
    }
}

/// Why a relay changed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayChangeCause {
    Control,
    DelayedStart,
    AutoOff,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    DeviceReading {
        device_id: i64,
        status: DeviceStatus,
        readings: Vec<Reading>,
    },
    DeviceStatus {
        device_id: i64,
        status: DeviceStatus,
    },
    DeviceError {
        device_id: i64,
        status: DeviceStatus,
        consecutive_errors: u32,
        error: String,
    },
    RelayState {
        device_id: i64,
        channel: u16,
        coil_address: u16,
        state: bool,
        cause: RelayChangeCause,
    },
    AutomationExecuted {
        automation_id: i64,
        name: String,
        source: RunSource,
        status: RunStatus,
        actions_executed: usize,
    },
}
