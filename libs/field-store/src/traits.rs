//! Persistence and notification boundaries consumed by the engines

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use errors::FieldResult;
use field_model::{
    Alert, Automation, AutomationRunLog, Device, DeviceStatus, FieldEvent, LastReading, Reading,
};
use serde::{Deserialize, Serialize};

/// Entry in a device's error log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceErrorRecord {
    pub device_id: i64,
    pub error_code: String,
    pub message: String,
    pub consecutive_errors: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Device read model and the state the polling engine and executor write back
///
/// Implementations:
/// - `SqliteStore`: sqlx-backed production store
/// - `MemoryStore`: in-memory store for tests and embedding
#[async_trait]
pub trait DeviceStore: Send + Sync + 'static {
    /// All devices with mappings, including disabled ones
    async fn list_devices(&self) -> FieldResult<Vec<Device>>;

    async fn get_device(&self, id: i64) -> FieldResult<Option<Device>>;

    async fn update_device_status(&self, id: i64, status: DeviceStatus) -> FieldResult<()>;

    /// Replace decoded values and `updated_at`.
    /// Relay entries in `reading` are merged into the cached relay map.
    async fn save_last_reading(&self, id: i64, reading: &LastReading) -> FieldResult<()>;

    /// Update one cached relay channel
    async fn set_relay_state(&self, id: i64, channel: u16, on: bool) -> FieldResult<()>;

    /// Append to reading history
    async fn append_readings(
        &self,
        id: i64,
        readings: &[Reading],
        at: DateTime<Utc>,
    ) -> FieldResult<()>;

    async fn log_device_error(&self, record: &DeviceErrorRecord) -> FieldResult<()>;

    /// Delete history recorded before `cutoff`, returning rows removed
    async fn prune_readings(&self, cutoff: DateTime<Utc>) -> FieldResult<u64>;
}

#[async_trait]
pub trait AutomationStore: Send + Sync + 'static {
    /// Enabled automations ordered by priority (highest first), then id
    async fn list_enabled_automations(&self) -> FieldResult<Vec<Automation>>;

    async fn get_automation(&self, id: i64) -> FieldResult<Option<Automation>>;

    /// Increment `run_count` and set `last_run`
    async fn record_automation_run(&self, id: i64, at: DateTime<Utc>) -> FieldResult<()>;

    async fn set_automation_enabled(&self, id: i64, enabled: bool) -> FieldResult<()>;

    async fn insert_run_log(&self, log: &AutomationRunLog) -> FieldResult<()>;

    async fn insert_alert(&self, alert: &Alert) -> FieldResult<()>;
}

/// Everything the core reads from and writes to persistence
pub trait Store: DeviceStore + AutomationStore {}

impl<T: DeviceStore + AutomationStore> Store for T {}

/// Push-notification channel; delivery is best effort
pub trait EventPublisher: Send + Sync + 'static {
    fn publish(&self, event: FieldEvent);
}
