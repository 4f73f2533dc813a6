//! In-memory store
//!
//! Implements both store traits over `parking_lot` locks. Used by the test
//! suites and for embedding the engines without a database.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use errors::{FieldError, FieldResult};
use field_model::{
    Alert, Automation, AutomationRunLog, Device, DeviceStatus, LastReading, Reading,
};
use parking_lot::RwLock;

use crate::traits::{AutomationStore, DeviceErrorRecord, DeviceStore};

/// History row kept by [`MemoryStore`]
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub device_id: i64,
    pub reading: Reading,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryStore {
    devices: RwLock<BTreeMap<i64, Device>>,
    automations: RwLock<BTreeMap<i64, Automation>>,
    history: RwLock<Vec<HistoryEntry>>,
    device_errors: RwLock<Vec<DeviceErrorRecord>>,
    run_logs: RwLock<Vec<AutomationRunLog>>,
    alerts: RwLock<Vec<Alert>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a device
    pub fn upsert_device(&self, device: Device) {
        self.devices.write().insert(device.id, device);
    }

    pub fn remove_device(&self, id: i64) -> Option<Device> {
        self.devices.write().remove(&id)
    }

    /// Insert or replace an automation
    pub fn upsert_automation(&self, automation: Automation) {
        self.automations.write().insert(automation.id, automation);
    }

    pub fn device(&self, id: i64) -> Option<Device> {
        self.devices.read().get(&id).cloned()
    }

    pub fn automation(&self, id: i64) -> Option<Automation> {
        self.automations.read().get(&id).cloned()
    }

    pub fn history_for(&self, device_id: i64) -> Vec<HistoryEntry> {
        self.history
            .read()
            .iter()
            .filter(|h| h.device_id == device_id)
            .cloned()
            .collect()
    }

    pub fn errors_for(&self, device_id: i64) -> Vec<DeviceErrorRecord> {
        self.device_errors
            .read()
            .iter()
            .filter(|e| e.device_id == device_id)
            .cloned()
            .collect()
    }

    pub fn run_logs(&self) -> Vec<AutomationRunLog> {
        self.run_logs.read().clone()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().clone()
    }

    fn with_device<R>(&self, id: i64, f: impl FnOnce(&mut Device) -> R) -> FieldResult<R> {
        let mut devices = self.devices.write();
        let device = devices
            .get_mut(&id)
            .ok_or_else(|| FieldError::not_found(format!("device {}", id)))?;
        Ok(f(device))
    }

    fn with_automation<R>(&self, id: i64, f: impl FnOnce(&mut Automation) -> R) -> FieldResult<R> {
        let mut automations = self.automations.write();
        let automation = automations
            .get_mut(&id)
            .ok_or_else(|| FieldError::not_found(format!("automation {}", id)))?;
        Ok(f(automation))
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn list_devices(&self) -> FieldResult<Vec<Device>> {
        Ok(self.devices.read().values().cloned().collect())
    }

    async fn get_device(&self, id: i64) -> FieldResult<Option<Device>> {
        Ok(self.device(id))
    }

    async fn update_device_status(&self, id: i64, status: DeviceStatus) -> FieldResult<()> {
        self.with_device(id, |d| d.status = status)
    }

    async fn save_last_reading(&self, id: i64, reading: &LastReading) -> FieldResult<()> {
        self.with_device(id, |d| {
            d.last_reading.values = reading.values.clone();
            d.last_reading.updated_at = reading.updated_at;
            for (channel, on) in &reading.relays {
                d.last_reading.relays.insert(*channel, *on);
            }
        })
    }

    async fn set_relay_state(&self, id: i64, channel: u16, on: bool) -> FieldResult<()> {
        self.with_device(id, |d| {
            d.last_reading.relays.insert(channel, on);
        })
    }

    async fn append_readings(
        &self,
        id: i64,
        readings: &[Reading],
        at: DateTime<Utc>,
    ) -> FieldResult<()> {
        let mut history = self.history.write();
        history.extend(readings.iter().map(|r| HistoryEntry {
            device_id: id,
            reading: r.clone(),
            recorded_at: at,
        }));
        Ok(())
    }

    async fn log_device_error(&self, record: &DeviceErrorRecord) -> FieldResult<()> {
        self.device_errors.write().push(record.clone());
        Ok(())
    }

    async fn prune_readings(&self, cutoff: DateTime<Utc>) -> FieldResult<u64> {
        let mut history = self.history.write();
        let before = history.len();
        history.retain(|h| h.recorded_at >= cutoff);
        Ok((before - history.len()) as u64)
    }
}

#[async_trait]
impl AutomationStore for MemoryStore {
    async fn list_enabled_automations(&self) -> FieldResult<Vec<Automation>> {
        let mut enabled: Vec<Automation> = self
            .automations
            .read()
            .values()
            .filter(|a| a.enabled)
            .cloned()
            .collect();
        enabled.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(enabled)
    }

    async fn get_automation(&self, id: i64) -> FieldResult<Option<Automation>> {
        Ok(self.automation(id))
    }

    async fn record_automation_run(&self, id: i64, at: DateTime<Utc>) -> FieldResult<()> {
        self.with_automation(id, |a| {
            a.run_count += 1;
            a.last_run = Some(at);
        })
    }

    async fn set_automation_enabled(&self, id: i64, enabled: bool) -> FieldResult<()> {
        self.with_automation(id, |a| a.enabled = enabled)
    }

    async fn insert_run_log(&self, log: &AutomationRunLog) -> FieldResult<()> {
        self.run_logs.write().push(log.clone());
        Ok(())
    }

    async fn insert_alert(&self, alert: &Alert) -> FieldResult<()> {
        self.alerts.write().push(alert.clone());
        Ok(())
    }
}
