#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use field_modbus::transport::mock::{MockConnector, MockState};
use field_model::{
    ActionConfig, Automation, CompareOp, ControlAction, DataType, Device, DeviceStatus,
    FunctionCode, Reading, ReadingValue, RegisterMapping, RelayCommand, ThresholdTrigger,
    TriggerConfig,
};
use field_store::{DeviceStore, EventPublisher, MemoryStore, RecordingPublisher, Store};
use fieldsrv::{FieldRuntime, RuntimeDeps, ServiceConfig};
use tempfile::TempDir;

const BOARD: &str = "10.0.0.9";

struct Harness {
    store: Arc<MemoryStore>,
    publisher: Arc<RecordingPublisher>,
    modbus: Arc<MockState>,
    _logs: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            publisher: Arc::new(RecordingPublisher::new()),
            modbus: MockState::new(),
            _logs: TempDir::new().unwrap(),
        }
    }

    async fn start(&self, config: &ServiceConfig) -> FieldRuntime {
        FieldRuntime::start(
            config,
            RuntimeDeps {
                store: Arc::clone(&self.store) as Arc<dyn Store>,
                connector: Arc::new(MockConnector::new(Arc::clone(&self.modbus))),
                publisher: Arc::clone(&self.publisher) as Arc<dyn EventPublisher>,
                run_log_root: Some(self._logs.path().to_path_buf()),
            },
        )
        .await
        .unwrap()
    }
}

/// Relay board: pump relay on coil 16 (channel 1), temperature on input register 0
fn relay_board() -> Device {
    Device::new(1, "boiler room", BOARD, 502, 1).with_mappings(vec![
        RegisterMapping::new("pump", 16, FunctionCode::ReadCoils, DataType::Boolean),
        RegisterMapping::new("temp", 0, FunctionCode::ReadInputRegisters, DataType::Int16),
    ])
}

fn pump_on_when_hot() -> Automation {
    let trigger = TriggerConfig::Threshold(ThresholdTrigger {
        device_id: 1,
        sensor: "temp".to_string(),
        operator: CompareOp::Gt,
        threshold_value: 30.0,
    });
    Automation::new(10, "pump on when hot", &trigger)
        .unwrap()
        .with_actions(vec![ActionConfig::Control(ControlAction::channel(
            1,
            1,
            RelayCommand::On,
        ))])
}

#[tokio::test(start_paused = true)]
async fn threshold_automation_switches_polled_relay() {
    let h = Harness::new();
    h.modbus.set_register(BOARD, 1, 0, 35);
    h.store.upsert_device(relay_board());
    h.store.upsert_automation(pump_on_when_hot());

    let runtime = h.start(&ServiceConfig::default()).await;
    assert!(runtime.scheduler().is_some());

    tokio::time::sleep(Duration::from_secs(31)).await;

    assert!(h.modbus.coil(BOARD, 1, 16));
    assert_eq!(h.store.run_logs().len(), 1);
    assert_eq!(h.store.automation(10).unwrap().run_count, 1);

    let device = h.store.device(1).unwrap();
    assert_eq!(device.status, DeviceStatus::Online);
    assert_eq!(device.last_reading.relays.get(&1), Some(&true));
    assert_eq!(
        device.last_reading.values.get("temp"),
        Some(&ReadingValue::Number(35.0))
    );
    assert_eq!(h.publisher.of_type("automation_executed").len(), 1);

    runtime.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_timers_and_closes_connections() {
    let h = Harness::new();
    h.store.upsert_device(relay_board());
    let mut timed = pump_on_when_hot();
    timed.actions = vec![ActionConfig::Control(ControlAction {
        duration_seconds: 60,
        ..ControlAction::channel(1, 1, RelayCommand::On)
    })];
    h.store.upsert_automation(timed);

    let runtime = h.start(&ServiceConfig::default()).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let scheduler = Arc::clone(runtime.scheduler().unwrap());
    scheduler.run_now(10).await.unwrap();
    assert_eq!(runtime.timers().pending().len(), 1);
    assert!(!runtime.pool().is_empty());

    let timers = Arc::clone(runtime.timers());
    let pool = runtime.pool().clone();
    let polling = runtime.polling().clone();
    runtime.stop().await;

    assert!(timers.is_empty());
    assert!(pool.is_empty());
    assert!(!polling.is_running());
    assert!(!scheduler.is_running());
}

#[tokio::test(start_paused = true)]
async fn history_older_than_retention_is_pruned_at_startup() {
    let h = Harness::new();
    let reading = Reading {
        name: "temp".to_string(),
        value: ReadingValue::Number(21.5),
        unit: None,
    };
    let now = Utc::now();
    h.store
        .append_readings(1, &[reading.clone()], now - chrono::Duration::days(40))
        .await
        .unwrap();
    h.store.append_readings(1, &[reading], now).await.unwrap();

    let runtime = h.start(&ServiceConfig::default()).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let history = h.store.history_for(1);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].recorded_at, now);

    runtime.stop().await;
}

#[tokio::test(start_paused = true)]
async fn automation_can_be_disabled_by_configuration() {
    let h = Harness::new();
    h.modbus.set_register(BOARD, 1, 0, 35);
    h.store.upsert_device(relay_board());
    h.store.upsert_automation(pump_on_when_hot());

    let mut config = ServiceConfig::default();
    config.automation.enabled = false;
    let runtime = h.start(&config).await;
    assert!(runtime.scheduler().is_none());

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(!h.modbus.coil(BOARD, 1, 16));
    assert!(h.store.run_logs().is_empty());
    assert_eq!(runtime.polling().len(), 1);

    runtime.stop().await;
}

#[tokio::test]
async fn invalid_configuration_refuses_to_start() {
    let h = Harness::new();
    let mut config = ServiceConfig::default();
    config.modbus.timeout_ms = 0;

    let result = FieldRuntime::start(
        &config,
        RuntimeDeps {
            store: Arc::clone(&h.store) as Arc<dyn Store>,
            connector: Arc::new(MockConnector::new(Arc::clone(&h.modbus))),
            publisher: Arc::clone(&h.publisher) as Arc<dyn EventPublisher>,
            run_log_root: None,
        },
    )
    .await;
    assert!(result.is_err());
    assert_eq!(h.modbus.connect_count(), 0);
}
