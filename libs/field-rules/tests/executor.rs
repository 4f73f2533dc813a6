#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use errors::{FieldError, FieldResult};
use field_modbus::transport::mock::{MockConnector, MockState};
use field_modbus::{ConnectionPool, PoolConfig};
use field_model::{
    ActionConfig, ActionStatus, Alert, AlertSeverity, Automation, AutomationRunLog,
    ControlAction, DataType, Device, DeviceStatus, EventPayload, FunctionCode, LastReading,
    Reading, RegisterMapping, RelayChangeCause, RelayCommand, RunSource, RunStatus,
    TriggerConfig,
};
use field_rules::{ActionExecutor, RelayTimers, RunLoggerManager, TimerKey, TimerPurpose};
use field_store::{
    AutomationStore, DeviceErrorRecord, DeviceStore, EventPublisher, MemoryStore,
    RecordingPublisher, Store,
};
use tokio::time::Instant;

const BOARD: &str = "relay-board";

struct Harness {
    store: Arc<MemoryStore>,
    publisher: Arc<RecordingPublisher>,
    modbus: Arc<MockState>,
    pool: ConnectionPool,
    timers: Arc<RelayTimers>,
    executor: ActionExecutor,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let publisher = Arc::new(RecordingPublisher::new());
    let modbus = MockState::new();
    let pool = ConnectionPool::new(
        Arc::new(MockConnector::new(Arc::clone(&modbus))),
        PoolConfig::default(),
    );
    let timers = Arc::new(RelayTimers::new());
    let executor = ActionExecutor::new(
        Arc::clone(&store) as Arc<dyn Store>,
        pool.clone(),
        Arc::clone(&timers),
        Arc::clone(&publisher) as Arc<dyn EventPublisher>,
    );

    store.upsert_device(relay_board());
    Harness {
        store,
        publisher,
        modbus,
        pool,
        timers,
        executor,
    }
}

fn coil(name: &str, address: u16) -> RegisterMapping {
    RegisterMapping::new(name, address, FunctionCode::ReadCoils, DataType::Boolean)
}

/// Three relay channels on coils 16..=18 plus a temperature register
fn relay_board() -> Device {
    Device::new(1, "relay board", BOARD, 502, 1).with_mappings(vec![
        coil("ch1", 16),
        RegisterMapping::new("temp", 0, FunctionCode::ReadInputRegisters, DataType::Int16),
        coil("ch2", 17),
        coil("ch3", 18),
    ])
}

fn automation(id: i64, actions: Vec<ActionConfig>) -> Automation {
    Automation::new(id, format!("automation {}", id), &TriggerConfig::Manual)
        .unwrap()
        .with_actions(actions)
}

fn control(channel: Option<u16>, state: RelayCommand) -> ControlAction {
    ControlAction {
        channel,
        ..ControlAction::channel(1, 1, state)
    }
}

#[tokio::test(start_paused = true)]
async fn all_channels_are_staggered_in_mapping_order() {
    let h = harness();
    let action = ControlAction {
        stagger_delay_seconds: 2,
        ..control(None, RelayCommand::On)
    };
    let auto = automation(1, vec![ActionConfig::Control(action)]);
    h.store.upsert_automation(auto.clone());

    let started = Instant::now();
    let run = h.executor.run(&auto, RunSource::Manual).await.unwrap();
    let elapsed = started.elapsed();

    // Two real delays, none before the first channel
    assert!(elapsed >= Duration::from_secs(4), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "elapsed {:?}", elapsed);

    assert_eq!(run.status, RunStatus::Success);
    let channels: Vec<(u16, u16)> = run.actions[0]
        .channels
        .iter()
        .map(|c| (c.channel, c.coil_address))
        .collect();
    assert_eq!(channels, vec![(1, 16), (2, 17), (3, 18)]);

    let written: Vec<u16> = h.modbus.calls().iter().map(|c| c.request.address()).collect();
    assert_eq!(written, vec![16, 17, 18]);
    for address in 16..=18 {
        assert!(h.modbus.coil(BOARD, 1, address));
    }

    let relays = h.store.device(1).unwrap().last_reading.relays;
    assert_eq!(relays.len(), 3);
    assert!(relays.values().all(|on| *on));
    assert_eq!(h.publisher.of_type("relay_state").len(), 3);
}

#[tokio::test(start_paused = true)]
async fn delayed_start_then_auto_off() {
    let h = harness();
    let action = ControlAction {
        delay_seconds: 5,
        duration_seconds: 10,
        ..control(Some(2), RelayCommand::On)
    };
    let auto = automation(2, vec![ActionConfig::Control(action)]);
    h.store.upsert_automation(auto.clone());

    let run = h.executor.run(&auto, RunSource::Manual).await.unwrap();
    assert_eq!(run.actions[0].status, ActionStatus::Scheduled);
    assert!(h.timers.is_pending(&TimerKey::new(TimerPurpose::Delay, 1, 2)));
    assert!(!h.modbus.coil(BOARD, 1, 17));

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(h.modbus.coil(BOARD, 1, 17));
    assert!(h.timers.is_pending(&TimerKey::new(TimerPurpose::Off, 1, 2)));
    assert_eq!(h.store.device(1).unwrap().last_reading.relays.get(&2), Some(&true));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!h.modbus.coil(BOARD, 1, 17));
    assert!(h.timers.is_empty());
    assert_eq!(h.store.device(1).unwrap().last_reading.relays.get(&2), Some(&false));

    let causes: Vec<RelayChangeCause> = h
        .publisher
        .of_type("relay_state")
        .into_iter()
        .filter_map(|e| match e.payload {
            EventPayload::RelayState { cause, .. } => Some(cause),
            _ => None,
        })
        .collect();
    assert_eq!(
        causes,
        vec![RelayChangeCause::DelayedStart, RelayChangeCause::AutoOff]
    );
}

#[tokio::test(start_paused = true)]
async fn explicit_off_cancels_pending_auto_off() {
    let h = harness();
    let on = ControlAction {
        duration_seconds: 60,
        ..control(Some(1), RelayCommand::On)
    };
    let off = control(Some(1), RelayCommand::Off);
    let auto_on = automation(3, vec![ActionConfig::Control(on)]);
    let auto_off = automation(4, vec![ActionConfig::Control(off)]);
    h.store.upsert_automation(auto_on.clone());
    h.store.upsert_automation(auto_off.clone());

    h.executor.run(&auto_on, RunSource::Manual).await.unwrap();
    assert!(h.timers.is_pending(&TimerKey::new(TimerPurpose::Off, 1, 1)));

    h.executor.run(&auto_off, RunSource::Manual).await.unwrap();
    assert!(h.timers.is_empty());
    assert!(!h.modbus.coil(BOARD, 1, 16));
}

#[tokio::test]
async fn toggle_flips_cached_state() {
    let h = harness();
    h.modbus.set_coil(BOARD, 1, 16, true);
    h.store.set_relay_state(1, 1, true).await.unwrap();

    let auto = automation(5, vec![ActionConfig::Control(control(Some(1), RelayCommand::Toggle))]);
    h.store.upsert_automation(auto.clone());
    let run = h.executor.run(&auto, RunSource::Manual).await.unwrap();

    assert!(!run.actions[0].channels[0].state);
    assert!(!h.modbus.coil(BOARD, 1, 16));
    assert_eq!(h.store.device(1).unwrap().last_reading.relays.get(&1), Some(&false));
}

#[tokio::test]
async fn register_control_writes_holding_register() {
    let h = harness();
    let action = ControlAction {
        register: Some(100),
        value: Some(42),
        ..control(None, RelayCommand::On)
    };
    let auto = automation(6, vec![ActionConfig::Control(action)]);
    h.store.upsert_automation(auto.clone());

    let run = h.executor.run(&auto, RunSource::Manual).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(h.modbus.register(BOARD, 1, 100), 42);
    assert!(h.publisher.of_type("relay_state").is_empty());
}

#[tokio::test]
async fn failing_action_does_not_stop_the_rest() {
    let h = harness();
    let logs = tempfile::tempdir().unwrap();
    let executor = ActionExecutor::new(
        Arc::clone(&h.store) as Arc<dyn Store>,
        h.pool.clone(),
        Arc::clone(&h.timers),
        Arc::clone(&h.publisher) as Arc<dyn EventPublisher>,
    )
    .with_run_logger(Arc::new(RunLoggerManager::new(logs.path().to_path_buf())));

    let auto = automation(
        7,
        vec![
            ActionConfig::Alert {
                severity: AlertSeverity::Warning,
                message: "tank low".to_string(),
            },
            ActionConfig::Control(ControlAction::channel(99, 1, RelayCommand::On)),
            ActionConfig::Log { message: None },
        ],
    );
    h.store.upsert_automation(auto.clone());

    let run = executor.run(&auto, RunSource::Threshold).await.unwrap();
    assert_eq!(run.status, RunStatus::Partial);
    let statuses: Vec<ActionStatus> = run.actions.iter().map(|a| a.status).collect();
    assert_eq!(
        statuses,
        vec![ActionStatus::Executed, ActionStatus::Failed, ActionStatus::Executed]
    );
    assert!(run.error.is_some());

    let alerts = h.store.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].automation_id, Some(7));
    assert_eq!(alerts[0].severity, AlertSeverity::Warning);

    let stored = h.store.automation(7).unwrap();
    assert_eq!(stored.run_count, 1);
    assert!(stored.last_run.is_some());
    assert_eq!(h.store.run_logs().len(), 1);

    let summary = h.publisher.of_type("automation_executed");
    assert_eq!(summary.len(), 1);
    match &summary[0].payload {
        EventPayload::AutomationExecuted {
            status,
            actions_executed,
            source,
            ..
        } => {
            assert_eq!(*status, RunStatus::Partial);
            assert_eq!(*actions_executed, 2);
            assert_eq!(*source, RunSource::Threshold);
        },
        other => panic!("unexpected payload {:?}", other),
    }

    let dir = logs.path().join("automations").join("7");
    assert_eq!(std::fs::read_dir(dir).unwrap().count(), 1);
}

#[tokio::test(start_paused = true)]
async fn unreachable_device_fails_run_but_records_it() {
    let h = harness();
    h.modbus.set_offline(BOARD, true);

    let auto = automation(8, vec![ActionConfig::Control(control(Some(1), RelayCommand::On))]);
    h.store.upsert_automation(auto.clone());

    let run = h.executor.run(&auto, RunSource::Manual).await.unwrap();
    assert_eq!(run.status, RunStatus::Failure);
    assert_eq!(run.actions[0].channels[0].status, ActionStatus::Failed);
    assert!(h.publisher.of_type("relay_state").is_empty());
    assert_eq!(h.store.automation(8).unwrap().run_count, 1);
}

#[tokio::test(start_paused = true)]
async fn write_only_device_is_fire_and_forget() {
    let h = harness();
    let mut board = relay_board();
    board.write_only = true;
    h.store.upsert_device(board);

    let auto = automation(9, vec![ActionConfig::Control(control(Some(3), RelayCommand::On))]);
    h.store.upsert_automation(auto.clone());
    let run = h.executor.run(&auto, RunSource::Manual).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);

    // The write lands once the connection worker drains its queue
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.modbus.coil(BOARD, 1, 18));
}

/// Delegates to a `MemoryStore` but rejects run bookkeeping writes
struct BookkeepingDownStore(MemoryStore);

fn bookkeeping_down() -> FieldError {
    FieldError::Database("database is locked".to_string())
}

#[async_trait]
impl DeviceStore for BookkeepingDownStore {
    async fn list_devices(&self) -> FieldResult<Vec<Device>> {
        self.0.list_devices().await
    }

    async fn get_device(&self, id: i64) -> FieldResult<Option<Device>> {
        self.0.get_device(id).await
    }

    async fn update_device_status(&self, id: i64, status: DeviceStatus) -> FieldResult<()> {
        self.0.update_device_status(id, status).await
    }

    async fn save_last_reading(&self, id: i64, reading: &LastReading) -> FieldResult<()> {
        self.0.save_last_reading(id, reading).await
    }

    async fn set_relay_state(&self, id: i64, channel: u16, on: bool) -> FieldResult<()> {
        self.0.set_relay_state(id, channel, on).await
    }

    async fn append_readings(
        &self,
        id: i64,
        readings: &[Reading],
        at: DateTime<Utc>,
    ) -> FieldResult<()> {
        self.0.append_readings(id, readings, at).await
    }

    async fn log_device_error(&self, record: &DeviceErrorRecord) -> FieldResult<()> {
        self.0.log_device_error(record).await
    }

    async fn prune_readings(&self, cutoff: DateTime<Utc>) -> FieldResult<u64> {
        self.0.prune_readings(cutoff).await
    }
}

#[async_trait]
impl AutomationStore for BookkeepingDownStore {
    async fn list_enabled_automations(&self) -> FieldResult<Vec<Automation>> {
        self.0.list_enabled_automations().await
    }

    async fn get_automation(&self, id: i64) -> FieldResult<Option<Automation>> {
        self.0.get_automation(id).await
    }

    async fn record_automation_run(&self, _id: i64, _at: DateTime<Utc>) -> FieldResult<()> {
        Err(bookkeeping_down())
    }

    async fn set_automation_enabled(&self, id: i64, enabled: bool) -> FieldResult<()> {
        self.0.set_automation_enabled(id, enabled).await
    }

    async fn insert_run_log(&self, _log: &AutomationRunLog) -> FieldResult<()> {
        Err(bookkeeping_down())
    }

    async fn insert_alert(&self, alert: &Alert) -> FieldResult<()> {
        self.0.insert_alert(alert).await
    }
}

#[tokio::test]
async fn bookkeeping_failure_still_returns_the_run() {
    let store = Arc::new(BookkeepingDownStore(MemoryStore::new()));
    store.0.upsert_device(relay_board());
    let publisher = Arc::new(RecordingPublisher::new());
    let modbus = MockState::new();
    let pool = ConnectionPool::new(
        Arc::new(MockConnector::new(Arc::clone(&modbus))),
        PoolConfig::default(),
    );
    let logs = tempfile::tempdir().unwrap();
    let executor = ActionExecutor::new(
        Arc::clone(&store) as Arc<dyn Store>,
        pool.clone(),
        Arc::new(RelayTimers::new()),
        Arc::clone(&publisher) as Arc<dyn EventPublisher>,
    )
    .with_run_logger(Arc::new(RunLoggerManager::new(logs.path().to_path_buf())));

    let auto = automation(9, vec![ActionConfig::Control(control(Some(1), RelayCommand::On))]);
    store.0.upsert_automation(auto.clone());

    let run = executor.run(&auto, RunSource::Manual).await.unwrap();

    assert_eq!(run.status, RunStatus::Success);
    assert!(modbus.coil(BOARD, 1, 16));
    assert!(store.0.run_logs().is_empty());
    assert_eq!(store.0.automation(9).unwrap().run_count, 0);
    assert_eq!(publisher.of_type("automation_executed").len(), 1);

    let log_file = std::fs::read_dir(logs.path().join("automations").join("9"))
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let contents = std::fs::read_to_string(log_file).unwrap();
    assert!(contents.contains("manual | success"), "{}", contents);

    pool.shutdown_all().await;
}
