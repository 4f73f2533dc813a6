//! Integration tests for the SQLite store using in-memory SQLite

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use chrono::{Duration, Utc};
use field_model::{
    ActionConfig, ActionOutcome, ActionStatus, Alert, AlertSeverity, Automation,
    AutomationRunLog, DataType, Device, DeviceStatus, FunctionCode, LastReading, Reading,
    ReadingValue, RegisterMapping, RunSource, RunStatus, TriggerConfig,
};
use field_store::{AutomationStore, DeviceErrorRecord, DeviceStore, SqliteStore};
use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tempfile::TempDir;

async fn setup_store() -> SqliteStore {
    // One connection: every new in-memory connection is a fresh database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    let store = SqliteStore::new(pool);
    store.migrate().await.expect("Failed to create tables");
    store
}

fn sample_device() -> Device {
    let mut temp = RegisterMapping::new("Temp", 0, FunctionCode::ReadInputRegisters, DataType::Int16);
    temp.scale = Some(0.1);
    temp.unit = Some("C".to_string());
    Device::new(1, "boiler", "10.0.0.5", 502, 1).with_mappings(vec![
        temp,
        RegisterMapping::new("relay1", 16, FunctionCode::ReadCoils, DataType::Boolean),
    ])
}

#[tokio::test]
async fn test_device_round_trip_preserves_mapping_order() {
    let store = setup_store().await;
    store.upsert_device(&sample_device()).await.unwrap();

    let devices = store.list_devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    let device = &devices[0];
    assert_eq!(device.endpoint(), "10.0.0.5:502");
    assert_eq!(device.mappings.len(), 2);
    assert_eq!(device.mappings[0].name, "Temp");
    assert_eq!(device.mappings[0].scale, Some(0.1));
    assert_eq!(device.mappings[1].function_code, FunctionCode::ReadCoils);
    assert_eq!(device.status, DeviceStatus::Offline);

    assert!(store.get_device(99).await.unwrap().is_none());
}

#[tokio::test]
async fn test_status_reading_and_relays() {
    let store = setup_store().await;
    store.upsert_device(&sample_device()).await.unwrap();

    store.update_device_status(1, DeviceStatus::Online).await.unwrap();
    store.set_relay_state(1, 1, true).await.unwrap();

    let readings = vec![Reading {
        name: "Temp".to_string(),
        value: ReadingValue::Number(21.7),
        unit: Some("C".to_string()),
    }];
    let snapshot = LastReading::from_readings(&readings, Default::default());
    store.save_last_reading(1, &snapshot).await.unwrap();
    store.append_readings(1, &readings, Utc::now()).await.unwrap();

    let device = store.get_device(1).await.unwrap().unwrap();
    assert_eq!(device.status, DeviceStatus::Online);
    assert_eq!(device.last_reading.value_of("Temp"), Some(21.7));
    assert_eq!(device.last_reading.relays.get(&1), Some(&true));
    assert_eq!(store.reading_count(1).await.unwrap(), 1);

    assert!(store
        .update_device_status(404, DeviceStatus::Online)
        .await
        .is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_relay_and_reading_writers_keep_every_channel() {
    let dir = TempDir::new().unwrap();
    let options = SqliteConnectOptions::new()
        .filename(dir.path().join("field.db"))
        .create_if_missing(true)
        .busy_timeout(std::time::Duration::from_secs(10));
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .unwrap();
    let store = SqliteStore::new(pool);
    store.migrate().await.unwrap();
    store.upsert_device(&sample_device()).await.unwrap();

    let mut tasks = Vec::new();
    for channel in 1..=16u16 {
        let relays = store.clone();
        tasks.push(tokio::spawn(async move {
            relays.set_relay_state(1, channel, true).await.unwrap();
        }));
        let poller = store.clone();
        tasks.push(tokio::spawn(async move {
            let readings = vec![Reading {
                name: "Temp".to_string(),
                value: ReadingValue::Number(f64::from(channel)),
                unit: None,
            }];
            let snapshot = LastReading::from_readings(&readings, Default::default());
            poller.save_last_reading(1, &snapshot).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let device = store.get_device(1).await.unwrap().unwrap();
    assert_eq!(device.last_reading.relays.len(), 16);
    assert!(device.last_reading.relays.values().all(|on| *on));
    assert!(device.last_reading.value_of("Temp").is_some());
    assert!(store.set_relay_state(404, 1, true).await.is_err());
}

#[tokio::test]
async fn test_error_log_and_prune() {
    let store = setup_store().await;
    store.upsert_device(&sample_device()).await.unwrap();

    for n in 1..=3 {
        store
            .log_device_error(&DeviceErrorRecord {
                device_id: 1,
                error_code: "TIMEOUT".to_string(),
                message: "no response".to_string(),
                consecutive_errors: n,
                occurred_at: Utc::now(),
            })
            .await
            .unwrap();
    }
    let errors = store.device_errors(1).await.unwrap();
    assert_eq!(errors.len(), 3);
    assert_eq!(errors[2].consecutive_errors, 3);

    let reading = Reading {
        name: "Temp".to_string(),
        value: ReadingValue::Number(1.0),
        unit: None,
    };
    let now = Utc::now();
    store
        .append_readings(1, &[reading.clone()], now - Duration::days(31))
        .await
        .unwrap();
    store.append_readings(1, &[reading], now).await.unwrap();
    let removed = store.prune_readings(now - Duration::days(30)).await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(store.reading_count(1).await.unwrap(), 1);
}

#[tokio::test]
async fn test_automation_bookkeeping() {
    let store = setup_store().await;
    let automation = Automation::new(
        5,
        "morning lights",
        &serde_json::from_value::<TriggerConfig>(
            json!({"type": "schedule", "frequency": "daily", "time": "08:00"}),
        )
        .unwrap(),
    )
    .unwrap()
    .with_actions(vec![ActionConfig::Log {
        message: Some("lights on".to_string()),
    }]);
    store.upsert_automation(&automation).await.unwrap();

    let enabled = store.list_enabled_automations().await.unwrap();
    assert_eq!(enabled.len(), 1);
    assert_eq!(enabled[0].parse_trigger().unwrap().kind(), "schedule");
    assert_eq!(enabled[0].actions.len(), 1);

    let at = Utc::now();
    store.record_automation_run(5, at).await.unwrap();
    store.record_automation_run(5, at).await.unwrap();
    let loaded = store.get_automation(5).await.unwrap().unwrap();
    assert_eq!(loaded.run_count, 2);
    assert!(loaded.last_run.is_some());

    store.set_automation_enabled(5, false).await.unwrap();
    assert!(store.list_enabled_automations().await.unwrap().is_empty());

    store
        .insert_run_log(&AutomationRunLog {
            automation_id: 5,
            source: RunSource::Schedule,
            status: RunStatus::Success,
            actions: vec![ActionOutcome {
                index: 0,
                action_type: "log".to_string(),
                status: ActionStatus::Executed,
                detail: None,
                channels: Vec::new(),
            }],
            error: None,
            started_at: at,
            duration_ms: 3,
        })
        .await
        .unwrap();
    store
        .insert_alert(&Alert {
            automation_id: Some(5),
            severity: AlertSeverity::Warning,
            message: "check boiler".to_string(),
            created_at: at,
        })
        .await
        .unwrap();

    let logs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM automation_logs")
        .fetch_one(store.pool())
        .await
        .unwrap();
    let alerts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alerts")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!((logs, alerts), (1, 1));
}
