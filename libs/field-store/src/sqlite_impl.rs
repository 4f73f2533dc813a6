//! SQLite store
//!
//! Runtime sqlx queries over the minimal schema the core reads and writes.
//! Record management (CRUD for equipment and automations) lives elsewhere;
//! `upsert_device` / `upsert_automation` exist for seeding.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use errors::{FieldError, FieldResult};
use field_model::{
    ActionConfig, Alert, Automation, AutomationRunLog, Device, DeviceStatus, LastReading,
    Reading, RegisterMapping,
};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::{debug, warn};

use crate::traits::{AutomationStore, DeviceErrorRecord, DeviceStore};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS equipment (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        host TEXT NOT NULL,
        port INTEGER NOT NULL DEFAULT 502,
        unit_id INTEGER NOT NULL DEFAULT 1,
        enabled INTEGER NOT NULL DEFAULT 1,
        poll_interval_ms INTEGER NOT NULL DEFAULT 1000,
        write_only INTEGER NOT NULL DEFAULT 0,
        scale REAL NOT NULL DEFAULT 1.0,
        "offset" REAL NOT NULL DEFAULT 0.0,
        status TEXT NOT NULL DEFAULT 'offline',
        last_reading TEXT,
        updated_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS register_mappings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        equipment_id INTEGER NOT NULL REFERENCES equipment(id) ON DELETE CASCADE,
        position INTEGER NOT NULL DEFAULT 0,
        mapping_json TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS equipment_readings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        equipment_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        value REAL NOT NULL,
        unit TEXT,
        recorded_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_readings_recorded ON equipment_readings(recorded_at)",
    r#"
    CREATE TABLE IF NOT EXISTS equipment_errors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        equipment_id INTEGER NOT NULL,
        error_code TEXT NOT NULL,
        message TEXT NOT NULL,
        consecutive_errors INTEGER NOT NULL,
        occurred_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS automations (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        priority INTEGER NOT NULL DEFAULT 0,
        trigger_config TEXT NOT NULL,
        actions TEXT NOT NULL DEFAULT '[]',
        run_count INTEGER NOT NULL DEFAULT 0,
        last_run TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS automation_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        automation_id INTEGER NOT NULL,
        source TEXT NOT NULL,
        status TEXT NOT NULL,
        actions TEXT NOT NULL,
        error TEXT,
        started_at TEXT NOT NULL,
        duration_ms INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alerts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        automation_id INTEGER,
        severity TEXT NOT NULL,
        message TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
];

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open `url` (e.g. `sqlite://data/fieldsrv.db?mode=rwc`) and create tables
    pub async fn connect(url: &str) -> FieldResult<Self> {
        let pool = SqlitePool::connect(url).await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> FieldResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("SQLite schema ready");
        Ok(())
    }

    pub async fn upsert_device(&self, device: &Device) -> FieldResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO equipment (id, name, host, port, unit_id, enabled, poll_interval_ms,
                                   write_only, scale, "offset", status, last_reading)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, host = excluded.host, port = excluded.port,
                unit_id = excluded.unit_id, enabled = excluded.enabled,
                poll_interval_ms = excluded.poll_interval_ms, write_only = excluded.write_only,
                scale = excluded.scale, "offset" = excluded."offset"
            "#,
        )
        .bind(device.id)
        .bind(&device.name)
        .bind(&device.host)
        .bind(i64::from(device.port))
        .bind(i64::from(device.unit_id))
        .bind(device.enabled)
        .bind(device.poll_interval_ms as i64)
        .bind(device.write_only)
        .bind(device.scale)
        .bind(device.offset)
        .bind(device.status.as_str())
        .bind(serde_json::to_string(&device.last_reading)?)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM register_mappings WHERE equipment_id = ?")
            .bind(device.id)
            .execute(&mut *tx)
            .await?;

        for (position, mapping) in device.mappings.iter().enumerate() {
            sqlx::query(
                "INSERT INTO register_mappings (equipment_id, position, mapping_json) VALUES (?, ?, ?)",
            )
            .bind(device.id)
            .bind(position as i64)
            .bind(serde_json::to_string(mapping)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_automation(&self, automation: &Automation) -> FieldResult<()> {
        sqlx::query(
            r#"
            INSERT INTO automations (id, name, enabled, priority, trigger_config, actions,
                                     run_count, last_run)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, enabled = excluded.enabled, priority = excluded.priority,
                trigger_config = excluded.trigger_config, actions = excluded.actions
            "#,
        )
        .bind(automation.id)
        .bind(&automation.name)
        .bind(automation.enabled)
        .bind(i64::from(automation.priority))
        .bind(automation.trigger.to_string())
        .bind(serde_json::to_string(&automation.actions)?)
        .bind(automation.run_count as i64)
        .bind(automation.last_run)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Error log entries for one device, oldest first
    pub async fn device_errors(&self, device_id: i64) -> FieldResult<Vec<DeviceErrorRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT equipment_id, error_code, message, consecutive_errors, occurred_at
            FROM equipment_errors WHERE equipment_id = ? ORDER BY id ASC
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> FieldResult<DeviceErrorRecord> {
                Ok(DeviceErrorRecord {
                    device_id: row.try_get("equipment_id")?,
                    error_code: row.try_get("error_code")?,
                    message: row.try_get("message")?,
                    consecutive_errors: narrow(
                        row.try_get("consecutive_errors")?,
                        "consecutive_errors",
                    )?,
                    occurred_at: row.try_get("occurred_at")?,
                })
            })
            .collect()
    }

    pub async fn reading_count(&self, device_id: i64) -> FieldResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM equipment_readings WHERE equipment_id = ?")
                .bind(device_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn mappings_for(&self, device_id: i64) -> FieldResult<Vec<RegisterMapping>> {
        let rows = sqlx::query(
            "SELECT mapping_json FROM register_mappings WHERE equipment_id = ? ORDER BY position ASC, id ASC",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        let mut mappings = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.try_get("mapping_json")?;
            match serde_json::from_str::<RegisterMapping>(&raw) {
                Ok(mapping) => mappings.push(mapping),
                Err(e) => warn!("Device {} mapping skipped: {}", device_id, e),
            }
        }
        Ok(mappings)
    }

    async fn hydrate_device(&self, row: &SqliteRow) -> FieldResult<Device> {
        let id: i64 = row.try_get("id")?;
        let status: String = row.try_get("status")?;
        let last_reading: Option<String> = row.try_get("last_reading")?;
        let last_reading = last_reading
            .as_deref()
            .map(serde_json::from_str::<LastReading>)
            .transpose()?
            .unwrap_or_default();

        Ok(Device {
            id,
            name: row.try_get("name")?,
            host: row.try_get("host")?,
            port: narrow(row.try_get("port")?, "port")?,
            unit_id: narrow(row.try_get("unit_id")?, "unit_id")?,
            enabled: row.try_get("enabled")?,
            poll_interval_ms: narrow(row.try_get("poll_interval_ms")?, "poll_interval_ms")?,
            write_only: row.try_get("write_only")?,
            scale: row.try_get("scale")?,
            offset: row.try_get("offset")?,
            mappings: self.mappings_for(id).await?,
            last_reading,
            status: status.parse().unwrap_or_default(),
        })
    }

    /// Merge a relay patch into the stored snapshot in one UPDATE.
    /// `values` and `updated_at` are replaced only when given.
    async fn merge_last_reading(
        &self,
        id: i64,
        relays: &BTreeMap<u16, bool>,
        replace: Option<&LastReading>,
    ) -> FieldResult<()> {
        let relay_patch = serde_json::to_string(relays)?;
        let result = match replace {
            Some(reading) => {
                sqlx::query(
                    r#"
                    UPDATE equipment
                    SET last_reading = json_set(
                            json_patch(COALESCE(last_reading, '{}'), json_object('relays', json(?))),
                            '$.values', json(?),
                            '$.updated_at', json(?)
                        ),
                        updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(relay_patch)
                .bind(serde_json::to_string(&reading.values)?)
                .bind(serde_json::to_string(&reading.updated_at)?)
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await?
            },
            None => {
                sqlx::query(
                    r#"
                    UPDATE equipment
                    SET last_reading = json_patch(COALESCE(last_reading, '{}'), json_object('relays', json(?))),
                        updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(relay_patch)
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await?
            },
        };
        if result.rows_affected() == 0 {
            return Err(FieldError::not_found(format!("device {}", id)));
        }
        Ok(())
    }
}

fn narrow<T: TryFrom<i64>>(value: i64, column: &str) -> FieldResult<T> {
    T::try_from(value)
        .map_err(|_| FieldError::Database(format!("column {} out of range: {}", column, value)))
}

fn hydrate_automation(row: &SqliteRow) -> FieldResult<Automation> {
    let id: i64 = row.try_get("id")?;
    let trigger_raw: String = row.try_get("trigger_config")?;
    let actions_raw: String = row.try_get("actions")?;

    // Unparsable triggers surface when the scheduler evaluates them
    let trigger = serde_json::from_str(&trigger_raw).unwrap_or(serde_json::Value::Null);
    let actions: Vec<ActionConfig> = serde_json::from_str(&actions_raw)?;

    Ok(Automation {
        id,
        name: row.try_get("name")?,
        enabled: row.try_get("enabled")?,
        priority: narrow(row.try_get("priority")?, "priority")?,
        trigger,
        actions,
        run_count: narrow(row.try_get("run_count")?, "run_count")?,
        last_run: row.try_get("last_run")?,
    })
}

#[async_trait]
impl DeviceStore for SqliteStore {
    async fn list_devices(&self) -> FieldResult<Vec<Device>> {
        let rows = sqlx::query("SELECT * FROM equipment ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut devices = Vec::with_capacity(rows.len());
        for row in &rows {
            devices.push(self.hydrate_device(row).await?);
        }
        Ok(devices)
    }

    async fn get_device(&self, id: i64) -> FieldResult<Option<Device>> {
        let row = sqlx::query("SELECT * FROM equipment WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate_device(&row).await?)),
            None => Ok(None),
        }
    }

    async fn update_device_status(&self, id: i64, status: DeviceStatus) -> FieldResult<()> {
        let result = sqlx::query("UPDATE equipment SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(FieldError::not_found(format!("device {}", id)));
        }
        Ok(())
    }

    async fn save_last_reading(&self, id: i64, reading: &LastReading) -> FieldResult<()> {
        self.merge_last_reading(id, &reading.relays, Some(reading)).await
    }

    async fn set_relay_state(&self, id: i64, channel: u16, on: bool) -> FieldResult<()> {
        let patch = BTreeMap::from([(channel, on)]);
        self.merge_last_reading(id, &patch, None).await
    }

    async fn append_readings(
        &self,
        id: i64,
        readings: &[Reading],
        at: DateTime<Utc>,
    ) -> FieldResult<()> {
        let mut tx = self.pool.begin().await?;
        for reading in readings {
            sqlx::query(
                "INSERT INTO equipment_readings (equipment_id, name, value, unit, recorded_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&reading.name)
            .bind(reading.value.as_f64())
            .bind(reading.unit.as_deref())
            .bind(at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn log_device_error(&self, record: &DeviceErrorRecord) -> FieldResult<()> {
        sqlx::query(
            r#"
            INSERT INTO equipment_errors (equipment_id, error_code, message, consecutive_errors, occurred_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.device_id)
        .bind(&record.error_code)
        .bind(&record.message)
        .bind(i64::from(record.consecutive_errors))
        .bind(record.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prune_readings(&self, cutoff: DateTime<Utc>) -> FieldResult<u64> {
        let result = sqlx::query("DELETE FROM equipment_readings WHERE recorded_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AutomationStore for SqliteStore {
    async fn list_enabled_automations(&self) -> FieldResult<Vec<Automation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, enabled, priority, trigger_config, actions, run_count, last_run
            FROM automations
            WHERE enabled = 1
            ORDER BY priority DESC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut automations = Vec::with_capacity(rows.len());
        for row in &rows {
            match hydrate_automation(row) {
                Ok(a) => automations.push(a),
                Err(e) => warn!("Automation row skipped: {}", e),
            }
        }
        Ok(automations)
    }

    async fn get_automation(&self, id: i64) -> FieldResult<Option<Automation>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, enabled, priority, trigger_config, actions, run_count, last_run
            FROM automations WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(hydrate_automation).transpose()
    }

    async fn record_automation_run(&self, id: i64, at: DateTime<Utc>) -> FieldResult<()> {
        let result = sqlx::query(
            "UPDATE automations SET run_count = run_count + 1, last_run = ? WHERE id = ?",
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(FieldError::not_found(format!("automation {}", id)));
        }
        Ok(())
    }

    async fn set_automation_enabled(&self, id: i64, enabled: bool) -> FieldResult<()> {
        sqlx::query("UPDATE automations SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_run_log(&self, log: &AutomationRunLog) -> FieldResult<()> {
        sqlx::query(
            r#"
            INSERT INTO automation_logs (automation_id, source, status, actions, error, started_at, duration_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(log.automation_id)
        .bind(log.source.as_str())
        .bind(log.status.as_str())
        .bind(serde_json::to_string(&log.actions)?)
        .bind(log.error.as_deref())
        .bind(log.started_at)
        .bind(log.duration_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_alert(&self, alert: &Alert) -> FieldResult<()> {
        sqlx::query(
            "INSERT INTO alerts (automation_id, severity, message, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(alert.automation_id)
        .bind(alert.severity.as_str())
        .bind(&alert.message)
        .bind(alert.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
