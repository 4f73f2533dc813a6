//! Service configuration
//!
//! Loaded in layers: built-in defaults, then `config/fieldsrv.yaml` (or
//! `--config`), then `FIELDSRV_*` environment variables with `__` between
//! nested keys, e.g. `FIELDSRV_POLLING__BACKOFF_CAP_MS=120000`.

use std::path::Path;
use std::time::Duration;

use errors::{FieldError, FieldResult};
use field_model::{MAX_POLL_INTERVAL_MS, MIN_POLL_INTERVAL_MS};
use field_modbus::constants::{MAX_UNIT_ID, MIN_UNIT_ID};
use field_modbus::{BackoffPolicy, PoolConfig, RequestOptions};
use field_rules::TriggerEvaluator;
use serde::{Deserialize, Serialize};

use crate::core::polling::PollingConfig;

pub const CONFIG_ENV_PREFIX: &str = "FIELDSRV_";
pub const DEFAULT_CONFIG_PATH: &str = "config/fieldsrv.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub modbus: ModbusConfig,
    pub polling: PollingSettings,
    pub automation: AutomationConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/fieldsrv.db?mode=rwc".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log root; `FIELDSRV_LOG_DIR` takes precedence
    pub dir: Option<String>,
    pub level: String,
    pub json: bool,
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            level: "info".to_string(),
            json: false,
            max_files: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    pub timeout_ms: u64,
    pub retries: u32,
    pub max_connections: usize,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    /// 0 = never give up
    pub max_reconnect_attempts: u32,
    pub min_unit_id: u8,
    pub max_unit_id: u8,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            retries: 3,
            max_connections: 50,
            idle_timeout_secs: 300,
            sweep_interval_secs: 60,
            connect_timeout_ms: 3000,
            reconnect_base_ms: 1000,
            reconnect_cap_ms: 30_000,
            max_reconnect_attempts: 5,
            min_unit_id: MIN_UNIT_ID,
            max_unit_id: MAX_UNIT_ID,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    /// Used for devices stored without an interval (0)
    pub default_interval_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub refresh_interval_secs: u64,
    /// Holding register read by the connectivity probe
    pub probe_address: u16,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            default_interval_ms: 1000,
            backoff_base_ms: 1000,
            backoff_cap_ms: 60_000,
            refresh_interval_secs: 30,
            probe_address: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub enabled: bool,
    pub tick_secs: u64,
    pub schedule_dedup_secs: u64,
    pub threshold_cooldown_secs: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_secs: 30,
            schedule_dedup_secs: 55,
            threshold_cooldown_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub retention_days: u32,
    pub cleanup_interval_secs: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            cleanup_interval_secs: 3600,
        }
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> FieldError {
    FieldError::InvalidConfig {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn require_positive(field: &str, value: u64) -> FieldResult<()> {
    if value == 0 {
        return Err(invalid(field, "must be greater than 0"));
    }
    Ok(())
}

impl ServiceConfig {
    /// Defaults, then `file` when it exists, then `FIELDSRV_*` variables
    pub fn load(file: Option<&Path>) -> FieldResult<Self> {
        common::config_loader::load_config(file, CONFIG_ENV_PREFIX)
    }

    pub fn validate(&self) -> FieldResult<()> {
        if self.database.url.trim().is_empty() {
            return Err(invalid("database.url", "must not be empty"));
        }

        let m = &self.modbus;
        require_positive("modbus.timeout_ms", m.timeout_ms)?;
        require_positive("modbus.max_connections", m.max_connections as u64)?;
        require_positive("modbus.idle_timeout_secs", m.idle_timeout_secs)?;
        require_positive("modbus.sweep_interval_secs", m.sweep_interval_secs)?;
        require_positive("modbus.connect_timeout_ms", m.connect_timeout_ms)?;
        require_positive("modbus.reconnect_base_ms", m.reconnect_base_ms)?;
        if m.reconnect_cap_ms < m.reconnect_base_ms {
            return Err(invalid(
                "modbus.reconnect_cap_ms",
                "must not be below modbus.reconnect_base_ms",
            ));
        }
        if m.min_unit_id < MIN_UNIT_ID || m.min_unit_id > m.max_unit_id {
            return Err(FieldError::out_of_range(
                "modbus.min_unit_id",
                m.min_unit_id,
                MIN_UNIT_ID,
                m.max_unit_id,
            ));
        }
        if m.max_unit_id > MAX_UNIT_ID {
            return Err(FieldError::out_of_range(
                "modbus.max_unit_id",
                m.max_unit_id,
                m.min_unit_id,
                MAX_UNIT_ID,
            ));
        }

        let p = &self.polling;
        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&p.default_interval_ms) {
            return Err(FieldError::out_of_range(
                "polling.default_interval_ms",
                p.default_interval_ms,
                MIN_POLL_INTERVAL_MS,
                MAX_POLL_INTERVAL_MS,
            ));
        }
        require_positive("polling.backoff_base_ms", p.backoff_base_ms)?;
        if p.backoff_cap_ms < p.backoff_base_ms {
            return Err(invalid(
                "polling.backoff_cap_ms",
                "must not be below polling.backoff_base_ms",
            ));
        }
        require_positive("polling.refresh_interval_secs", p.refresh_interval_secs)?;

        require_positive("automation.tick_secs", self.automation.tick_secs)?;
        require_positive("history.retention_days", u64::from(self.history.retention_days))?;
        require_positive("history.cleanup_interval_secs", self.history.cleanup_interval_secs)?;
        Ok(())
    }

    pub fn request_options(&self) -> RequestOptions {
        RequestOptions {
            timeout: Duration::from_millis(self.modbus.timeout_ms),
            retries: self.modbus.retries,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        let m = &self.modbus;
        PoolConfig {
            max_connections: m.max_connections,
            idle_timeout: Duration::from_secs(m.idle_timeout_secs),
            sweep_interval: Duration::from_secs(m.sweep_interval_secs),
            connect_timeout: Duration::from_millis(m.connect_timeout_ms),
            reconnect: BackoffPolicy::from_millis(m.reconnect_base_ms, m.reconnect_cap_ms),
            max_reconnect_attempts: m.max_reconnect_attempts,
            min_unit_id: m.min_unit_id,
            max_unit_id: m.max_unit_id,
            defaults: self.request_options(),
        }
    }

    pub fn polling_config(&self) -> PollingConfig {
        let p = &self.polling;
        PollingConfig {
            default_interval_ms: p.default_interval_ms,
            backoff: BackoffPolicy::from_millis(p.backoff_base_ms, p.backoff_cap_ms),
            refresh_interval: Duration::from_secs(p.refresh_interval_secs),
            probe_address: p.probe_address,
            request: self.request_options(),
        }
    }

    pub fn evaluator(&self) -> TriggerEvaluator {
        TriggerEvaluator::new(
            self.automation.schedule_dedup_secs as i64,
            self.automation.threshold_cooldown_secs as i64,
        )
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.automation.tick_secs)
    }

    pub fn history_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.history.retention_days))
    }

    pub fn history_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.history.cleanup_interval_secs)
    }
}
