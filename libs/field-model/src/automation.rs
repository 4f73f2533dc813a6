//! Automations: triggers, actions and run records

use std::fmt;

use chrono::{DateTime, NaiveTime, Utc};
use errors::{FieldError, FieldResult};
use serde::{Deserialize, Serialize};

/// Automation as consumed by the scheduler.
///
/// `trigger` is kept as raw JSON and parsed on every evaluation so that one
/// malformed record does not stop the others from loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Automation {
    pub id: i64,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    pub trigger: serde_json::Value,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl Automation {
    pub fn new(id: i64, name: impl Into<String>, trigger: &TriggerConfig) -> FieldResult<Self> {
        trigger.validate()?;
        Ok(Self {
            id,
            name: name.into(),
            enabled: true,
            priority: 0,
            trigger: serde_json::to_value(trigger)?,
            actions: Vec::new(),
            run_count: 0,
            last_run: None,
        })
    }

    pub fn with_actions(mut self, actions: Vec<ActionConfig>) -> Self {
        self.actions = actions;
        self
    }

    /// Parse and range-check the stored trigger
    pub fn parse_trigger(&self) -> FieldResult<TriggerConfig> {
        let trigger: TriggerConfig = serde_json::from_value(self.trigger.clone())?;
        trigger.validate()?;
        Ok(trigger)
    }
}

// ============================================================================
// Triggers
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    Schedule(ScheduleTrigger),
    Threshold(ThresholdTrigger),
    Manual,
    Event {
        #[serde(default)]
        name: Option<String>,
    },
}

impl TriggerConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Schedule(_) => "schedule",
            Self::Threshold(_) => "threshold",
            Self::Manual => "manual",
            Self::Event { .. } => "event",
        }
    }

    pub fn validate(&self) -> FieldResult<()> {
        match self {
            Self::Schedule(schedule) => schedule.validate(),
            _ => Ok(()),
        }
    }
}

/// Time-based trigger; times are local wall-clock `HH:MM`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frequency", rename_all = "snake_case")]
pub enum ScheduleTrigger {
    Once {
        run_at: DateTime<Utc>,
    },
    Daily {
        #[serde(with = "hhmm")]
        time: NaiveTime,
    },
    Weekly {
        #[serde(with = "hhmm")]
        time: NaiveTime,
        /// 0 = Sunday .. 6 = Saturday
        days: Vec<u8>,
    },
    Hourly {
        minute: u8,
    },
    Custom {
        cron: String,
    },
}

impl ScheduleTrigger {
    /// Range checks serde cannot express. Cron expressions are checked
    /// by the scheduler when they are compiled.
    pub fn validate(&self) -> FieldResult<()> {
        match self {
            Self::Hourly { minute } if *minute > 59 => {
                Err(FieldError::out_of_range("minute", minute, 0, 59))
            },
            Self::Weekly { days, .. } => {
                if days.is_empty() {
                    return Err(FieldError::InvalidConfig {
                        field: "days".to_string(),
                        reason: "weekly schedule needs at least one day".to_string(),
                    });
                }
                // 7 is Sunday again, as in cron
                match days.iter().find(|d| **d > 7) {
                    Some(day) => Err(FieldError::out_of_range("days", day, 0, 7)),
                    None => Ok(()),
                }
            },
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdTrigger {
    pub device_id: i64,
    /// Register mapping name in the device's last reading
    pub sensor: String,
    pub operator: CompareOp,
    #[serde(alias = "value")]
    pub threshold_value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Neq,
}

impl CompareOp {
    pub fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Gt => lhs > rhs,
            Self::Gte => lhs >= rhs,
            Self::Lt => lhs < rhs,
            Self::Lte => lhs <= rhs,
            Self::Eq => (lhs - rhs).abs() < f64::EPSILON,
            Self::Neq => (lhs - rhs).abs() >= f64::EPSILON,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Eq => "==",
            Self::Neq => "!=",
        }
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(|e| serde::de::Error::custom(format!("invalid time '{}': {}", raw, e)))
    }
}

// ============================================================================
// Actions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionConfig {
    Alert {
        #[serde(default)]
        severity: AlertSeverity,
        message: String,
    },
    Log {
        #[serde(default)]
        message: Option<String>,
    },
    Control(ControlAction),
}

impl ActionConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Alert { .. } => "alert",
            Self::Log { .. } => "log",
            Self::Control(_) => "control",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlAction {
    pub device_id: i64,
    /// 1-based relay channel; `None` means every relay channel of the device
    #[serde(default)]
    pub channel: Option<u16>,
    #[serde(default)]
    pub state: RelayCommand,
    /// Holding register target written with FC6 instead of a coil
    #[serde(default)]
    pub register: Option<u16>,
    #[serde(default)]
    pub value: Option<u16>,
    #[serde(default)]
    pub delay_seconds: u64,
    #[serde(default)]
    pub duration_seconds: u64,
    #[serde(default)]
    pub stagger_delay_seconds: u64,
}

impl ControlAction {
    pub fn channel(device_id: i64, channel: u16, state: RelayCommand) -> Self {
        Self {
            device_id,
            channel: Some(channel),
            state,
            register: None,
            value: None,
            delay_seconds: 0,
            duration_seconds: 0,
            stagger_delay_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayCommand {
    #[default]
    On,
    Off,
    Toggle,
}

impl RelayCommand {
    /// Coil state to write given the cached one
    pub fn resolve(self, current: Option<bool>) -> bool {
        match self {
            Self::On => true,
            Self::Off => false,
            Self::Toggle => !current.unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    #[default]
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

// ============================================================================
// Run records
// ============================================================================

/// What caused an automation to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSource {
    Schedule,
    Threshold,
    Manual,
    Event,
}

impl RunSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Threshold => "threshold",
            Self::Manual => "manual",
            Self::Event => "event",
        }
    }
}

impl fmt::Display for RunSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
    Failure,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Executed,
    Scheduled,
    Failed,
}

/// Outcome of one relay channel inside a control action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelOutcome {
    pub channel: u16,
    pub coil_address: u16,
    pub state: bool,
    pub status: ActionStatus,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub index: usize,
    pub action_type: String,
    pub status: ActionStatus,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub channels: Vec<ChannelOutcome>,
}

impl ActionOutcome {
    pub fn is_ok(&self) -> bool {
        self.status != ActionStatus::Failed
    }
}

/// Persisted record of one automation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRunLog {
    pub automation_id: i64,
    pub source: RunSource,
    pub status: RunStatus,
    pub actions: Vec<ActionOutcome>,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub automation_id: Option<i64>,
    pub severity: AlertSeverity,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
