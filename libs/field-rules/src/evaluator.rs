//! Trigger evaluation
//!
//! Whether an automation is due is a pure function of its trigger, the
//! current time, its `last_run` and (for thresholds) the device's last
//! reading. Nothing here sleeps or touches the network.

use chrono::{DateTime, Datelike, Local, NaiveDateTime, Timelike, Utc};
use errors::FieldResult;
use field_model::{Automation, LastReading, RunSource, ScheduleTrigger, ThresholdTrigger, TriggerConfig};
use field_store::DeviceStore;
use tracing::{debug, warn};

use crate::cron::CronSchedule;

/// Default window in which a schedule trigger will not fire again
pub const SCHEDULE_DEDUP_SECS: i64 = 55;

/// Default cooldown after a threshold trigger fired
pub const THRESHOLD_COOLDOWN_SECS: i64 = 60;

/// Instant being evaluated, in UTC and as local wall-clock time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalTime {
    pub now: DateTime<Utc>,
    pub local: NaiveDateTime,
}

impl EvalTime {
    /// Wall-clock time in the host's local timezone
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            local: now.with_timezone(&Local).naive_local(),
        }
    }

    /// Explicit wall-clock time, used when the zone is fixed
    pub fn with_local(now: DateTime<Utc>, local: NaiveDateTime) -> Self {
        Self { now, local }
    }
}

/// `true` when `last_run` lies less than `cooldown` before `now`
pub fn within_cooldown(
    now: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
    cooldown: chrono::Duration,
) -> bool {
    match last_run {
        Some(last) => now.signed_duration_since(last) < cooldown,
        None => false,
    }
}

/// Whether the wall-clock time matches the schedule. `once` is handled
/// by [`TriggerEvaluator::schedule_due`] since it depends on `last_run`.
pub fn schedule_matches(schedule: &ScheduleTrigger, at: &EvalTime) -> FieldResult<bool> {
    let local = at.local;
    let matched = match schedule {
        ScheduleTrigger::Once { run_at } => at.now >= *run_at,
        ScheduleTrigger::Daily { time } => same_minute(&local, time.hour(), time.minute()),
        ScheduleTrigger::Weekly { time, days } => {
            let today = local.weekday().num_days_from_sunday();
            days.iter().any(|d| u32::from(*d) % 7 == today)
                && same_minute(&local, time.hour(), time.minute())
        },
        ScheduleTrigger::Hourly { minute } => local.minute() == u32::from(*minute),
        ScheduleTrigger::Custom { cron } => CronSchedule::parse(cron)?.matches(&local),
    };
    Ok(matched)
}

fn same_minute(local: &NaiveDateTime, hour: u32, minute: u32) -> bool {
    local.hour() == hour && local.minute() == minute
}

/// Resolve the sensor value by exact mapping name
pub fn sensor_value(reading: &LastReading, sensor: &str) -> Option<f64> {
    reading.value_of(sensor)
}

/// Compare the current sensor value against the threshold. A missing value
/// never fires.
pub fn threshold_matches(trigger: &ThresholdTrigger, reading: &LastReading) -> bool {
    match sensor_value(reading, &trigger.sensor) {
        Some(value) => trigger.operator.apply(value, trigger.threshold_value),
        None => false,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TriggerEvaluator {
    schedule_dedup: chrono::Duration,
    threshold_cooldown: chrono::Duration,
}

impl Default for TriggerEvaluator {
    fn default() -> Self {
        Self::new(SCHEDULE_DEDUP_SECS, THRESHOLD_COOLDOWN_SECS)
    }
}

impl TriggerEvaluator {
    pub fn new(schedule_dedup_secs: i64, threshold_cooldown_secs: i64) -> Self {
        Self {
            schedule_dedup: chrono::Duration::seconds(schedule_dedup_secs),
            threshold_cooldown: chrono::Duration::seconds(threshold_cooldown_secs),
        }
    }

    pub fn schedule_due(
        &self,
        schedule: &ScheduleTrigger,
        at: &EvalTime,
        last_run: Option<DateTime<Utc>>,
    ) -> FieldResult<bool> {
        if within_cooldown(at.now, last_run, self.schedule_dedup) {
            return Ok(false);
        }
        if let ScheduleTrigger::Once { run_at } = schedule {
            let fired_since = last_run.is_some_and(|last| last >= *run_at);
            return Ok(at.now >= *run_at && !fired_since);
        }
        schedule_matches(schedule, at)
    }

    pub fn threshold_due(
        &self,
        trigger: &ThresholdTrigger,
        reading: &LastReading,
        now: DateTime<Utc>,
        last_run: Option<DateTime<Utc>>,
    ) -> bool {
        !within_cooldown(now, last_run, self.threshold_cooldown) && threshold_matches(trigger, reading)
    }

    /// Decide whether `automation` fires now. Returns the run source when it
    /// does. Manual and event triggers never fire from here.
    pub async fn evaluate<S: DeviceStore + ?Sized>(
        &self,
        automation: &Automation,
        at: &EvalTime,
        devices: &S,
    ) -> FieldResult<Option<RunSource>> {
        let trigger = automation.parse_trigger()?;
        match trigger {
            TriggerConfig::Schedule(schedule) => {
                let due = self.schedule_due(&schedule, at, automation.last_run)?;
                Ok(due.then_some(RunSource::Schedule))
            },
            TriggerConfig::Threshold(threshold) => {
                if within_cooldown(at.now, automation.last_run, self.threshold_cooldown) {
                    return Ok(None);
                }
                let Some(device) = devices.get_device(threshold.device_id).await? else {
                    warn!(
                        "Automation {} watches missing device {}",
                        automation.id, threshold.device_id
                    );
                    return Ok(None);
                };
                let due = self.threshold_due(&threshold, &device.last_reading, at.now, automation.last_run);
                if due {
                    debug!(
                        "Automation {} threshold {} {} {} met",
                        automation.id,
                        threshold.sensor,
                        threshold.operator.symbol(),
                        threshold.threshold_value
                    );
                }
                Ok(due.then_some(RunSource::Threshold))
            },
            TriggerConfig::Manual | TriggerConfig::Event { .. } => Ok(None),
        }
    }
}
