//! Five-field cron matcher
//!
//! `minute hour day-of-month month weekday`, each field either `*` or a
//! comma-separated list of values. Weekday 0 and 7 are both Sunday.
//! Matching is delegated to a `cron::Schedule` built from the checked fields.

use std::fmt;
use std::str::FromStr;

use ::cron::Schedule;
use chrono::{NaiveDateTime, TimeZone, Timelike, Utc};
use errors::{FieldError, FieldResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Any,
    List(Vec<u32>),
}

impl Field {
    fn parse(raw: &str, name: &str, min: u32, max: u32) -> FieldResult<Self> {
        if raw == "*" {
            return Ok(Self::Any);
        }
        let mut values = Vec::new();
        for part in raw.split(',') {
            let value: u32 = part.trim().parse().map_err(|_| {
                FieldError::InvalidConfig {
                    field: format!("cron.{}", name),
                    reason: format!("'{}' is not a number", part),
                }
            })?;
            if value < min || value > max {
                return Err(FieldError::out_of_range(format!("cron.{}", name), value, min, max));
            }
            values.push(value);
        }
        Ok(Self::List(values))
    }

    /// Field text for `cron::Schedule`, values passed through `map`
    fn to_schedule_field(&self, map: impl Fn(u32) -> u32) -> String {
        match self {
            Self::Any => "*".to_string(),
            Self::List(values) => {
                let mut mapped: Vec<u32> = values.iter().map(|v| map(*v)).collect();
                mapped.sort_unstable();
                mapped.dedup();
                let parts: Vec<String> = mapped.iter().map(|v| v.to_string()).collect();
                parts.join(",")
            },
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::List(values) => {
                let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                f.write_str(&parts.join(","))
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> FieldResult<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, dom, month, weekday] = fields.as_slice() else {
            return Err(FieldError::InvalidConfig {
                field: "cron".to_string(),
                reason: format!("expected 5 fields, got {} in '{}'", fields.len(), expr),
            });
        };

        let minute = Field::parse(minute, "minute", 0, 59)?;
        let hour = Field::parse(hour, "hour", 0, 23)?;
        let dom = Field::parse(dom, "day_of_month", 1, 31)?;
        let month = Field::parse(month, "month", 1, 12)?;
        let weekday = Field::parse(weekday, "weekday", 0, 7)?;

        // cron::Schedule: leading seconds field, weekdays 1 (Sunday) ..= 7
        let schedule_expr = format!(
            "0 {} {} {} {} {}",
            minute.to_schedule_field(|v| v),
            hour.to_schedule_field(|v| v),
            dom.to_schedule_field(|v| v),
            month.to_schedule_field(|v| v),
            weekday.to_schedule_field(|d| d % 7 + 1),
        );
        let schedule = Schedule::from_str(&schedule_expr).map_err(|e| FieldError::InvalidConfig {
            field: "cron".to_string(),
            reason: format!("'{}': {}", expr, e),
        })?;

        Ok(Self {
            expr: format!("{} {} {} {} {}", minute, hour, dom, month, weekday),
            schedule,
        })
    }

    /// All five fields must match the wall-clock time (seconds ignored)
    pub fn matches(&self, at: &NaiveDateTime) -> bool {
        let Some(minute_start) = at.with_second(0).and_then(|t| t.with_nanosecond(0)) else {
            return false;
        };
        self.schedule
            .includes(Utc.from_utc_datetime(&minute_start))
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expr == other.expr
    }
}

impl FromStr for CronSchedule {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}
