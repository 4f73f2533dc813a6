//! Field Rules - Automation Engine Library
//!
//! Automation engine for the field controller providing:
//! - Schedule (once/daily/weekly/hourly/cron) and threshold trigger evaluation
//! - Action execution: alerts, log entries, relay and register control
//! - Keyed relay timers for delayed starts and automatic switch-off
//! - Periodic scheduling with a re-entrancy guard
//! - Per-automation daily run log files
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌────────────────┐
//! │  Scheduler  │────▶│   Executor   │────▶│ ConnectionPool │
//! │   (30s)     │     │  (actions)   │     │  (Modbus TCP)  │
//! └─────────────┘     └──────────────┘     └────────────────┘
//!        │                   │    │
//!        ▼                   ▼    ▼
//! ┌─────────────┐     ┌────────┐ ┌─────────────┐
//! │  Evaluator  │     │ Store  │ │ RelayTimers │
//! │ (triggers)  │     │        │ │ (delay/off) │
//! └─────────────┘     └────────┘ └─────────────┘
//! ```

pub mod cron;
pub mod evaluator;
mod executor;
pub mod logger;
mod scheduler;
pub mod timers;

pub use crate::cron::CronSchedule;
pub use evaluator::{
    within_cooldown, EvalTime, TriggerEvaluator, SCHEDULE_DEDUP_SECS, THRESHOLD_COOLDOWN_SECS,
};
pub use executor::ActionExecutor;
pub use logger::{RunLogger, RunLoggerManager};
pub use scheduler::{AutomationScheduler, SchedulerStatus, TickReport, DEFAULT_TICK_SECS};
pub use timers::{PendingTimer, RelayTimers, TimerKey, TimerPurpose};
