//! Per-automation run log files
//!
//! Each automation gets its own directory, `{log_root}/automations/{id}/`,
//! with one file per day: `{YYYYMMDD}_{id}.log`. One line per run:
//! `timestamp [AUTO] id source | status | action results`.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, Utc};
use field_model::{ActionOutcome, ActionStatus, AutomationRunLog};
use parking_lot::Mutex;
use tracing::warn;

/// Logger for a single automation
pub struct RunLogger {
    automation_id: String,
    log_dir: PathBuf,
    current: Mutex<(String, Option<File>)>,
}

impl RunLogger {
    pub fn new(log_root: &Path, automation_id: i64) -> Self {
        let id = automation_id.to_string();
        let dir = log_root.join("automations").join(&id);
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!("Log dir err {:?}: {}", dir, e);
        }

        Self {
            automation_id: id,
            log_dir: dir,
            current: Mutex::new((String::new(), None)),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Append one run line
    pub fn log_run(&self, run: &AutomationRunLog) {
        let mut message = format!(
            "{} | {} | {}",
            run.source,
            run.status.as_str(),
            format_actions(&run.actions)
        );
        if let Some(err) = &run.error {
            message.push_str(" | ");
            message.push_str(err);
        }
        self.write_line(&message);
    }

    fn write_line(&self, message: &str) {
        let today = Local::now().format("%Y%m%d").to_string();
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");

        let mut current = self.current.lock();
        let (date, file) = &mut *current;

        // New day, new file
        if *date != today || file.is_none() {
            let path = self.log_dir.join(format!("{}_{}.log", today, self.automation_id));
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(opened) => {
                    *date = today;
                    *file = Some(opened);
                },
                Err(e) => {
                    warn!("Log open err {:?}: {}", path, e);
                    return;
                },
            }
        }

        if let Some(file) = file.as_mut() {
            let line = format!("{} [AUTO] {} {}\n", timestamp, self.automation_id, message);
            if let Err(e) = file.write_all(line.as_bytes()) {
                warn!("Log write err: {}", e);
            }
        }
    }
}

/// `control#0 OK, alert#1 FAIL(reason)`
fn format_actions(actions: &[ActionOutcome]) -> String {
    if actions.is_empty() {
        return "no action".to_string();
    }

    actions
        .iter()
        .map(|a| {
            let status = match a.status {
                ActionStatus::Executed => "OK".to_string(),
                ActionStatus::Scheduled => "SCHEDULED".to_string(),
                ActionStatus::Failed => {
                    format!("FAIL({})", a.detail.as_deref().unwrap_or("unknown"))
                },
            };
            if a.channels.is_empty() {
                format!("{}#{} {}", a.action_type, a.index, status)
            } else {
                let channels: Vec<String> = a
                    .channels
                    .iter()
                    .map(|c| format!("ch{}={}", c.channel, if c.state { "on" } else { "off" }))
                    .collect();
                format!("{}#{}[{}] {}", a.action_type, a.index, channels.join(","), status)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Hands out one [`RunLogger`] per automation
pub struct RunLoggerManager {
    log_root: PathBuf,
    loggers: Mutex<HashMap<i64, Arc<RunLogger>>>,
}

impl RunLoggerManager {
    pub fn new(log_root: PathBuf) -> Self {
        Self {
            log_root,
            loggers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_logger(&self, automation_id: i64) -> Arc<RunLogger> {
        let mut loggers = self.loggers.lock();
        Arc::clone(
            loggers
                .entry(automation_id)
                .or_insert_with(|| Arc::new(RunLogger::new(&self.log_root, automation_id))),
        )
    }

    pub fn log_run(&self, run: &AutomationRunLog) {
        self.get_logger(run.automation_id).log_run(run);
    }

    pub fn remove_logger(&self, automation_id: i64) {
        self.loggers.lock().remove(&automation_id);
    }
}
