//! Relay timer service
//!
//! Keyed delayed execution. At most one timer exists per
//! `(purpose, device, channel)`; arming a key cancels whatever was pending
//! for it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerPurpose {
    /// Delayed start of a relay write
    Delay,
    /// Automatic switch-off after a duration
    Off,
}

impl TimerPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delay => "delay",
            Self::Off => "off",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TimerKey {
    pub purpose: TimerPurpose,
    pub device_id: i64,
    pub channel: u16,
}

impl TimerKey {
    pub fn new(purpose: TimerPurpose, device_id: i64, channel: u16) -> Self {
        Self {
            purpose,
            device_id,
            channel,
        }
    }
}

impl fmt::Display for TimerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.purpose.as_str(), self.device_id, self.channel)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingTimer {
    pub key: TimerKey,
    pub fires_at: DateTime<Utc>,
    pub remaining_ms: u64,
}

struct TimerEntry {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    fires_at: DateTime<Utc>,
    deadline: Instant,
}

#[derive(Default)]
pub struct RelayTimers {
    timers: Arc<Mutex<HashMap<TimerKey, TimerEntry>>>,
    next_id: AtomicU64,
}

impl RelayTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`, replacing any timer pending for `key`
    pub fn schedule<F>(&self, key: TimerKey, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let timers = Arc::clone(&self.timers);
        let token = cancel.clone();

        // Hold the lock across spawn so the task cannot fire and look itself
        // up before it is registered.
        let mut guard = self.timers.lock();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {},
                _ = tokio::time::sleep(delay) => {
                    let current = {
                        let mut map = timers.lock();
                        match map.get(&key) {
                            Some(entry) if entry.id == id => map.remove(&key).is_some(),
                            _ => false,
                        }
                    };
                    if current {
                        debug!("Relay timer {} fired", key);
                        task.await;
                    }
                }
            }
        });

        let entry = TimerEntry {
            id,
            cancel,
            handle,
            fires_at: Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64),
            deadline: Instant::now() + delay,
        };
        if let Some(previous) = guard.insert(key, entry) {
            previous.cancel.cancel();
            info!("Relay timer {} replaced", key);
        }
        debug!("Relay timer {} armed for {:?}", key, delay);
    }

    pub fn schedule_delayed_start<F>(&self, device_id: i64, channel: u16, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule(TimerKey::new(TimerPurpose::Delay, device_id, channel), delay, task);
    }

    pub fn schedule_off<F>(&self, device_id: i64, channel: u16, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule(TimerKey::new(TimerPurpose::Off, device_id, channel), delay, task);
    }

    pub fn cancel(&self, key: &TimerKey) -> bool {
        match self.timers.lock().remove(key) {
            Some(entry) => {
                entry.cancel.cancel();
                debug!("Relay timer {} cancelled", key);
                true
            },
            None => false,
        }
    }

    pub fn is_pending(&self, key: &TimerKey) -> bool {
        self.timers.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.timers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.lock().is_empty()
    }

    pub fn pending(&self) -> Vec<PendingTimer> {
        let now = Instant::now();
        let mut list: Vec<PendingTimer> = self
            .timers
            .lock()
            .iter()
            .map(|(key, entry)| PendingTimer {
                key: *key,
                fires_at: entry.fires_at,
                remaining_ms: entry.deadline.saturating_duration_since(now).as_millis() as u64,
            })
            .collect();
        list.sort_by_key(|p| p.key);
        list
    }

    /// Cancel every outstanding timer and wait for their tasks to end
    pub async fn shutdown(&self) {
        let entries: Vec<TimerEntry> = self.timers.lock().drain().map(|(_, e)| e).collect();
        let count = entries.len();
        for entry in &entries {
            entry.cancel.cancel();
        }
        for entry in entries {
            let _ = entry.handle.await;
        }
        if count > 0 {
            info!("Cancelled {} relay timers", count);
        }
    }
}
